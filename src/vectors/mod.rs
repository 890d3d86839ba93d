//! Image-vector similarity infrastructure.
//!
//! This module computes one normalized embedding per image, caches it in
//! memory and on disk, and answers similarity queries over a folder.
//!
//! # Architecture
//!
//! - `hasher`: Content fingerprints used as store keys
//! - `embedder`: Model wrapper producing normalized vectors
//! - `store`: JSON file persistence for fingerprint → vector
//! - `cache`: Session LRU keyed by path, mtime and size
//! - `similarity`: Cosine similarity, single and batched
//! - `playlist`: Similarity-ordered slideshow traversal
//! - `similar`: Rank a folder against one image, move matches
//! - `batch`: Background folder vectorization job
//! - `interpret`: Strongest dimensions of a vector

pub mod batch;
pub mod cache;
pub mod embedder;
mod hasher;
pub mod interpret;
pub mod playlist;
pub mod similar;
mod similarity;
mod store;

use std::collections::BTreeMap;

pub use batch::{BatchJob, BatchOptions, BatchOutcome, BatchProgress, BatchReport, BatchVectorizer};
pub use cache::{CacheKey, CacheStats, EmbeddingCache};
pub use embedder::{l2_normalize, FeatureEmbedder, ImageEmbedder};
pub use hasher::{bytes_fingerprint, file_fingerprint};
pub use interpret::{interpret, DimensionScore, ScoreMode};
pub use playlist::{SimilarityPlaylist, TraversalOptions};
pub use similar::{find_similar, move_files, MoveReport, SimilarImage, SimilarOptions};
pub use similarity::{compare_batch, cosine_similarity, l2_norm, SimilarityMatch};
pub use store::VectorStore;

/// A feature vector produced by the embedding model.
pub type Embedding = Vec<f32>;

/// Fingerprint → embedding, ordered for a stable on-disk layout.
pub type VectorMap = BTreeMap<String, Embedding>;

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";

/// Default similarity threshold for traversal and similar-image queries
pub const DEFAULT_THRESHOLD: f32 = 0.65;

//! Engine context shared by every similarity operation.
//!
//! Owns the persisted vector map (loaded from the [`VectorStore`]), the
//! session [`EmbeddingCache`] and the optional [`FeatureEmbedder`]. Built once
//! and passed around as `Arc<EngineContext>`; nothing else mutates the cache
//! or the map.

use std::collections::btree_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::EngineError;
use crate::vectors::{
    file_fingerprint, CacheStats, Embedding, EmbeddingCache, FeatureEmbedder, VectorMap,
    VectorStore,
};

pub struct EngineContext {
    store: VectorStore,
    vectors: RwLock<VectorMap>,
    cache: EmbeddingCache,
    embedder: Option<Arc<dyn FeatureEmbedder>>,
    /// set when `vectors` holds entries not yet written to the store
    dirty: AtomicBool,
}

impl EngineContext {
    /// Build a context and load the persisted vectors.
    ///
    /// Store failures are returned; the caller decides whether to continue
    /// with [`EngineContext::new_empty`].
    pub fn open(
        store: VectorStore,
        cache: EmbeddingCache,
        embedder: Option<Arc<dyn FeatureEmbedder>>,
    ) -> Result<Self, EngineError> {
        let vectors = store.load()?;
        Ok(Self::with_vectors(store, cache, embedder, vectors))
    }

    /// Build a context without touching the store file.
    pub fn new_empty(
        store: VectorStore,
        cache: EmbeddingCache,
        embedder: Option<Arc<dyn FeatureEmbedder>>,
    ) -> Self {
        Self::with_vectors(store, cache, embedder, VectorMap::new())
    }

    fn with_vectors(
        store: VectorStore,
        cache: EmbeddingCache,
        embedder: Option<Arc<dyn FeatureEmbedder>>,
        vectors: VectorMap,
    ) -> Self {
        Self {
            store,
            vectors: RwLock::new(vectors),
            cache,
            embedder,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn embedder(&self) -> Option<&Arc<dyn FeatureEmbedder>> {
        self.embedder.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Number of vectors currently held in memory.
    pub fn vector_count(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn has_fingerprint(&self, fingerprint: &str) -> bool {
        self.vectors
            .read()
            .map(|v| v.contains_key(fingerprint))
            .unwrap_or(false)
    }

    /// Write out unsaved vectors, then replace the in-memory map with the
    /// store's contents and drop the session cache. Called whenever the
    /// working folder changes.
    pub fn reload(&self) -> Result<usize, EngineError> {
        if let Err(e) = self.persist() {
            log::warn!("cannot save vectors before reload, keeping them in memory: {e}");
            self.cache.clear();
            return Ok(self.vector_count());
        }

        self.cache.clear();
        let loaded = self.store.load()?;
        let count = loaded.len();

        let mut vectors = self
            .vectors
            .write()
            .map_err(|e| EngineError::vector(format!("vector map lock poisoned: {e}")))?;
        *vectors = loaded;
        self.dirty.store(false, Ordering::SeqCst);

        Ok(count)
    }

    /// Embedding for `path` without running the model: session cache first,
    /// then the persisted map by fingerprint.
    pub fn cached_embedding(&self, path: &Path) -> Option<Embedding> {
        if let Some(vector) = self.cache.get(path) {
            return Some(vector);
        }

        let fingerprint = match file_fingerprint(path) {
            Ok(fp) => fp,
            Err(e) => {
                log::debug!("{e}");
                return None;
            }
        };

        let vector = self.vectors.read().ok()?.get(&fingerprint).cloned()?;
        self.cache.put(path, vector.clone());
        Some(vector)
    }

    /// Embedding for `path`, computing it on a miss.
    ///
    /// A computed vector goes into the session cache and the in-memory map;
    /// [`EngineContext::persist`] writes it out.
    pub fn embedding(&self, path: &Path) -> Result<Embedding, EngineError> {
        if let Some(vector) = self.cache.get(path) {
            return Ok(vector);
        }

        let fingerprint = file_fingerprint(path)?;
        if let Some(vector) = self
            .vectors
            .read()
            .ok()
            .and_then(|v| v.get(&fingerprint).cloned())
        {
            self.cache.put(path, vector.clone());
            return Ok(vector);
        }

        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| EngineError::AiModel("no embedding model loaded".to_string()))?;

        let vector = embedder.embed(path)?;
        self.insert(fingerprint, vector.clone());
        self.cache.put(path, vector.clone());

        Ok(vector)
    }

    /// Compute embeddings for several files in one batched model call.
    ///
    /// Files that cannot be fingerprinted or embedded are logged and left out.
    /// Results land in the cache and the in-memory map like
    /// [`EngineContext::embedding`].
    pub fn compute_embeddings(
        &self,
        paths: &[PathBuf],
    ) -> Result<Vec<(PathBuf, Embedding)>, EngineError> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| EngineError::AiModel("no embedding model loaded".to_string()))?;

        let mut fingerprints = HashMap::with_capacity(paths.len());
        for path in paths {
            match file_fingerprint(path) {
                Ok(fp) => {
                    fingerprints.insert(path.clone(), fp);
                }
                Err(e) => log::warn!("{e}"),
            }
        }

        let hashed: Vec<PathBuf> = paths
            .iter()
            .filter(|p| fingerprints.contains_key(*p))
            .cloned()
            .collect();

        let computed = embedder.embed_batch(&hashed);
        for (path, vector) in &computed {
            if let Some(fp) = fingerprints.remove(path) {
                self.insert(fp, vector.clone());
            }
            self.cache.put(path, vector.clone());
        }

        Ok(computed)
    }

    /// Add vectors to the in-memory map and return how many were new.
    /// Existing fingerprints are never overwritten; new ones are written by
    /// the next [`EngineContext::persist`].
    pub fn merge(&self, entries: VectorMap) -> usize {
        let Ok(mut vectors) = self.vectors.write() else {
            log::error!("vector map lock poisoned, dropping {} vectors", entries.len());
            return 0;
        };

        let mut inserted = 0;
        for (fingerprint, vector) in entries {
            if let Entry::Vacant(slot) = vectors.entry(fingerprint) {
                slot.insert(vector);
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }

        inserted
    }

    pub fn remember(&self, path: &Path, vector: Embedding) {
        self.cache.put(path, vector);
    }

    fn insert(&self, fingerprint: String, vector: Embedding) {
        if let Ok(mut vectors) = self.vectors.write() {
            if !vectors.contains_key(&fingerprint) {
                vectors.insert(fingerprint, vector);
                self.dirty.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Write the in-memory map to the store if it has unsaved vectors.
    ///
    /// The flag is cleared under the read lock, so an insert racing with the
    /// save is either in this write or marks the map dirty again.
    pub fn persist(&self) -> Result<bool, EngineError> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let vectors = self
            .vectors
            .read()
            .map_err(|e| EngineError::vector(format!("vector map lock poisoned: {e}")))?;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        if let Err(e) = self.store.save(&vectors) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }

        Ok(true)
    }
}

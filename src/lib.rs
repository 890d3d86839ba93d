//! Image-vector similarity engine.
//!
//! Computes one embedding per image, keeps embeddings in a session cache and
//! a durable fingerprint-keyed store, and answers similarity queries: ranked
//! lookups against a target, a similarity-ordered slideshow, and background
//! backfill of whole folders.

pub mod config;
pub mod engine;
pub mod errors;
pub mod listing;
pub mod vectors;

#[cfg(test)]
mod tests;

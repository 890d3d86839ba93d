//! Bounded in-memory LRU of embeddings for the current session.
//!
//! Keys combine the path with the file's modification time and size, so a
//! file edited in place is a miss even though its path did not change.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use lru::LruCache;

use super::Embedding;

/// Identity of a file version: path + mtime + size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

impl CacheKey {
    /// Build the key from the file's current metadata.
    pub fn for_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            modified: meta.modified()?,
            size: meta.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
}

/// LRU cache of embeddings. All mutation goes through one lock.
pub struct EmbeddingCache {
    entries: Mutex<LruCache<CacheKey, Embedding>>,
    max_entries: NonZeroUsize,
}

impl EmbeddingCache {
    /// Create a cache holding at most `max_entries` vectors (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(max_entries)),
            max_entries,
        }
    }

    /// Look up the embedding for the file's current version.
    ///
    /// A hit becomes the most recently used entry. Unreadable metadata is a miss.
    pub fn get(&self, path: &Path) -> Option<Embedding> {
        let key = CacheKey::for_path(path).ok()?;
        self.get_key(&key)
    }

    /// Insert or overwrite the embedding for the file's current version,
    /// evicting the least recently used entry when full.
    pub fn put(&self, path: &Path, vector: Embedding) {
        match CacheKey::for_path(path) {
            Ok(key) => self.put_key(key, vector),
            Err(e) => log::debug!("not caching {}: {e}", path.display()),
        }
    }

    pub fn get_key(&self, key: &CacheKey) -> Option<Embedding> {
        let mut entries = self.entries.lock().ok()?;
        entries.get(key).cloned()
    }

    pub fn put_key(&self, key: CacheKey, vector: Embedding) {
        let Ok(mut entries) = self.entries.lock() else {
            log::error!("embedding cache lock poisoned, dropping entry");
            return;
        };

        if let Some((evicted, _)) = entries.push(key.clone(), vector) {
            if evicted != key {
                log::debug!("evicted {} from embedding cache", evicted.path.display());
            }
        }
    }

    /// Check for an entry without touching recency.
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains(key))
            .unwrap_or(false)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        CacheStats {
            entries,
            max_entries: self.max_entries.get(),
        }
    }
}

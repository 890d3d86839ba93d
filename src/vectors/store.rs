//! Durable fingerprint → embedding store.
//!
//! File format: UTF-8 JSON
//!
//! ```json
//! {"version": 1, "model": "clip-vit-b-32", "vectors": {"<sha256>": [0.1, ...]}}
//! ```
//!
//! Files written by older releases hold the bare `{"<fingerprint>": [...]}`
//! map; those are accepted and upgraded on the next save.
//!
//! The whole map is loaded at session start and written back after a batch of
//! updates, never per item.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::VectorMap;
use crate::errors::EngineError;

/// Current file format version
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    model: &'a str,
    vectors: &'a VectorMap,
}

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    model: String,
    vectors: VectorMap,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoreContents {
    Versioned(StoreFile),
    Legacy(VectorMap),
}

/// Persistence for the fingerprint → embedding map.
pub struct VectorStore {
    path: PathBuf,
    model_id: String,
    /// held for the whole temp-write + rename; every save shares one temp path
    save_lock: Mutex<()>,
}

impl VectorStore {
    /// Create a store for the given file. Vectors written under a different
    /// `model_id` are ignored on load.
    pub fn new(path: PathBuf, model_id: impl Into<String>) -> Self {
        Self {
            path,
            model_id: model_id.into(),
            save_lock: Mutex::new(()),
        }
    }

    /// Get the storage file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Check if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the whole map. A missing file is an empty map, not an error.
    pub fn load(&self) -> Result<VectorMap, EngineError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no vector file at {}, starting fresh", self.path.display());
                return Ok(VectorMap::new());
            }
            Err(e) => {
                return Err(EngineError::vector_with(
                    format!("cannot read vector file {}", self.path.display()),
                    e,
                ))
            }
        };

        let contents: StoreContents = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| {
                EngineError::vector_with(
                    format!("invalid JSON in vector file {}", self.path.display()),
                    e,
                )
            })?;

        let vectors = match contents {
            StoreContents::Versioned(stored) => {
                if stored.version > FORMAT_VERSION {
                    return Err(EngineError::vector(format!(
                        "vector file version {} is newer than supported version {}",
                        stored.version, FORMAT_VERSION
                    )));
                }
                if stored.model != self.model_id {
                    log::warn!(
                        "vector file was built with model '{}', expected '{}'; starting fresh",
                        stored.model,
                        self.model_id
                    );
                    return Ok(VectorMap::new());
                }
                stored.vectors
            }
            StoreContents::Legacy(vectors) => {
                log::info!("upgrading legacy vector file {}", self.path.display());
                vectors
            }
        };

        log::info!("loaded {} vectors from {}", vectors.len(), self.path.display());
        Ok(vectors)
    }

    /// Save the whole map.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, vectors: &VectorMap) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::vector_with(format!("cannot create {}", parent.display()), e)
            })?;
        }

        // poisoned only by a panicked save; the temp file is rewritten anyway
        let _lock = self
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let temp_path = self.temp_path();

        if let Err(e) = self.write_to_file(&temp_path, vectors) {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            EngineError::vector_with(
                format!("cannot replace vector file {}", self.path.display()),
                e,
            )
        })?;

        log::info!("saved {} vectors to {}", vectors.len(), self.path.display());
        Ok(())
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), EngineError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| {
                EngineError::vector_with(format!("cannot delete {}", self.path.display()), e)
            })?;
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_to_file(&self, path: &Path, vectors: &VectorMap) -> Result<(), EngineError> {
        let write_err =
            |e: std::io::Error| EngineError::vector_with(format!("cannot write {}", path.display()), e);

        let file = File::create(path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);

        let contents = StoreFileRef {
            version: FORMAT_VERSION,
            model: &self.model_id,
            vectors,
        };
        serde_json::to_writer(&mut writer, &contents).map_err(|e| {
            EngineError::vector_with(format!("cannot serialize vectors to {}", path.display()), e)
        })?;

        // Flush and sync
        writer.flush().map_err(write_err)?;
        let file = writer.into_inner().map_err(|e| write_err(e.into_error()))?;
        file.sync_all().map_err(write_err)?;

        Ok(())
    }
}

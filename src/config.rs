use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::listing::DEFAULT_EXTENSIONS;
use crate::vectors::embedder::DEFAULT_BATCH_SIZE;
use crate::vectors::{BatchOptions, TraversalOptions, DEFAULT_MODEL, DEFAULT_THRESHOLD};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;
pub const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_STORE_FILE: &str = "vectors.json";
const DEFAULT_CACHE_ENTRIES: usize = 512;
/// Default threshold for picking images to move next to a target
const DEFAULT_SMART_MOVE_THRESHOLD: f32 = 0.80;
const DEFAULT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_THROTTLE_MS: u64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorsConfig {
    /// Vector file, relative to the data directory
    #[serde(default = "default_store_file")]
    pub store_file: String,

    /// Embedding model name (e.g., "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Images per model call
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
}

impl Default for VectorsConfig {
    fn default() -> Self {
        Self {
            store_file: default_store_file(),
            model: default_model(),
            embed_batch_size: default_embed_batch_size(),
        }
    }
}

fn default_store_file() -> String {
    DEFAULT_STORE_FILE.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_embed_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Minimum similarity for traversal and similar-image queries [0.0, 1.0]
    pub threshold: f32,
    /// Minimum similarity when picking images to move [0.0, 1.0]
    pub smart_move_threshold: f32,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            smart_move_threshold: DEFAULT_SMART_MOVE_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub timeout_secs: u64,
    pub throttle_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            throttle_ms: DEFAULT_THROTTLE_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// File extensions treated as images, without the dot
    pub extensions: Vec<String>,
    /// Walk subfolders when listing a folder
    pub include_subfolders: bool,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            include_subfolders: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Embed candidates without a stored vector during traversal
    pub compute_missing: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Missing in files written before versioning
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub vectors: VectorsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub listing: ListingConfig,
    #[serde(default)]
    pub traversal: TraversalConfig,

    /// Flat threshold key of unversioned files
    #[serde(default, skip_serializing)]
    ai_threshold: Option<f32>,

    #[serde(skip_serializing, skip_deserializing)]
    path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            vectors: VectorsConfig::default(),
            cache: CacheConfig::default(),
            similarity: SimilarityConfig::default(),
            batch: BatchConfig::default(),
            listing: ListingConfig::default(),
            traversal: TraversalConfig::default(),
            ai_threshold: None,
            path: PathBuf::new(),
        }
    }
}

impl Config {
    fn migrate(&mut self) -> Result<(), ConfigError> {
        if self.version > CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version, CONFIG_VERSION));
        }

        if self.version == 0 {
            if let Some(threshold) = self.ai_threshold.take() {
                log::info!("migrating ai_threshold={threshold} to similarity.threshold");
                self.similarity.threshold = threshold;
            }
        }

        self.ai_threshold = None;
        self.version = CONFIG_VERSION;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.similarity;
        if !(0.0..=1.0).contains(&sim.threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity.threshold must be between 0.0 and 1.0, got {}",
                sim.threshold
            )));
        }
        if !(0.0..=1.0).contains(&sim.smart_move_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity.smart_move_threshold must be between 0.0 and 1.0, got {}",
                sim.smart_move_threshold
            )));
        }

        if self.vectors.embed_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "vectors.embed_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.vectors.store_file.trim().is_empty() {
            return Err(ConfigError::Invalid("vectors.store_file is empty".to_string()));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }
        if self.batch.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "batch.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.listing.extensions.is_empty() {
            return Err(ConfigError::Invalid("listing.extensions is empty".to_string()));
        }

        Ok(())
    }

    /// Load `config.yaml` from a data directory.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        Self::load_from(&base_path.join(CONFIG_FILE))
    }

    /// Load a config file, creating it with defaults if it does not exist.
    ///
    /// The file is written back when migration or defaults changed its
    /// normalized form.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        // create new if does not exist
        if !path.exists() {
            let mut config = Self::default();
            config.path = path.to_path_buf();
            config.save()?;
            log::info!("created default config at {}", path.display());
            return Ok(config);
        }

        let config_str = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.path = path.to_path_buf();

        config.migrate()?;
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            log::debug!("rewriting normalized config {}", path.display());
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&self.path, config_str)?;
        Ok(())
    }

    /// Path of the loaded config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the config, the vector file and downloaded models.
    pub fn data_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Vector file location; relative paths resolve against the data directory.
    pub fn store_path(&self) -> PathBuf {
        let store = Path::new(&self.vectors.store_file);
        if store.is_absolute() {
            store.to_path_buf()
        } else {
            self.data_dir().join(store)
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            timeout: Duration::from_secs(self.batch.timeout_secs),
            throttle: Duration::from_millis(self.batch.throttle_ms),
            ..BatchOptions::default()
        }
    }

    pub fn traversal_options(&self) -> TraversalOptions {
        TraversalOptions {
            compute_missing: self.traversal.compute_missing,
        }
    }
}

use std::path::PathBuf;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("cannot fingerprint {path:?}: {source}")]
    FileHash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot load image {path:?}: {reason}")]
    ImageLoad { path: PathBuf, reason: String },

    #[error("vector processing failed: {message}")]
    VectorProcessing {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("embedding model unavailable: {0}")]
    AiModel(String),

    #[error("a vectorization job is already running")]
    JobRunning,
}

impl EngineError {
    pub fn vector(message: impl Into<String>) -> Self {
        EngineError::VectorProcessing {
            message: message.into(),
            source: None,
        }
    }

    pub fn vector_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        EngineError::VectorProcessing {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config version {0} is newer than supported version {1}")]
    UnsupportedVersion(u32, u32),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

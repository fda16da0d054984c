use thiserror::Error;

/// Errors surfaced by the cache engine.
///
/// Only genuine network and I/O failures reach the playback collaborator;
/// internal bookkeeping failures (index saves) are logged and absorbed.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The cache directory could not be created. Fatal at construction:
    /// nothing works without a writable directory.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid origin URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The request was cancelled by the caller. Not a failure.
    #[error("Request cancelled")]
    Cancelled,

    /// The engine was torn down or its worker task is gone.
    #[error("Cache engine disconnected")]
    Disconnected,
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

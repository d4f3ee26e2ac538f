use thiserror::Error;

/// Errors raised by the persistent cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode cache entry for {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("corrupted cache artifact {path}: {reason}")]
    Corrupted { path: String, reason: String },

    #[error("failed to decompress cached content for {key}: {reason}")]
    Decompress { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CacheError>;

//! Error types shared by MedMirror crates

use thiserror::Error;

/// Result type alias for shared MedMirror helpers
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors raised by the shared helpers
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

//! Custom error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dump binary not found: {0}")]
    DumpBinaryNotFound(String),

    #[error("mysqldump failed{}: {stderr}", exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default())]
    DumpFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Verification error: {0}")]
    Verification(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// True when the error is the cancellation class, which callers must
    /// not report as a per-database dump failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for kgmem
#[derive(Error, Debug)]
pub enum KgError {
    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A single store line that could not be decoded. Skipped by readers.
    #[error("Corrupt record on line {line}: {reason}")]
    CorruptRecord { line: usize, reason: String },

    /// The store file exists but does not start with the kgmem marker record
    #[error("Refusing to use {path}: first line is not a kgmem marker record")]
    UnsafeStoreFile { path: PathBuf },

    /// Ranked search is compiled out; callers get substring matching instead
    #[error("Ranked search is not available in this build")]
    IndexUnavailable,

    /// Writing the search index snapshot failed
    #[error("Index persistence error: {0}")]
    IndexPersistence(String),

    /// The on-disk index was built for a different graph
    #[error("Stale index: expected fingerprint {expected}, found {found}")]
    StaleIndex { expected: String, found: String },

    /// Namespace cannot be mapped to a file name
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenient Result type using KgError
pub type Result<T> = std::result::Result<T, KgError>;

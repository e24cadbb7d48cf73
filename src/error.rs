//! Error types for the Kestrel library.
//!
//! All failures are represented by the [`KestrelError`] enum. Operations never
//! fail silently: lock contention, storage trouble, schema violations, and
//! merge conflicts each surface as their own variant so callers can decide
//! whether to retry, abort, or skip a single document.

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Kestrel operations.
#[derive(Error, Debug)]
pub enum KestrelError {
    /// I/O errors (file operations, fsync, rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors (missing files, closed storage).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Lock contention on the write, merge, or deletion lock. The caller
    /// retries or aborts; Kestrel never blocks indefinitely on a lock.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Index-related errors (corrupt manifests, bad segment state).
    #[error("Index error: {0}")]
    Index(String),

    /// Schema-related errors (unknown or type-mismatched field). Rejects the
    /// single offending document without corrupting the in-progress segment.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Field-related errors.
    #[error("Field error: {0}")]
    Field(String),

    /// A merge's doc-id map disagrees with current tombstone state. The
    /// merge should be retried against the latest snapshot.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

impl KestrelError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        KestrelError::Storage(msg.into())
    }

    /// Create a new lock error.
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        KestrelError::Lock(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        KestrelError::Index(msg.into())
    }

    /// Create a new schema error.
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        KestrelError::Schema(msg.into())
    }

    /// Create a new field error.
    pub fn field<S: Into<String>>(msg: S) -> Self {
        KestrelError::Field(msg.into())
    }

    /// Create a new consistency error.
    pub fn consistency<S: Into<String>>(msg: S) -> Self {
        KestrelError::Consistency(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        KestrelError::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = KestrelError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = KestrelError::schema("Test schema error");
        assert_eq!(error.to_string(), "Schema error: Test schema error");

        let error = KestrelError::lock("write.lock held");
        assert_eq!(error.to_string(), "Lock error: write.lock held");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let kestrel_error = KestrelError::from(io_error);

        match kestrel_error {
            KestrelError::Io(_) => {} // Expected
            _ => panic!("Expected IO error variant"),
        }
    }
}

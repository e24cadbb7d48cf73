//! Storage abstraction trait and common types.

use std::io::{Read, Seek, Write};

use crate::error::{KestrelError, Result};

/// A trait for storage backends that can store and retrieve data.
///
/// Entry names are relative paths using `/` as the separator; segment files
/// live under per-segment subdirectories (`seg_3/postings.bin`). Backends
/// must create intermediate directories on write and must provide atomic
/// rename-overwrite semantics for [`Storage::rename_file`].
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an entry for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create an entry for writing, truncating any existing entry.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if an entry exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete an entry. Deleting a missing entry is not an error; deleting a
    /// non-empty directory is.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all entries in the storage, recursively, as sorted relative paths.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of an entry in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename an entry, replacing any existing target.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Try to acquire an exclusive advisory lock, writing `content` into the
    /// lock entry. Returns `None` if another holder has the lock.
    fn try_lock(&self, name: &str, content: &[u8]) -> Result<Option<Box<dyn StorageLock>>>;

    /// Sync directory-level metadata to durable storage.
    fn sync(&self) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, flushing and syncing first.
    fn close(&mut self) -> Result<()>;
}

// Implement the traits for boxed trait objects so generic writers/readers can
// run directly over what `Storage` hands out.
impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// An exclusive advisory lock on a storage entry.
///
/// Dropping the lock without calling [`StorageLock::release`] leaves the lock
/// entry behind; stale-lock detection in the index layer cleans those up.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Get the entry name of the lock.
    fn name(&self) -> &str;

    /// Release the lock, deleting the lock entry.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Buffer size for I/O operations.
    pub buffer_size: usize,

    /// Whether to sync every write immediately.
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            buffer_size: 65536,
            sync_writes: false,
        }
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// Entry not found.
    FileNotFound(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// I/O error.
    IoError(String),

    /// Storage is closed.
    StorageClosed,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for KestrelError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockFailed(name) => KestrelError::lock(name),
            other => KestrelError::storage(other.to_string()),
        }
    }
}

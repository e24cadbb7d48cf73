//! Storage backends: the byte-store collaborator the index core writes into.
//!
//! Segment component files, snapshot manifests, and lock files all go through
//! the [`Storage`] trait. The core relies on two guarantees from the backend:
//! entry names behave like relative paths, and [`Storage::rename_file`] is
//! atomic at single-rename granularity (write-new-then-publish).

pub mod file;
pub mod memory;
pub mod structured;
pub mod traits;

pub use file::FsStorage;
pub use memory::MemoryStorage;
pub use structured::{StructReader, StructWriter};
pub use traits::{
    Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

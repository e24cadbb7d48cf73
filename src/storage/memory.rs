//! In-memory storage implementation for testing and temporary indexes.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::traits::{
    Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// An in-memory storage implementation.
///
/// Entry names with `/` separators emulate the segment-directory layout of
/// [`FsStorage`](crate::storage::FsStorage) without touching the filesystem.
/// Renames swap entries under one mutex, matching the atomic-rename guarantee.
#[derive(Debug)]
pub struct MemoryStorage {
    /// The entries stored in memory.
    files: Arc<Mutex<HashMap<String, Box<[u8]>>>>,
    /// Held lock entries.
    locks: Arc<Mutex<HashMap<String, Box<[u8]>>>>,
    /// Storage configuration.
    #[allow(dead_code)]
    config: StorageConfig,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Get the number of entries stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all entries.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(data.clone())))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        let files = self.files.lock();
        if files.contains_key(name) {
            return true;
        }
        // Directory prefixes exist as long as any entry lives below them.
        let prefix = format!("{name}/");
        files.keys().any(|k| k.starts_with(&prefix))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut file_names: Vec<String> = files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn try_lock(&self, name: &str, content: &[u8]) -> Result<Option<Box<dyn StorageLock>>> {
        let mut locks = self.locks.lock();
        if locks.contains_key(name) {
            return Ok(None);
        }
        locks.insert(name.to_string(), content.to_vec().into_boxed_slice());
        // Mirror the lock entry as a regular file so stale-lock inspection
        // can read its content through `open_input`.
        self.files
            .lock()
            .insert(name.to_string(), content.to_vec().into_boxed_slice());

        Ok(Some(Box::new(MemoryLock {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            locks: Arc::clone(&self.locks),
            released: false,
        })))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory input stream.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Box<[u8]>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Box<[u8]>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory output stream that publishes its buffer on flush/close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    files: Arc<Mutex<HashMap<String, Box<[u8]>>>>,
    cursor: Cursor<Vec<u8>>,
}

impl MemoryOutput {
    fn new(name: String, files: Arc<Mutex<HashMap<String, Box<[u8]>>>>) -> Self {
        MemoryOutput {
            name,
            files,
            cursor: Cursor::new(Vec::new()),
        }
    }

    fn publish(&mut self) {
        let data = self.cursor.get_ref().clone().into_boxed_slice();
        self.files.lock().insert(self.name.clone(), data);
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.cursor.position())
    }

    fn close(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.publish();
    }
}

/// An in-memory advisory lock.
#[derive(Debug)]
struct MemoryLock {
    name: String,
    files: Arc<Mutex<HashMap<String, Box<[u8]>>>>,
    locks: Arc<Mutex<HashMap<String, Box<[u8]>>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.locks.lock().remove(&self.name);
            self.files.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("a/b.bin").unwrap();
        output.write_all(b"abc").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("a/b.bin").unwrap();
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abc");
        assert_eq!(storage.file_size("a/b.bin").unwrap(), 3);
    }

    #[test]
    fn test_directory_prefix_exists() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("seg_2/docs.bin").unwrap();
        output.write_all(b"x").unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("seg_2"));
        assert!(storage.file_exists("seg_2/docs.bin"));
        assert!(!storage.file_exists("seg_3"));
    }

    #[test]
    fn test_rename_replaces_target() {
        let storage = MemoryStorage::new_default();

        storage.create_output("t.tmp").unwrap().write_all(b"new").unwrap();
        storage.create_output("t").unwrap().write_all(b"old").unwrap();
        storage.rename_file("t.tmp", "t").unwrap();

        let mut buf = Vec::new();
        storage.open_input("t").unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"new");
        assert!(!storage.file_exists("t.tmp"));
    }

    #[test]
    fn test_lock_round_trip() {
        let storage = MemoryStorage::new_default();

        let mut lock = storage.try_lock("locks/write.lock", b"{}").unwrap().unwrap();
        assert!(storage.try_lock("locks/write.lock", b"{}").unwrap().is_none());
        // Lock content is readable as a regular entry.
        assert!(storage.file_exists("locks/write.lock"));

        lock.release().unwrap();
        assert!(!storage.file_exists("locks/write.lock"));
        assert!(storage.try_lock("locks/write.lock", b"{}").unwrap().is_some());
    }
}

//! Filesystem-backed storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{KestrelError, Result};
use crate::storage::traits::{
    Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// A filesystem storage rooted at one directory.
///
/// Entry names map to paths below the root; `create_output` creates missing
/// parent directories so segment subdirectories come into existence with
/// their first component file. Renames go through `std::fs::rename`, which
/// replaces the target atomically on POSIX systems.
#[derive(Debug)]
pub struct FsStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: StorageConfig,
}

impl FsStorage {
    /// Create a new filesystem storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| KestrelError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(KestrelError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FsStorage { directory, config })
    }

    /// Create a new filesystem storage with default configuration.
    pub fn new_default<P: AsRef<Path>>(directory: P) -> Result<Self> {
        Self::new(directory, StorageConfig::default())
    }

    /// Get the full path for an entry name.
    fn entry_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| KestrelError::storage(format!("Failed to create directory: {e}")))?;
        }
        Ok(())
    }

    fn collect_files(
        &self,
        dir: &Path,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<()> {
        for entry in
            std::fs::read_dir(dir).map_err(|e| StorageError::IoError(e.to_string()))?
        {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            if path.is_dir() {
                self.collect_files(&path, &rel, out)?;
            } else {
                out.push(rel);
            }
        }
        Ok(())
    }
}

impl Storage for FsStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.entry_path(name);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound(name.to_string())
            } else {
                StorageError::IoError(e.to_string())
            }
        })?;

        Ok(Box::new(FsInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.entry_path(name);
        self.ensure_parent(&path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Box::new(FsOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.entry_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name);
        if !path.exists() {
            return Ok(());
        }

        let result = if path.is_dir() {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| StorageError::IoError(format!("Failed to delete {name}: {e}")))?;

        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        self.collect_files(&self.directory, "", &mut files)?;
        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let path = self.entry_path(name);
        let metadata = path.metadata().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound(name.to_string())
            } else {
                StorageError::IoError(e.to_string())
            }
        })?;

        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let old_path = self.entry_path(old_name);
        let new_path = self.entry_path(new_name);
        self.ensure_parent(&new_path)?;

        std::fs::rename(&old_path, &new_path)
            .map_err(|e| StorageError::IoError(format!("Failed to rename file: {e}")))?;

        Ok(())
    }

    fn try_lock(&self, name: &str, content: &[u8]) -> Result<Option<Box<dyn StorageLock>>> {
        let path = self.entry_path(name);
        self.ensure_parent(&path)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(StorageError::IoError(e.to_string()).into()),
        };

        file.write_all(content)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Some(Box::new(FsLock {
            name: name.to_string(),
            path,
            released: false,
        })))
    }

    fn sync(&self) -> Result<()> {
        // Component files are synced individually on close; syncing the root
        // directory entry covers renames.
        if let Ok(dir) = File::open(&self.directory) {
            dir.sync_all()
                .map_err(|e| StorageError::IoError(e.to_string()))?;
        }
        Ok(())
    }
}

/// A buffered file input.
#[derive(Debug)]
pub struct FsInput {
    reader: BufReader<File>,
    size: u64,
}

impl FsInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(|e| KestrelError::storage(format!("Failed to get file metadata: {e}")))?;

        let size = metadata.len();
        let reader = BufReader::with_capacity(buffer_size, file);

        Ok(FsInput { reader, size })
    }
}

impl Read for FsInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FsInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FsInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        // The file handle is released on drop.
        Ok(())
    }
}

/// A buffered file output.
#[derive(Debug)]
pub struct FsOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
}

impl FsOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FsOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
        }
    }
}

impl Write for FsOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FsOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = self.writer.seek(pos)?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for FsOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| KestrelError::storage(format!("Failed to flush: {e}")))?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| KestrelError::storage(format!("Failed to sync: {e}")))?;

        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}

/// An exclusive lock backed by a create-new lock file.
#[derive(Debug)]
struct FsLock {
    name: String,
    path: PathBuf,
    released: bool,
}

impl StorageLock for FsLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            std::fs::remove_file(&self.path)
                .map_err(|e| KestrelError::storage(format!("Failed to release lock: {e}")))?;
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

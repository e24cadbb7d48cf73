//! Index manager: merge policy, lock coordination, and crash-recovery data.
//!
//! The manager is pure policy plus coordination. It decides which segments a
//! merge should consume, hands out the write/merge/deletion locks (failing
//! with a lock error on contention, never blocking), persists the merge-data
//! record that lets a later process clean up a dead merge, and carries the
//! host identity used to judge whether a lock's holder is still alive.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KestrelError, Result};
use crate::index::deletions::DeletionsWriter;
use crate::index::poly_reader::PolyReader;
use crate::index::snapshot::Snapshot;
use crate::storage::{Storage, StorageLock};

/// Entry name of the exclusive writer lock.
pub const WRITE_LOCK: &str = "locks/write.lock";

/// Entry name of the background-merge lock.
pub const MERGE_LOCK: &str = "locks/merge.lock";

/// Entry name of the file-purge lock.
pub const DELETION_LOCK: &str = "locks/deletion.lock";

/// Entry name of the in-flight merge record.
pub const MERGE_DATA: &str = "merge.json";

/// Configuration for merge-eligibility decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManagerConfig {
    /// Deleted fraction above which a segment is recycled.
    pub deletion_threshold: f64,

    /// A segment joins the small-segment tier while its live count is at
    /// most this multiple of the tier's accumulated size; keeps the segment
    /// count roughly logarithmic in the document count.
    pub size_ratio: f64,

    /// Minimum number of segments for a small-segment merge.
    pub min_merge_segments: usize,
}

impl Default for IndexManagerConfig {
    fn default() -> Self {
        IndexManagerConfig {
            deletion_threshold: 0.1,
            size_ratio: 2.0,
            min_merge_segments: 2,
        }
    }
}

/// The persisted record of an in-flight merge.
///
/// Written before a merge starts, removed after its snapshot commits. A
/// record with no live merge lock marks a dead merge whose half-built
/// segment must be discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeData {
    /// Segment id allocated to the merge result.
    pub cutoff: u64,

    /// Ids of the segments being consumed.
    pub segments: Vec<u64>,

    /// Snapshot generation the merge started from.
    pub base_generation: u64,

    /// Host that started the merge.
    pub host: String,

    /// Process that started the merge.
    pub pid: u32,
}

/// Content of a lock entry, used for stale-lock diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    host: String,
    pid: u32,
    token: Uuid,
    created_at: DateTime<Utc>,
}

/// Policy and coordination for one index.
#[derive(Debug)]
pub struct IndexManager {
    config: IndexManagerConfig,
    host: String,
}

impl IndexManager {
    /// Create a manager with default configuration. The host identity comes
    /// from `HOSTNAME` when set.
    pub fn new() -> Self {
        Self::with_config(IndexManagerConfig::default())
    }

    /// Create a manager with the given configuration.
    pub fn with_config(config: IndexManagerConfig) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        IndexManager { config, host }
    }

    /// Override the host identity.
    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    /// The host identity recorded in locks and merge data.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The merge-policy configuration.
    pub fn config(&self) -> &IndexManagerConfig {
        &self.config
    }

    // ---- locks ----

    /// Acquire the exclusive writer lock.
    pub fn acquire_write_lock(&self, storage: &dyn Storage) -> Result<Box<dyn StorageLock>> {
        self.acquire(storage, WRITE_LOCK)
    }

    /// Acquire the background-merge lock.
    pub fn acquire_merge_lock(&self, storage: &dyn Storage) -> Result<Box<dyn StorageLock>> {
        self.acquire(storage, MERGE_LOCK)
    }

    /// Acquire the file-purge lock.
    pub fn acquire_deletion_lock(&self, storage: &dyn Storage) -> Result<Box<dyn StorageLock>> {
        self.acquire(storage, DELETION_LOCK)
    }

    /// Whether a lock entry is currently present.
    pub fn is_locked(&self, storage: &dyn Storage, name: &str) -> bool {
        storage.file_exists(name)
    }

    fn acquire(&self, storage: &dyn Storage, name: &str) -> Result<Box<dyn StorageLock>> {
        self.clear_stale_lock(storage, name)?;
        match storage.try_lock(name, &self.lock_content()?)? {
            Some(lock) => Ok(lock),
            None => Err(KestrelError::lock(format!(
                "{name} is held by another process"
            ))),
        }
    }

    fn lock_content(&self) -> Result<Vec<u8>> {
        let info = LockInfo {
            host: self.host.clone(),
            pid: std::process::id(),
            token: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        Ok(serde_json::to_vec(&info)?)
    }

    /// Remove a lock entry left behind by a dead process on this host.
    /// Returns whether a stale lock was cleared.
    pub fn clear_stale_lock(&self, storage: &dyn Storage, name: &str) -> Result<bool> {
        if !storage.file_exists(name) {
            return Ok(false);
        }

        let mut bytes = Vec::new();
        match storage.open_input(name) {
            Ok(mut input) => {
                input.read_to_end(&mut bytes)?;
            }
            // Racing holder released it between the existence check and now.
            Err(_) => return Ok(false),
        }

        let info: LockInfo = match serde_json::from_slice(&bytes) {
            Ok(info) => info,
            Err(err) => {
                warn!("unreadable lock entry {name}: {err}");
                return Ok(false);
            }
        };

        if info.host == self.host && !process_alive(info.pid) {
            warn!("clearing stale lock {name} left by dead pid {}", info.pid);
            storage.delete_file(name)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Pin a snapshot generation with a shared-intent read lock so the
    /// purger spares it. Each acquisition gets its own entry.
    pub fn acquire_snapshot_read_lock(
        &self,
        storage: &dyn Storage,
        generation: u64,
    ) -> Result<Box<dyn StorageLock>> {
        let name = format!(
            "locks/snapshot_{generation:010}-{}.read.lock",
            Uuid::new_v4()
        );
        match storage.try_lock(&name, &self.lock_content()?)? {
            Some(lock) => Ok(lock),
            None => Err(KestrelError::lock(format!("{name} unexpectedly held"))),
        }
    }

    /// Whether any live read lock pins a snapshot generation. Stale read
    /// locks from dead local processes are cleared along the way.
    pub fn is_snapshot_locked(&self, storage: &dyn Storage, generation: u64) -> Result<bool> {
        let prefix = format!("locks/snapshot_{generation:010}-");
        for name in storage.list_files()? {
            if !name.starts_with(&prefix) {
                continue;
            }
            if !self.clear_stale_lock(storage, &name)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- merge data ----

    /// Persist the in-flight merge record.
    pub fn write_merge_data(
        &self,
        storage: &dyn Storage,
        cutoff: u64,
        segments: Vec<u64>,
        base_generation: u64,
    ) -> Result<MergeData> {
        let data = MergeData {
            cutoff,
            segments,
            base_generation,
            host: self.host.clone(),
            pid: std::process::id(),
        };

        let json = serde_json::to_vec_pretty(&data)?;
        let mut output = storage.create_output(MERGE_DATA)?;
        output.write_all(&json)?;
        output.close()?;
        debug!("wrote merge data: cutoff seg_{cutoff}");
        Ok(data)
    }

    /// Read the in-flight merge record, if present.
    pub fn read_merge_data(&self, storage: &dyn Storage) -> Result<Option<MergeData>> {
        if !storage.file_exists(MERGE_DATA) {
            return Ok(None);
        }
        let mut input = storage.open_input(MERGE_DATA)?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Remove the in-flight merge record.
    pub fn remove_merge_data(&self, storage: &dyn Storage) -> Result<()> {
        storage.delete_file(MERGE_DATA)
    }

    // ---- id and generation allocation ----

    /// Highest segment id in use anywhere: committed directories on disk or
    /// an in-flight merge's cutoff. Ids are never reused, even after
    /// deletion.
    pub fn highest_seg_id(&self, storage: &dyn Storage) -> Result<u64> {
        let mut highest = 0;
        for name in storage.list_files()? {
            let first = name.split('/').next().unwrap_or(&name);
            if let Some(id) = crate::index::segment::Segment::parse_dir_name(first) {
                highest = highest.max(id);
            }
        }
        if let Some(data) = self.read_merge_data(storage)? {
            highest = highest.max(data.cutoff);
        }
        Ok(highest)
    }

    /// Allocate the next segment id.
    pub fn next_seg_id(&self, storage: &dyn Storage) -> Result<u64> {
        Ok(self.highest_seg_id(storage)? + 1)
    }

    /// Allocate the next commit generation, past both the latest published
    /// snapshot and the caller's base view.
    pub fn next_generation(&self, storage: &dyn Storage, base: u64) -> Result<u64> {
        let latest = Snapshot::latest_generation(storage)?.unwrap_or(0);
        Ok(latest.max(base) + 1)
    }

    // ---- merge policy ----

    /// Select segments to merge now. Pure: inspects the reader view and the
    /// deletions writer, mutates nothing.
    ///
    /// Segments with id above `cutoff` are never selected. A segment is
    /// eligible when its deleted fraction crosses the threshold, or when it
    /// falls into the tier of small segments whose combined size stays
    /// within `size_ratio` of each member. `optimize` selects everything at
    /// or below the cutoff.
    pub fn recycle(
        &self,
        poly: &PolyReader,
        del_writer: &DeletionsWriter,
        cutoff: u64,
        optimize: bool,
    ) -> Result<Vec<u64>> {
        struct Candidate {
            id: u64,
            live: u32,
        }

        let mut candidates = Vec::new();
        let mut chosen = Vec::new();

        for reader in poly.readers() {
            let id = reader.seg().id;
            if id > cutoff {
                continue;
            }
            if optimize {
                chosen.push(id);
                continue;
            }

            let deletions = del_writer.seg_deletions(reader)?;
            let doc_max = reader.doc_max();
            let ratio = if doc_max == 0 {
                0.0
            } else {
                deletions.deleted_count() as f64 / doc_max as f64
            };

            if doc_max > 0 && ratio >= self.config.deletion_threshold {
                chosen.push(id);
            } else {
                candidates.push(Candidate {
                    id,
                    live: deletions.live_count(),
                });
            }
        }

        if !optimize {
            // Small-segment tier: gather ascending by live count while each
            // next segment stays within size_ratio of the accumulated tier.
            candidates.sort_by_key(|candidate| candidate.live);
            let mut tier = Vec::new();
            let mut accumulated = 0u64;
            for candidate in &candidates {
                if tier.is_empty()
                    || (candidate.live as f64) <= accumulated as f64 * self.config.size_ratio
                {
                    tier.push(candidate.id);
                    accumulated += candidate.live as u64;
                } else {
                    break;
                }
            }
            if tier.len() >= self.config.min_merge_segments {
                chosen.extend(tier);
            }
        }

        // Return in the reader's segment order so merged doc ids stay
        // stable relative to the pre-merge global ordering.
        let ordered: Vec<u64> = poly
            .readers()
            .iter()
            .map(|reader| reader.seg().id)
            .filter(|id| chosen.contains(id))
            .collect();

        debug!("recycle chose segments {ordered:?} (cutoff {cutoff}, optimize {optimize})");
        Ok(ordered)
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a process on this host is still alive. Only answerable on
/// Linux-style systems; elsewhere locks are never judged stale.
fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_lock_contention_is_a_lock_error() {
        let storage = MemoryStorage::new_default();
        let manager = IndexManager::new();

        let mut lock = manager.acquire_write_lock(&storage).unwrap();
        let err = manager.acquire_write_lock(&storage).unwrap_err();
        assert!(matches!(err, KestrelError::Lock(_)));

        lock.release().unwrap();
        manager.acquire_write_lock(&storage).unwrap();
    }

    #[test]
    fn test_stale_lock_is_cleared() {
        let storage = MemoryStorage::new_default();
        let manager = IndexManager::new();

        // A lock left by a dead pid on this host.
        let info = LockInfo {
            host: manager.host().to_string(),
            pid: u32::MAX - 1,
            token: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let mut output = storage.create_output(WRITE_LOCK).unwrap();
        output.write_all(&serde_json::to_vec(&info).unwrap()).unwrap();
        output.close().unwrap();

        // On Linux the dead pid is detected and the lock cleared; the
        // acquisition then succeeds.
        if cfg!(target_os = "linux") {
            manager.acquire_write_lock(&storage).unwrap();
        }
    }

    #[test]
    fn test_foreign_host_lock_is_not_cleared() {
        let storage = MemoryStorage::new_default();
        let manager = IndexManager::new().with_host("here");

        let info = LockInfo {
            host: "elsewhere".to_string(),
            pid: 1,
            token: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let mut output = storage.create_output(WRITE_LOCK).unwrap();
        output.write_all(&serde_json::to_vec(&info).unwrap()).unwrap();
        output.close().unwrap();

        assert!(!manager.clear_stale_lock(&storage, WRITE_LOCK).unwrap());
    }

    #[test]
    fn test_merge_data_round_trip() {
        let storage = MemoryStorage::new_default();
        let manager = IndexManager::new();

        assert!(manager.read_merge_data(&storage).unwrap().is_none());

        let written = manager
            .write_merge_data(&storage, 9, vec![1, 2, 3], 6)
            .unwrap();
        let read = manager.read_merge_data(&storage).unwrap().unwrap();
        assert_eq!(written, read);
        assert_eq!(read.cutoff, 9);
        assert_eq!(read.segments, vec![1, 2, 3]);

        manager.remove_merge_data(&storage).unwrap();
        assert!(manager.read_merge_data(&storage).unwrap().is_none());
    }

    #[test]
    fn test_highest_seg_id_considers_merge_data() {
        let storage = MemoryStorage::new_default();
        let manager = IndexManager::new();

        assert_eq!(manager.highest_seg_id(&storage).unwrap(), 0);

        let mut output = storage.create_output("seg_4/segmeta.json").unwrap();
        output.write_all(b"{}").unwrap();
        output.close().unwrap();
        assert_eq!(manager.highest_seg_id(&storage).unwrap(), 4);

        manager.write_merge_data(&storage, 7, vec![4], 1).unwrap();
        assert_eq!(manager.highest_seg_id(&storage).unwrap(), 7);
        assert_eq!(manager.next_seg_id(&storage).unwrap(), 8);
    }
}

//! Deferred physical deletion of obsolete index files.
//!
//! Segments referenced by zero live snapshots become deletable, but never
//! synchronously: the purger runs at indexer open and after commits, under
//! the deletion lock, and treats every failure as retry-later. Snapshots
//! pinned by a read lock are spared along with everything they reference,
//! so a reader holding an old generation keeps its files. A dead merge
//! (merge data present, merge lock free) loses its half-built segment.
//!
//! Callers must hold the write lock: with the writer excluded, any
//! unreferenced segment or candidate manifest is provably abandoned.

use ahash::AHashSet;

use log::{debug, warn};

use crate::error::{KestrelError, Result};
use crate::index::manager::{IndexManager, MERGE_DATA, MERGE_LOCK};
use crate::index::segment::Segment;
use crate::index::snapshot::Snapshot;
use crate::storage::Storage;

/// Sweeps files no live snapshot references.
#[derive(Debug)]
pub struct FilePurger<'a> {
    storage: &'a dyn Storage,
    manager: &'a IndexManager,
    current: Option<&'a Snapshot>,
}

impl<'a> FilePurger<'a> {
    /// Create a purger for the given current snapshot (if any is published).
    pub fn new(
        storage: &'a dyn Storage,
        manager: &'a IndexManager,
        current: Option<&'a Snapshot>,
    ) -> Self {
        FilePurger {
            storage,
            manager,
            current,
        }
    }

    /// Delete obsolete files. Failure to delete an individual entry is
    /// logged and retried on a later purge, never fatal; failure to obtain
    /// the deletion lock skips the purge entirely.
    pub fn purge(&self) -> Result<()> {
        let mut deletion_lock = match self.manager.acquire_deletion_lock(self.storage) {
            Ok(lock) => lock,
            Err(KestrelError::Lock(msg)) => {
                warn!("skipping purge, deletion lock unavailable: {msg}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let result = self.purge_inner();
        let _ = deletion_lock.release();
        result
    }

    fn purge_inner(&self) -> Result<()> {
        let files = self.storage.list_files()?;

        let mut spared = AHashSet::new();
        let mut obsolete_snapshots: Vec<(String, Snapshot)> = Vec::new();

        if let Some(current) = self.current {
            spared.insert(Snapshot::filename(current.generation));
            self.expand_into(&current.entries, &files, &mut spared);
        }

        // Obsolete snapshots: spare the read-locked ones, remember the rest.
        let current_generation = self.current.map(|snapshot| snapshot.generation);
        for name in &files {
            let Some(generation) = Snapshot::parse_filename(name) else {
                continue;
            };
            if Some(generation) == current_generation {
                continue;
            }

            let snapshot = match Snapshot::read_file(self.storage, name) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!("unreadable snapshot {name}: {err}");
                    continue;
                }
            };

            if self.manager.is_snapshot_locked(self.storage, generation)? {
                spared.insert(name.clone());
                self.expand_into(&snapshot.entries, &files, &mut spared);
            } else {
                obsolete_snapshots.push((name.clone(), snapshot));
            }
        }

        // A live merge keeps its half-built segment; a dead one loses it.
        if self.manager.is_locked(self.storage, MERGE_LOCK) {
            if let Some(data) = self.manager.read_merge_data(self.storage)? {
                spared.insert(MERGE_DATA.to_string());
                let dir = Segment::dir_for(data.cutoff);
                self.expand_into(std::slice::from_ref(&dir), &files, &mut spared);
            }
        }

        // Everything index-shaped and unspared is a candidate.
        let mut candidates = AHashSet::new();
        for name in &files {
            if name.starts_with("locks/") || spared.contains(name) {
                continue;
            }
            let top = name.split('/').next().unwrap_or(name);
            let is_index_file = Segment::parse_dir_name(top).is_some()
                || Snapshot::parse_filename(name).is_some()
                || (name.starts_with("snapshot_") && name.ends_with(".json.tmp"))
                || name == MERGE_DATA;
            if is_index_file {
                candidates.insert(name.clone());
                if Segment::parse_dir_name(top).is_some() {
                    candidates.insert(top.to_string());
                }
            }
        }
        for (name, _) in &obsolete_snapshots {
            candidates.remove(name);
        }

        // Delete in reverse lexical order so directories go after their
        // contents. Failures just mean another process still holds the file.
        let mut failed = AHashSet::new();
        let mut ordered: Vec<&String> = candidates.iter().collect();
        ordered.sort();
        for name in ordered.iter().rev() {
            if self.storage.delete_file(name).is_err() && self.storage.file_exists(name) {
                warn!("could not purge {name}, will retry later");
                failed.insert((*name).clone());
            }
        }

        // Only drop an obsolete manifest once all of its entries are gone,
        // so a half-failed purge can still be resumed from it.
        for (name, snapshot) in &obsolete_snapshots {
            let blocked = snapshot.entries.iter().any(|entry| {
                failed.contains(entry)
                    || failed
                        .iter()
                        .any(|name| name.starts_with(&format!("{entry}/")))
            });
            if !blocked {
                let _ = self.storage.delete_file(name);
            }
        }

        debug!(
            "purge complete: {} candidates, {} failed",
            candidates.len(),
            failed.len()
        );
        Ok(())
    }

    /// Insert the entries and, for directories, everything beneath them.
    fn expand_into<S: AsRef<str>>(
        &self,
        entries: &[S],
        files: &[String],
        into: &mut AHashSet<String>,
    ) {
        for entry in entries {
            let entry = entry.as_ref();
            into.insert(entry.to_string());
            let prefix = format!("{entry}/");
            for file in files {
                if file.starts_with(&prefix) {
                    into.insert(file.clone());
                }
            }
        }
    }
}

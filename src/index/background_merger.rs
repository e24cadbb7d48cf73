//! Asynchronous compaction.
//!
//! A merge session holds the merge lock — distinct from the write lock, so
//! indexing continues while old segments are streamed into a new one. The
//! merge-data record goes to storage before any segment file, letting a
//! later process discard a half-built merge after a crash. Tombstones are
//! re-read at commit time: deletions committed against an input segment
//! while the merge was in flight are remapped through the doc-id maps into
//! the merged segment, so nothing is lost. An input segment that vanished
//! from the latest snapshot means another process compacted it first; that
//! surfaces as a consistency error and the merge is retried against the
//! latest snapshot.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::analysis::{Analyzer, SimpleAnalyzer};
use crate::error::{KestrelError, Result};
use crate::index::deletions::{DeletionBitmap, DeletionsWriter, DocIdMap};
use crate::index::file_purger::FilePurger;
use crate::index::manager::IndexManager;
use crate::index::poly_reader::PolyReader;
use crate::index::seg_writer::SegWriter;
use crate::index::snapshot::{Snapshot, SnapshotSegment};
use crate::schema::Schema;
use crate::storage::{Storage, StorageLock};

#[derive(Debug)]
struct PreparedMerge {
    snapshot: Snapshot,
    temp_path: String,
    final_path: String,
}

/// One background compaction session.
#[derive(Debug)]
pub struct BackgroundMerger {
    storage: Arc<dyn Storage>,
    manager: Arc<IndexManager>,
    merge_lock: Option<Box<dyn StorageLock>>,
    write_lock: Option<Box<dyn StorageLock>>,
    base: Snapshot,
    input_ids: Vec<u64>,
    doc_maps: Vec<DocIdMap>,
    start_tombstones: Vec<DeletionBitmap>,
    seg_writer: SegWriter,
    merged_id: u64,
    prepared: Option<PreparedMerge>,
}

impl BackgroundMerger {
    /// Begin a merge session with the default analyzer and policy-chosen
    /// inputs. Returns `None` when the policy finds nothing worth merging.
    pub fn open(
        schema: Arc<Schema>,
        storage: Arc<dyn Storage>,
        manager: Arc<IndexManager>,
    ) -> Result<Option<BackgroundMerger>> {
        Self::open_with_options(schema, storage, manager, Arc::new(SimpleAnalyzer), false)
    }

    /// Begin a merge session. `optimize` forces a full merge of every
    /// segment into one, regardless of policy thresholds.
    pub fn open_with_options(
        schema: Arc<Schema>,
        storage: Arc<dyn Storage>,
        manager: Arc<IndexManager>,
        analyzer: Arc<dyn Analyzer>,
        optimize: bool,
    ) -> Result<Option<BackgroundMerger>> {
        let _ = analyzer; // merging re-reads inverted data; nothing is re-analyzed
        let mut merge_lock = Some(manager.acquire_merge_lock(storage.as_ref())?);

        match Self::open_inner(&schema, &storage, &manager, optimize, &mut merge_lock) {
            Ok(merger) => Ok(merger),
            Err(err) => {
                if let Some(mut lock) = merge_lock {
                    let _ = lock.release();
                }
                Err(err)
            }
        }
    }

    fn open_inner(
        schema: &Arc<Schema>,
        storage: &Arc<dyn Storage>,
        manager: &Arc<IndexManager>,
        optimize: bool,
        merge_lock: &mut Option<Box<dyn StorageLock>>,
    ) -> Result<Option<BackgroundMerger>> {
        let base = Snapshot::read_latest(storage.as_ref())?.unwrap_or_else(Snapshot::empty);
        let poly = Arc::new(PolyReader::open_snapshot(storage.as_ref(), base.clone())?);
        let del_writer = DeletionsWriter::new(Arc::clone(&poly));

        let cutoff = poly
            .segments()
            .iter()
            .map(|segment| segment.id)
            .max()
            .unwrap_or(0);
        let chosen = manager.recycle(&poly, &del_writer, cutoff, optimize)?;
        if chosen.is_empty() {
            debug!("recycle found nothing to merge");
            if let Some(mut lock) = merge_lock.take() {
                lock.release()?;
            }
            return Ok(None);
        }

        // The recovery record goes down before any merge output exists.
        let merged_id = manager.next_seg_id(storage.as_ref())?;
        manager.write_merge_data(storage.as_ref(), merged_id, chosen.clone(), base.generation)?;

        let mut seg_writer =
            SegWriter::prep_seg_dir(Arc::clone(storage), schema.as_ref(), merged_id)?;

        let mut doc_maps = Vec::new();
        let mut start_tombstones = Vec::new();

        for reader in poly.readers() {
            if !chosen.contains(&reader.seg().id) {
                continue;
            }

            let tombstones = del_writer.seg_deletions(reader)?;
            let doc_map = DeletionsWriter::generate_doc_map(
                &tombstones,
                reader.doc_max(),
                seg_writer.doc_count(),
            );

            if doc_map.live_count() == 0 {
                seg_writer.delete_segment(reader)?;
            } else {
                seg_writer.merge_segment(reader, &doc_map)?;
            }

            doc_maps.push(doc_map);
            start_tombstones.push(tombstones);
        }

        info!(
            "merging segments {chosen:?} into seg_{merged_id} ({} docs)",
            seg_writer.doc_count()
        );
        Ok(Some(BackgroundMerger {
            storage: Arc::clone(storage),
            manager: Arc::clone(manager),
            merge_lock: merge_lock.take(),
            write_lock: None,
            base,
            input_ids: chosen,
            doc_maps,
            start_tombstones,
            seg_writer,
            merged_id,
            prepared: None,
        }))
    }

    /// Ids of the segments this merge consumes.
    pub fn input_ids(&self) -> &[u64] {
        &self.input_ids
    }

    /// The snapshot the merge started from.
    pub fn base(&self) -> &Snapshot {
        &self.base
    }

    /// Id allocated to the merged segment.
    pub fn merged_id(&self) -> u64 {
        self.merged_id
    }

    /// Phase one: re-validate tombstone state, finish the merged segment,
    /// and write the candidate manifest.
    ///
    /// Takes the write lock for the duration of the commit, so concurrent
    /// indexing sessions must have committed or aborted first; contention
    /// surfaces as a lock error and the prepare can be retried. Deletions
    /// that landed on input segments after merge-start are remapped into
    /// the merged segment here — the doc-id maps are finalized against
    /// commit-time tombstones, not merge-start ones.
    pub fn prepare_commit(&mut self) -> Result<()> {
        if self.prepared.is_some() {
            return Err(KestrelError::index("prepare_commit already called"));
        }

        self.write_lock = Some(self.manager.acquire_write_lock(self.storage.as_ref())?);
        match self.prepare_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(mut lock) = self.write_lock.take() {
                    let _ = lock.release();
                }
                Err(err)
            }
        }
    }

    fn prepare_inner(&mut self) -> Result<()> {
        let latest =
            Snapshot::read_latest(self.storage.as_ref())?.unwrap_or_else(Snapshot::empty);

        // Every input must still be live; a missing one means another
        // process already compacted it and our doc maps are meaningless.
        for &id in &self.input_ids {
            if latest.segment(id).is_none() {
                return Err(KestrelError::consistency(format!(
                    "Segment seg_{id} vanished while merging; retry against the latest snapshot"
                )));
            }
        }

        // Carry forward tombstones that arrived mid-merge.
        let mut merged_dels = DeletionBitmap::new(self.merged_id, self.seg_writer.doc_count());
        for (idx, &id) in self.input_ids.iter().enumerate() {
            let snap_seg = match latest.segment(id) {
                Some(snap_seg) => snap_seg,
                None => continue,
            };
            let Some(path) = &snap_seg.deletions else {
                continue;
            };

            let current = DeletionBitmap::read_from(self.storage.as_ref(), path)?;
            if current.deleted_count() == self.start_tombstones[idx].deleted_count() {
                continue;
            }
            for old_id in current.deleted_ids() {
                if self.start_tombstones[idx].is_deleted(old_id) {
                    continue;
                }
                if let Some(new_id) = self.doc_maps[idx].get(old_id) {
                    merged_dels.delete(new_id)?;
                }
            }
        }

        let generation = self
            .manager
            .next_generation(self.storage.as_ref(), latest.generation)?;

        // Inputs that were fully tombstoned leave nothing behind; an empty
        // merge result just drops them from the snapshot.
        let merged_segment = if self.seg_writer.doc_count() > 0 {
            Some(self.seg_writer.finish()?)
        } else {
            self.seg_writer.abort();
            None
        };

        let merged_del_entry = match (&merged_segment, merged_dels.deleted_count()) {
            (Some(segment), count) if count > 0 => {
                let path = DeletionBitmap::path_for(&segment.dir_name(), generation);
                merged_dels.write_to(self.storage.as_ref(), &path)?;
                debug!(
                    "carried {count} mid-merge deletions into seg_{}",
                    self.merged_id
                );
                Some(path)
            }
            _ => None,
        };

        // Compose the candidate over the LATEST snapshot: its segments
        // minus the consumed inputs, plus the merged result.
        let mut segments: Vec<SnapshotSegment> = latest
            .segments
            .iter()
            .filter(|snap_seg| !self.input_ids.contains(&snap_seg.id))
            .cloned()
            .collect();
        if let Some(segment) = &merged_segment {
            segments.push(SnapshotSegment {
                id: segment.id,
                dir: segment.dir_name(),
                deletions: merged_del_entry,
            });
        }

        let snapshot = Snapshot::compose(generation, segments);
        let temp_path = Snapshot::temp_filename(generation);
        snapshot.write_file(self.storage.as_ref(), &temp_path)?;

        debug!("prepared merge snapshot generation {generation}");
        self.prepared = Some(PreparedMerge {
            final_path: Snapshot::filename(generation),
            temp_path,
            snapshot,
        });
        Ok(())
    }

    /// Phase two: atomically publish the merge, clear the recovery record,
    /// and release both locks. Runs `prepare_commit` first if needed.
    pub fn commit(mut self) -> Result<Snapshot> {
        if self.prepared.is_none() {
            self.prepare_commit()?;
        }

        let prepared = self
            .prepared
            .take()
            .ok_or_else(|| KestrelError::index("Merge commit without a prepared candidate"))?;

        self.storage
            .rename_file(&prepared.temp_path, &prepared.final_path)?;
        self.storage.sync()?;
        self.manager.remove_merge_data(self.storage.as_ref())?;
        info!(
            "merge committed at generation {}: segments {:?} -> seg_{}",
            prepared.snapshot.generation, self.input_ids, self.merged_id
        );

        if let Err(err) = FilePurger::new(
            self.storage.as_ref(),
            &self.manager,
            Some(&prepared.snapshot),
        )
        .purge()
        {
            warn!("purge after merge failed: {err}");
        }

        if let Some(mut lock) = self.write_lock.take() {
            lock.release()?;
        }
        if let Some(mut lock) = self.merge_lock.take() {
            lock.release()?;
        }
        Ok(prepared.snapshot)
    }

    /// Abandon the merge. The half-built segment and the merge-data record
    /// stay behind; with the merge lock released they are recognized as a
    /// dead merge and swept by the next purge, restoring pre-merge state.
    pub fn abort(self) {
        // Drop releases the locks.
    }
}

impl Drop for BackgroundMerger {
    fn drop(&mut self) {
        if let Some(mut lock) = self.write_lock.take() {
            let _ = lock.release();
        }
        if let Some(mut lock) = self.merge_lock.take() {
            let _ = lock.release();
        }
    }
}

/// A request handled by the merge worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeRequest {
    /// Run one policy-driven merge pass.
    Merge,
    /// Force a full merge into one segment.
    Optimize,
    /// Stop the worker.
    Shutdown,
}

/// Runs merge sessions on a dedicated worker thread.
///
/// Requests queue through a channel; the worker drains them one at a time,
/// retrying consistency conflicts against the latest snapshot and treating
/// lock contention as retry-later. Indexing threads never wait on it.
#[derive(Debug)]
pub struct MergeScheduler {
    sender: crossbeam_channel::Sender<MergeRequest>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl MergeScheduler {
    /// Spawn the worker thread.
    pub fn start(
        schema: Arc<Schema>,
        storage: Arc<dyn Storage>,
        manager: Arc<IndexManager>,
    ) -> Result<MergeScheduler> {
        let (sender, receiver) = crossbeam_channel::unbounded::<MergeRequest>();

        let worker = std::thread::Builder::new()
            .name("kestrel-merger".to_string())
            .spawn(move || {
                while let Ok(request) = receiver.recv() {
                    let optimize = match request {
                        MergeRequest::Shutdown => break,
                        MergeRequest::Merge => false,
                        MergeRequest::Optimize => true,
                    };
                    run_merge_pass(&schema, &storage, &manager, optimize);
                }
            })
            .map_err(|err| KestrelError::other(format!("Failed to spawn merge worker: {err}")))?;

        Ok(MergeScheduler {
            sender,
            worker: Some(worker),
        })
    }

    /// Queue one policy-driven merge pass.
    pub fn request_merge(&self) {
        let _ = self.sender.send(MergeRequest::Merge);
    }

    /// Queue a forced full merge.
    pub fn request_optimize(&self) {
        let _ = self.sender.send(MergeRequest::Optimize);
    }

    /// Stop the worker after it drains queued requests.
    pub fn stop(mut self) {
        let _ = self.sender.send(MergeRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(MergeRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// One merge pass: open, commit, retry consistency conflicts a few times.
fn run_merge_pass(
    schema: &Arc<Schema>,
    storage: &Arc<dyn Storage>,
    manager: &Arc<IndexManager>,
    optimize: bool,
) {
    for _ in 0..3 {
        let merger = match BackgroundMerger::open_with_options(
            Arc::clone(schema),
            Arc::clone(storage),
            Arc::clone(manager),
            Arc::new(SimpleAnalyzer),
            optimize,
        ) {
            Ok(Some(merger)) => merger,
            Ok(None) => return,
            Err(KestrelError::Lock(msg)) => {
                debug!("merge pass skipped, lock contention: {msg}");
                return;
            }
            Err(err) => {
                warn!("merge pass failed to open: {err}");
                return;
            }
        };

        match merger.commit() {
            Ok(_) => return,
            Err(KestrelError::Consistency(msg)) => {
                debug!("merge conflicted, retrying against latest snapshot: {msg}");
                continue;
            }
            Err(KestrelError::Lock(msg)) => {
                debug!("merge commit deferred, writer holds the lock: {msg}");
                return;
            }
            Err(err) => {
                warn!("merge pass failed: {err}");
                return;
            }
        }
    }
}

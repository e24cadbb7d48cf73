//! The top-level mutation API.
//!
//! An `Indexer` session holds the exclusive write lock from open to commit.
//! Added documents buffer into one in-progress segment; deletions register
//! against the snapshot visible at open and resolve lazily at commit. The
//! commit itself is two-phase: `prepare_commit` does the slow work — flush,
//! fsync, candidate manifest under a temporary name — and `commit` publishes
//! with a single atomic rename, so the window in which another process could
//! observe anything inconsistent is one rename wide. An abandoned prepare
//! is inert: the previous snapshot is untouched and the candidate's files
//! are swept on the next open.

use std::io::{Read, Write};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::analysis::{Analyzer, SimpleAnalyzer};
use crate::document::Document;
use crate::error::{KestrelError, Result};
use crate::index::deletions::{DeletionBitmap, DeletionsWriter};
use crate::index::file_purger::FilePurger;
use crate::index::inverter::Inverter;
use crate::index::manager::IndexManager;
use crate::index::matcher::DeletionQuery;
use crate::index::poly_reader::PolyReader;
use crate::index::seg_writer::SegWriter;
use crate::index::snapshot::{Snapshot, SnapshotSegment, SCHEMA_ENTRY};
use crate::schema::Schema;
use crate::storage::{Storage, StorageLock};

/// How to open an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing index; fail if none has been committed.
    Open,
    /// Open an existing index, or start a fresh one.
    Create,
    /// Discard any existing contents and start fresh.
    Truncate,
}

#[derive(Debug)]
enum PreparedCommit {
    /// Nothing changed; commit republishes nothing.
    Noop,
    /// A candidate manifest waiting for its atomic publish.
    Publish {
        snapshot: Snapshot,
        temp_path: String,
        final_path: String,
    },
}

/// A single writer session over one index.
#[derive(Debug)]
pub struct Indexer {
    schema: Arc<Schema>,
    storage: Arc<dyn Storage>,
    manager: Arc<IndexManager>,
    inverter: Inverter,
    write_lock: Option<Box<dyn StorageLock>>,
    base: Snapshot,
    poly: Arc<PolyReader>,
    del_writer: DeletionsWriter,
    seg_writer: Option<SegWriter>,
    imports: Vec<Arc<dyn Storage>>,
    optimize_requested: bool,
    prepared: Option<PreparedCommit>,
}

impl Indexer {
    /// Open a writer session with the default analyzer.
    ///
    /// Fails with a lock error if another writer holds the write lock, a
    /// schema error if the stored schema disagrees with the given one, and
    /// an index error when `OpenMode::Open` finds no committed index.
    pub fn open(
        schema: Arc<Schema>,
        storage: Arc<dyn Storage>,
        manager: Arc<IndexManager>,
        mode: OpenMode,
    ) -> Result<Indexer> {
        Self::open_with_analyzer(schema, storage, manager, mode, Arc::new(SimpleAnalyzer))
    }

    /// Open a writer session with a caller-supplied analyzer.
    pub fn open_with_analyzer(
        schema: Arc<Schema>,
        storage: Arc<dyn Storage>,
        manager: Arc<IndexManager>,
        mode: OpenMode,
        analyzer: Arc<dyn Analyzer>,
    ) -> Result<Indexer> {
        let mut write_lock = Some(manager.acquire_write_lock(storage.as_ref())?);

        match Self::open_inner(&schema, &storage, &manager, mode, analyzer, &mut write_lock) {
            Ok(indexer) => Ok(indexer),
            Err(err) => {
                if let Some(mut lock) = write_lock {
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
        mode: OpenMode,
        analyzer: Arc<dyn Analyzer>,
        write_lock: &mut Option<Box<dyn StorageLock>>,
    ) -> Result<Indexer> {
        let latest = Snapshot::read_latest(storage.as_ref())?;
        let base = match (mode, latest) {
            (OpenMode::Open, None) => {
                return Err(KestrelError::index(
                    "No committed index at storage target; open with OpenMode::Create",
                ));
            }
            (OpenMode::Truncate, _) => Snapshot::empty(),
            (_, Some(snapshot)) => snapshot,
            (OpenMode::Create, None) => Snapshot::empty(),
        };

        // Sweep orphaned candidates and anything no longer referenced. The
        // write lock is held, so unreferenced files are provably abandoned.
        let current = (base.generation > 0).then_some(&base);
        if let Err(err) = FilePurger::new(storage.as_ref(), manager, current).purge() {
            warn!("purge at open failed: {err}");
        }

        if mode != OpenMode::Truncate && storage.file_exists(SCHEMA_ENTRY) {
            let mut bytes = Vec::new();
            storage.open_input(SCHEMA_ENTRY)?.read_to_end(&mut bytes)?;
            let stored: Schema = serde_json::from_slice(&bytes)?;
            if stored != **schema {
                return Err(KestrelError::schema(
                    "Schema does not match the one stored in the index",
                ));
            }
        }

        let poly = Arc::new(PolyReader::open_snapshot(storage.as_ref(), base.clone())?);
        let del_writer = DeletionsWriter::new(Arc::clone(&poly));
        let inverter = Inverter::new(Arc::clone(schema), analyzer);

        debug!("indexer open at generation {}", base.generation);
        Ok(Indexer {
            schema: Arc::clone(schema),
            storage: Arc::clone(storage),
            manager: Arc::clone(manager),
            inverter,
            write_lock: write_lock.take(),
            base,
            poly,
            del_writer,
            seg_writer: None,
            imports: Vec::new(),
            optimize_requested: false,
            prepared: None,
        })
    }

    /// The schema this session validates against.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The reader view this session's deletions register against.
    pub fn reader(&self) -> &Arc<PolyReader> {
        &self.poly
    }

    fn check_mutable(&self) -> Result<()> {
        if self.prepared.is_some() {
            return Err(KestrelError::index(
                "Commit already prepared; no further mutations in this session",
            ));
        }
        Ok(())
    }

    fn ensure_seg_writer(&mut self) -> Result<&mut SegWriter> {
        if self.seg_writer.is_none() {
            let seg_id = self.manager.next_seg_id(self.storage.as_ref())?;
            self.seg_writer = Some(SegWriter::prep_seg_dir(
                Arc::clone(&self.storage),
                &self.schema,
                seg_id,
            )?);
        }
        self.seg_writer
            .as_mut()
            .ok_or_else(|| KestrelError::index("Segment writer unavailable"))
    }

    /// Validate a document against the schema and buffer it into the
    /// in-progress segment.
    ///
    /// A schema rejection affects only this document; the session and the
    /// in-progress segment stay intact.
    pub fn add_doc(&mut self, doc: Document) -> Result<()> {
        self.add_doc_with_boost(doc, 1.0)
    }

    /// [`Indexer::add_doc`] with an explicit boost, reserved for the
    /// scoring layer.
    pub fn add_doc_with_boost(&mut self, doc: Document, boost: f32) -> Result<()> {
        self.check_mutable()?;
        let canonical = self.schema.validate_doc(&doc)?;
        let inv = self.inverter.invert(&canonical, boost)?;
        self.ensure_seg_writer()?.add_doc(&inv)?;
        Ok(())
    }

    /// Register a deletion of every visible document containing `term` in
    /// `field`. Field names resolve case-insensitively. Resolved lazily at
    /// commit; never touches the in-progress segment.
    pub fn delete_by_term<T: Into<String>>(&mut self, field: &str, term: T) -> Result<()> {
        self.check_mutable()?;
        let canonical = self
            .schema
            .resolve(field)
            .ok_or_else(|| KestrelError::schema(format!("Unknown field '{field}'")))?
            .to_string();
        self.del_writer.delete_by_term(canonical, term);
        Ok(())
    }

    /// Register a deletion of every visible document matching `query`.
    pub fn delete_by_query(&mut self, query: Arc<dyn DeletionQuery>) -> Result<()> {
        self.check_mutable()?;
        self.del_writer.delete_by_query(query);
        Ok(())
    }

    /// Tombstone one document by its global id in this session's view.
    /// Re-deleting the same id is a no-op.
    pub fn delete_by_doc_id(&mut self, global_id: u32) -> Result<bool> {
        self.check_mutable()?;
        self.del_writer.delete_by_doc_id(global_id)
    }

    /// Import another index's committed segments. The content is read and
    /// folded into this session's segment at commit time (copy-on-commit).
    pub fn add_index(&mut self, other: Arc<dyn Storage>) -> Result<()> {
        self.check_mutable()?;
        self.imports.push(other);
        Ok(())
    }

    /// Request consolidation of all visible segments into one at the next
    /// commit.
    pub fn optimize(&mut self) -> Result<()> {
        self.check_mutable()?;
        self.optimize_requested = true;
        Ok(())
    }

    /// Phase one: flush the in-progress segment and deletions to durable
    /// storage and write the candidate manifest under a temporary name.
    ///
    /// On failure the previous snapshot is untouched. Calling `commit`
    /// without an explicit prepare runs this implicitly.
    pub fn prepare_commit(&mut self) -> Result<()> {
        if self.prepared.is_some() {
            return Err(KestrelError::index("prepare_commit already called"));
        }

        let generation = self
            .manager
            .next_generation(self.storage.as_ref(), self.base.generation)?;

        // Imports: stream foreign committed segments into the in-progress
        // segment, dropping their tombstoned documents.
        let imports = std::mem::take(&mut self.imports);
        for import_storage in &imports {
            let foreign = PolyReader::open(import_storage.as_ref())?;
            for reader in foreign.readers() {
                let tombstones = reader
                    .deletions()
                    .cloned()
                    .unwrap_or_else(|| DeletionBitmap::new(reader.seg().id, reader.doc_max()));
                let writer = self.ensure_seg_writer()?;
                let doc_map = DeletionsWriter::generate_doc_map(
                    &tombstones,
                    reader.doc_max(),
                    writer.doc_count(),
                );
                if doc_map.live_count() == 0 {
                    writer.delete_segment(reader)?;
                } else {
                    writer.add_segment(reader, &doc_map)?;
                }
            }
        }

        // Optimize: fold every visible segment into the new one, applying
        // all registered deletions along the way.
        let mut consumed: Vec<u64> = Vec::new();
        if self.optimize_requested {
            let poly = Arc::clone(&self.poly);
            for reader in poly.readers() {
                let deletions = self.del_writer.seg_deletions(reader)?;
                let writer = self.ensure_seg_writer()?;
                let doc_map = DeletionsWriter::generate_doc_map(
                    &deletions,
                    reader.doc_max(),
                    writer.doc_count(),
                );
                if doc_map.live_count() == 0 {
                    writer.delete_segment(reader)?;
                } else {
                    writer.merge_segment(reader, &doc_map)?;
                }
                consumed.push(reader.seg().id);
            }
        }

        // Resolve pending deletions into new tombstone files, except for
        // segments optimize already folded away.
        let del_updates = if consumed.is_empty() {
            self.del_writer.finish(self.storage.as_ref(), generation)?
        } else {
            Vec::new()
        };

        // Finish the in-progress segment; a segment that ended up empty is
        // discarded rather than committed.
        let new_segment = match &mut self.seg_writer {
            Some(writer) if writer.has_docs() => Some(writer.finish()?),
            Some(writer) => {
                writer.abort();
                None
            }
            None => None,
        };
        self.seg_writer = None;

        if new_segment.is_none() && del_updates.is_empty() && consumed.is_empty() {
            debug!("nothing to commit at generation {generation}");
            self.prepared = Some(PreparedCommit::Noop);
            return Ok(());
        }

        // Compose the candidate: surviving base segments with their updated
        // tombstone entries, plus the new segment.
        let mut segments: Vec<SnapshotSegment> = Vec::new();
        for snap_seg in &self.base.segments {
            if consumed.contains(&snap_seg.id) {
                continue;
            }
            let deletions = del_updates
                .iter()
                .find(|update| update.seg_id == snap_seg.id)
                .map(|update| update.path.clone())
                .or_else(|| snap_seg.deletions.clone());
            segments.push(SnapshotSegment {
                id: snap_seg.id,
                dir: snap_seg.dir.clone(),
                deletions,
            });
        }
        if let Some(segment) = &new_segment {
            segments.push(SnapshotSegment {
                id: segment.id,
                dir: segment.dir_name(),
                deletions: None,
            });
        }

        self.write_schema_if_needed()?;

        let snapshot = Snapshot::compose(generation, segments);
        let temp_path = Snapshot::temp_filename(generation);
        snapshot.write_file(self.storage.as_ref(), &temp_path)?;

        debug!("prepared candidate snapshot generation {generation}");
        self.prepared = Some(PreparedCommit::Publish {
            final_path: Snapshot::filename(generation),
            temp_path,
            snapshot,
        });
        Ok(())
    }

    /// Phase two: atomically publish the candidate snapshot and release the
    /// write lock. Runs `prepare_commit` first if it hasn't been called.
    ///
    /// Returns the published snapshot (or the unchanged base snapshot when
    /// there was nothing to commit).
    pub fn commit(mut self) -> Result<Snapshot> {
        if self.prepared.is_none() {
            self.prepare_commit()?;
        }

        let snapshot = match self.prepared.take() {
            Some(PreparedCommit::Noop) | None => self.base.clone(),
            Some(PreparedCommit::Publish {
                snapshot,
                temp_path,
                final_path,
            }) => {
                self.storage.rename_file(&temp_path, &final_path)?;
                self.storage.sync()?;
                info!("committed snapshot generation {}", snapshot.generation);

                if let Err(err) =
                    FilePurger::new(self.storage.as_ref(), &self.manager, Some(&snapshot)).purge()
                {
                    warn!("purge after commit failed: {err}");
                }
                snapshot
            }
        };

        if let Some(mut lock) = self.write_lock.take() {
            lock.release()?;
        }
        Ok(snapshot)
    }

    /// Abandon the session. Any prepared candidate stays inert on disk and
    /// is swept on the next open; the previous snapshot is untouched.
    pub fn abort(self) {
        // Drop releases the write lock.
    }

    fn write_schema_if_needed(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self.schema.as_ref())?;
        if self.storage.file_exists(SCHEMA_ENTRY) {
            let mut existing = Vec::new();
            self.storage
                .open_input(SCHEMA_ENTRY)?
                .read_to_end(&mut existing)?;
            if existing == json {
                return Ok(());
            }
        }
        let mut output = self.storage.create_output(SCHEMA_ENTRY)?;
        output.write_all(&json)?;
        output.close()?;
        Ok(())
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        if let Some(mut lock) = self.write_lock.take() {
            let _ = lock.release();
        }
    }
}

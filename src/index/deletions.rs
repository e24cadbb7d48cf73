//! Tombstone tracking and compacting doc-id maps.
//!
//! Deletions never rewrite a segment: they accumulate as per-segment bitmaps
//! persisted in new files under each committing generation. Within one
//! segment's life tombstones are monotonic; an id, once deleted, is never
//! resurrected. At merge time [`DeletionsWriter::generate_doc_map`] turns a
//! segment's tombstones into the dense remapping every component consumes.

use ahash::{AHashMap, AHashSet};
use bit_vec::BitVec;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{KestrelError, Result};
use crate::index::matcher::{DeletionQuery, Matcher, TermQuery};
use crate::index::poly_reader::PolyReader;
use crate::index::seg_reader::SegReader;
use crate::storage::{Storage, StructReader, StructWriter};

const DELETIONS_MAGIC: u32 = 0x4B44_454C; // "KDEL"

/// A bitmap of tombstoned local document ids for one segment.
#[derive(Debug, Clone)]
pub struct DeletionBitmap {
    /// Segment this bitmap belongs to.
    seg_id: u64,

    /// Bit set = document deleted.
    bits: BitVec,

    /// Total number of documents in the segment.
    doc_max: u32,

    /// Number of deleted documents.
    deleted_count: u32,
}

impl DeletionBitmap {
    /// Create an empty bitmap for a segment with `doc_max` documents.
    pub fn new(seg_id: u64, doc_max: u32) -> Self {
        DeletionBitmap {
            seg_id,
            bits: BitVec::from_elem(doc_max as usize, false),
            doc_max,
            deleted_count: 0,
        }
    }

    /// The segment this bitmap belongs to.
    pub fn seg_id(&self) -> u64 {
        self.seg_id
    }

    /// Total number of documents covered.
    pub fn doc_max(&self) -> u32 {
        self.doc_max
    }

    /// Number of tombstoned documents.
    pub fn deleted_count(&self) -> u32 {
        self.deleted_count
    }

    /// Number of live documents.
    pub fn live_count(&self) -> u32 {
        self.doc_max - self.deleted_count
    }

    /// Fraction of documents tombstoned, in `[0.0, 1.0]`.
    pub fn deletion_ratio(&self) -> f64 {
        if self.doc_max == 0 {
            0.0
        } else {
            self.deleted_count as f64 / self.doc_max as f64
        }
    }

    /// Mark a document as deleted. Returns whether the bit was newly set;
    /// re-deleting is a no-op.
    pub fn delete(&mut self, local_id: u32) -> Result<bool> {
        if local_id >= self.doc_max {
            return Err(KestrelError::index(format!(
                "Doc id {local_id} out of range for segment {} (doc_max {})",
                self.seg_id, self.doc_max
            )));
        }

        let already = self.bits.get(local_id as usize).unwrap_or(false);
        if !already {
            self.bits.set(local_id as usize, true);
            self.deleted_count += 1;
        }
        Ok(!already)
    }

    /// Check if a document is deleted.
    pub fn is_deleted(&self, local_id: u32) -> bool {
        self.bits.get(local_id as usize).unwrap_or(false)
    }

    /// Iterate the tombstoned local ids in increasing order.
    pub fn deleted_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| *bit)
            .map(|(id, _)| id as u32)
    }

    /// Write the bitmap to storage under `path`.
    pub fn write_to(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let output = storage.create_output(path)?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(DELETIONS_MAGIC)?;
        writer.write_u32(1)?; // version
        writer.write_u64(self.seg_id)?;
        writer.write_u64(self.doc_max as u64)?;
        writer.write_u64(self.deleted_count as u64)?;
        writer.write_bytes(&self.bits.to_bytes())?;

        writer.close()
    }

    /// Read a bitmap from storage.
    pub fn read_from(storage: &dyn Storage, path: &str) -> Result<Self> {
        let input = storage.open_input(path)?;
        let mut reader = StructReader::new(input)?;

        let magic = reader.read_u32()?;
        if magic != DELETIONS_MAGIC {
            return Err(KestrelError::index(format!(
                "Invalid deletions file format in {path}"
            )));
        }
        let version = reader.read_u32()?;
        if version != 1 {
            return Err(KestrelError::index(format!(
                "Unsupported deletions version {version} in {path}"
            )));
        }

        let seg_id = reader.read_u64()?;
        let doc_max = reader.read_u64()? as u32;
        let deleted_count = reader.read_u64()? as u32;
        let bytes = reader.read_bytes()?;
        reader.verify_checksum()?;

        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(doc_max as usize);

        Ok(DeletionBitmap {
            seg_id,
            bits,
            doc_max,
            deleted_count,
        })
    }

    /// Entry name for a segment's tombstone file under one generation.
    pub fn path_for(seg_dir: &str, generation: u64) -> String {
        format!("{seg_dir}/deletions-{generation:010}.bin")
    }
}

impl Matcher for DeletionBitmap {
    fn matches(&self, local_id: u32) -> bool {
        self.is_deleted(local_id)
    }
}

/// A compacting remap from old local ids to new local ids.
///
/// Indexed by old local id: `-1` means the document was dropped, any other
/// value is its new id (dense, strictly increasing, offset by the segment's
/// position within the merged numbering).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocIdMap {
    map: Vec<i32>,
}

impl DocIdMap {
    /// Wrap a raw map.
    pub fn new(map: Vec<i32>) -> Self {
        DocIdMap { map }
    }

    /// A map that keeps every document, shifted by `offset`.
    pub fn identity(doc_max: u32, offset: u32) -> Self {
        DocIdMap {
            map: (0..doc_max).map(|id| (id + offset) as i32).collect(),
        }
    }

    /// Number of old local ids covered.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map covers no documents.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// New id for an old local id, or `None` if the document was dropped.
    pub fn get(&self, old_id: u32) -> Option<u32> {
        match self.map.get(old_id as usize) {
            Some(&new_id) if new_id >= 0 => Some(new_id as u32),
            _ => None,
        }
    }

    /// Number of surviving documents.
    pub fn live_count(&self) -> u32 {
        self.map.iter().filter(|&&id| id >= 0).count() as u32
    }

    /// The raw map.
    pub fn as_slice(&self) -> &[i32] {
        &self.map
    }
}

/// One segment's freshly written tombstone state, produced by
/// [`DeletionsWriter::finish`].
#[derive(Debug, Clone)]
pub struct SegDelUpdate {
    /// Segment id.
    pub seg_id: u64,

    /// Entry name of the new tombstone file.
    pub path: String,

    /// Tombstone count after the update.
    pub del_count: u32,

    /// The full resolved bitmap.
    pub bitmap: DeletionBitmap,
}

#[derive(Debug, Default)]
struct WorkingState {
    /// Working bitmap copies, by segment id.
    bitmaps: AHashMap<u64, DeletionBitmap>,
    /// Segments whose working bitmap gained tombstones.
    dirty: AHashSet<u64>,
    /// Unresolved delete-by-term/query operations, in arrival order.
    pending: Vec<Arc<dyn DeletionQuery>>,
    /// Resolved per-segment bitmaps, tagged with the pending-queue length
    /// they were computed at.
    cache: AHashMap<u64, (usize, DeletionBitmap)>,
}

/// Tracks logical deletions against one reader view and resolves them to
/// per-segment tombstones at commit time.
///
/// Doc-id deletions apply immediately to the working bitmaps; term and query
/// deletions stay pending until [`DeletionsWriter::seg_deletions`] or
/// [`DeletionsWriter::finish`] resolves them against each segment.
#[derive(Debug)]
pub struct DeletionsWriter {
    poly: Arc<PolyReader>,
    state: Mutex<WorkingState>,
}

impl DeletionsWriter {
    /// Create a writer over the given reader view.
    pub fn new(poly: Arc<PolyReader>) -> Self {
        DeletionsWriter {
            poly,
            state: Mutex::new(WorkingState::default()),
        }
    }

    /// The reader view deletions are registered against.
    pub fn poly(&self) -> &Arc<PolyReader> {
        &self.poly
    }

    /// Tombstone one document by its global id in this writer's view.
    /// Returns whether the document was newly deleted; re-deleting the same
    /// id is a no-op.
    pub fn delete_by_doc_id(&self, global_id: u32) -> Result<bool> {
        let (seg_idx, local_id) = self.poly.seg_for(global_id)?;
        let reader = &self.poly.readers()[seg_idx];
        let seg_id = reader.seg().id;

        let mut state = self.state.lock();
        let bitmap = state.bitmaps.entry(seg_id).or_insert_with(|| {
            reader
                .deletions()
                .cloned()
                .unwrap_or_else(|| DeletionBitmap::new(seg_id, reader.doc_max()))
        });

        let newly = bitmap.delete(local_id)?;
        if newly {
            state.dirty.insert(seg_id);
            state.cache.remove(&seg_id);
        }
        Ok(newly)
    }

    /// Register a deletion of every document containing `term` in `field`.
    /// Resolved lazily, per segment, at commit time.
    pub fn delete_by_term<S: Into<String>, T: Into<String>>(&self, field: S, term: T) {
        self.delete_by_query(Arc::new(TermQuery::new(field, term)));
    }

    /// Register a deletion of every document matching `query`. Resolved
    /// lazily, per segment, at commit time.
    pub fn delete_by_query(&self, query: Arc<dyn DeletionQuery>) {
        let mut state = self.state.lock();
        state.pending.push(query);
        state.cache.clear();
    }

    /// Whether any deletions have been registered since the last finish.
    pub fn has_updates(&self) -> bool {
        let state = self.state.lock();
        !state.dirty.is_empty() || !state.pending.is_empty()
    }

    /// Compute the full tombstone state for one segment: its persisted
    /// bitmap, plus doc-id deletions, plus pending term/query deletions
    /// resolved against the segment. Results are cached until new pending
    /// deletions arrive.
    pub fn seg_deletions(&self, reader: &SegReader) -> Result<DeletionBitmap> {
        let seg_id = reader.seg().id;

        let (pending, base) = {
            let state = self.state.lock();
            let version = state.pending.len();
            if let Some((cached_version, cached)) = state.cache.get(&seg_id)
                && *cached_version == version
            {
                return Ok(cached.clone());
            }

            let base = state
                .bitmaps
                .get(&seg_id)
                .cloned()
                .or_else(|| reader.deletions().cloned())
                .unwrap_or_else(|| DeletionBitmap::new(seg_id, reader.doc_max()));
            (state.pending.clone(), base)
        };

        // Resolve outside the lock: matcher construction reads postings.
        let mut bitmap = base;
        for query in &pending {
            let matcher = query.matcher_for(reader)?;
            for local_id in 0..reader.doc_max() {
                if matcher.matches(local_id) {
                    bitmap.delete(local_id)?;
                }
            }
        }

        let mut state = self.state.lock();
        state.cache.insert(seg_id, (pending.len(), bitmap.clone()));
        Ok(bitmap)
    }

    /// Produce the doc-id map for one segment being merged: documents
    /// matched by `deletions` map to -1, all others get dense new ids
    /// starting at `offset`.
    pub fn generate_doc_map(deletions: &dyn Matcher, doc_max: u32, offset: u32) -> DocIdMap {
        let mut map = Vec::with_capacity(doc_max as usize);
        let mut next = offset;

        for local_id in 0..doc_max {
            if deletions.matches(local_id) {
                map.push(-1);
            } else {
                map.push(next as i32);
                next += 1;
            }
        }

        DocIdMap::new(map)
    }

    /// Resolve all registered deletions and persist new tombstone files
    /// under `generation` for every segment whose state changed.
    ///
    /// Consumes the pending queue; the writer is clean afterwards.
    pub fn finish(&self, storage: &dyn Storage, generation: u64) -> Result<Vec<SegDelUpdate>> {
        let mut updates = Vec::new();

        for reader in self.poly.readers() {
            let resolved = self.seg_deletions(reader)?;
            if resolved.deleted_count() <= reader.del_count() {
                continue;
            }

            let path = DeletionBitmap::path_for(&reader.seg().dir_name(), generation);
            resolved.write_to(storage, &path)?;
            updates.push(SegDelUpdate {
                seg_id: reader.seg().id,
                path,
                del_count: resolved.deleted_count(),
                bitmap: resolved,
            });
        }

        let mut state = self.state.lock();
        state.pending.clear();
        state.dirty.clear();
        state.cache.clear();

        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_bitmap_delete_is_idempotent() {
        let mut bitmap = DeletionBitmap::new(1, 4);

        assert!(bitmap.delete(2).unwrap());
        assert!(!bitmap.delete(2).unwrap());
        assert_eq!(bitmap.deleted_count(), 1);
        assert_eq!(bitmap.live_count(), 3);
        assert!(bitmap.is_deleted(2));
        assert!(!bitmap.is_deleted(0));
    }

    #[test]
    fn test_bitmap_rejects_out_of_range() {
        let mut bitmap = DeletionBitmap::new(1, 4);
        assert!(bitmap.delete(4).is_err());
    }

    #[test]
    fn test_bitmap_round_trip() {
        let storage = MemoryStorage::new_default();
        let mut bitmap = DeletionBitmap::new(7, 10);
        bitmap.delete(0).unwrap();
        bitmap.delete(9).unwrap();

        let path = DeletionBitmap::path_for("seg_7", 3);
        assert_eq!(path, "seg_7/deletions-0000000003.bin");
        bitmap.write_to(&storage, &path).unwrap();

        let back = DeletionBitmap::read_from(&storage, &path).unwrap();
        assert_eq!(back.seg_id(), 7);
        assert_eq!(back.doc_max(), 10);
        assert_eq!(back.deleted_count(), 2);
        assert!(back.is_deleted(0));
        assert!(back.is_deleted(9));
        assert!(!back.is_deleted(5));
        assert_eq!(back.deleted_ids().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_generate_doc_map_fixture() {
        // Deletions at local ids {2, 5} out of 6 docs.
        let mut bitmap = DeletionBitmap::new(1, 6);
        bitmap.delete(2).unwrap();
        bitmap.delete(5).unwrap();

        let map = DeletionsWriter::generate_doc_map(&bitmap, 6, 0);
        assert_eq!(map.as_slice(), &[0, 1, -1, 2, 3, -1]);
        assert_eq!(map.live_count(), 4);
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.get(2), None);
    }

    #[test]
    fn test_generate_doc_map_offset() {
        let bitmap = DeletionBitmap::new(1, 3);
        let map = DeletionsWriter::generate_doc_map(&bitmap, 3, 10);
        assert_eq!(map.as_slice(), &[10, 11, 12]);
    }

    #[test]
    fn test_identity_map() {
        let map = DocIdMap::identity(3, 5);
        assert_eq!(map.as_slice(), &[5, 6, 7]);
        assert_eq!(map.live_count(), 3);
    }
}

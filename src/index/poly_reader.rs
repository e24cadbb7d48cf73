//! Composite reader over all live segments.
//!
//! A `PolyReader` opens one snapshot and presents its segments as a single
//! logical index: each segment gets a starting global doc id (the cumulative
//! sum of prior segments' doc counts), global lookups binary-search those
//! offsets, and local ids translate back by addition. The offsets are built
//! once at open and never mutated; a new snapshot means a new reader.

use std::sync::Arc;

use crate::document::Document;
use crate::error::{KestrelError, Result};
use crate::index::data::{
    locate, DataReader, DocVectors, PolyPostingsReader, PolySortReader, PolyStoredReader,
    PolyVectorsReader, PostingsReader, SortCacheReader, StoredReader, VectorsReader,
};
use crate::index::seg_reader::SegReader;
use crate::index::segment::Segment;
use crate::index::snapshot::Snapshot;
use crate::storage::Storage;

/// One logical view over every segment a snapshot references.
#[derive(Debug)]
pub struct PolyReader {
    snapshot: Snapshot,
    readers: Vec<Arc<SegReader>>,
    offsets: Vec<u32>,
    doc_maxes: Vec<u32>,
    doc_max: u32,
    postings: PolyPostingsReader,
    stored: PolyStoredReader,
    vectors: PolyVectorsReader,
    sort: PolySortReader,
}

impl PolyReader {
    /// Open the current (highest-generation) snapshot, or an empty view if
    /// the index has never committed.
    pub fn open(storage: &dyn Storage) -> Result<PolyReader> {
        let snapshot = Snapshot::read_latest(storage)?.unwrap_or_else(Snapshot::empty);
        Self::open_snapshot(storage, snapshot)
    }

    /// Open a specific snapshot.
    pub fn open_snapshot(storage: &dyn Storage, snapshot: Snapshot) -> Result<PolyReader> {
        let mut readers = Vec::with_capacity(snapshot.segments.len());
        let mut offsets = Vec::with_capacity(snapshot.segments.len());
        let mut doc_maxes = Vec::with_capacity(snapshot.segments.len());
        let mut next_offset = 0u32;

        for snap_seg in &snapshot.segments {
            let reader = SegReader::open(storage, snap_seg)?;
            offsets.push(next_offset);
            doc_maxes.push(reader.doc_max());
            next_offset += reader.doc_max();
            readers.push(Arc::new(reader));
        }

        let postings = PostingsReader::aggregator(
            readers.iter().map(|r| Arc::clone(r.postings())).collect(),
            offsets.clone(),
        );
        let stored = StoredReader::aggregator(
            readers.iter().map(|r| Arc::clone(r.stored())).collect(),
            offsets.clone(),
        );
        let vectors = VectorsReader::aggregator(
            readers.iter().map(|r| Arc::clone(r.vectors())).collect(),
            offsets.clone(),
        );
        let sort = SortCacheReader::aggregator(
            readers.iter().map(|r| Arc::clone(r.sort())).collect(),
            offsets.clone(),
        );

        Ok(PolyReader {
            snapshot,
            readers,
            offsets,
            doc_maxes,
            doc_max: next_offset,
            postings,
            stored,
            vectors,
            sort,
        })
    }

    /// The snapshot this reader was opened over.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The per-segment readers, in global order.
    pub fn readers(&self) -> &[Arc<SegReader>] {
        &self.readers
    }

    /// The segment descriptors, in global order.
    pub fn segments(&self) -> Vec<&Segment> {
        self.readers.iter().map(|reader| reader.seg()).collect()
    }

    /// Starting global doc id per segment.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Total number of documents, including deleted ones.
    pub fn doc_max(&self) -> u32 {
        self.doc_max
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> u32 {
        self.readers.iter().map(|reader| reader.doc_count()).sum()
    }

    /// Number of tombstoned documents.
    pub fn del_count(&self) -> u32 {
        self.readers.iter().map(|reader| reader.del_count()).sum()
    }

    /// Find the segment owning a global doc id: (segment index, local id).
    pub fn seg_for(&self, global_id: u32) -> Result<(usize, u32)> {
        locate(&self.offsets, &self.doc_maxes, global_id)
            .ok_or_else(|| KestrelError::index(format!("Doc id {global_id} out of range")))
    }

    /// Translate a segment-local id to its global id.
    pub fn local_to_global(&self, seg_idx: usize, local_id: u32) -> u32 {
        self.offsets[seg_idx] + local_id
    }

    /// Whether a global doc id is tombstoned.
    pub fn is_deleted(&self, global_id: u32) -> Result<bool> {
        let (seg_idx, local_id) = self.seg_for(global_id)?;
        Ok(self.readers[seg_idx].is_deleted(local_id))
    }

    /// The stored document at a global id, deleted or not.
    pub fn document(&self, global_id: u32) -> Result<Document> {
        self.stored.document(global_id).cloned()
    }

    /// Global ids of all live documents, ascending.
    pub fn live_doc_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        for (seg_idx, reader) in self.readers.iter().enumerate() {
            for local_id in 0..reader.doc_max() {
                if !reader.is_deleted(local_id) {
                    ids.push(self.local_to_global(seg_idx, local_id));
                }
            }
        }
        ids
    }

    /// Postings for one term across all segments, as (global doc id, freq).
    pub fn postings(&self, field: &str, term: &str) -> Vec<(u32, u32)> {
        self.postings.postings(field, term)
    }

    /// Number of documents containing the term.
    pub fn doc_freq(&self, field: &str, term: &str) -> u32 {
        self.postings.doc_freq(field, term)
    }

    /// Term vectors of the document at a global id.
    pub fn term_vectors(&self, global_id: u32) -> Result<&DocVectors> {
        self.vectors.doc_vectors(global_id)
    }

    /// The sort-cache composite: per-segment caches plus offsets, for
    /// consumers that iterate all segments.
    pub fn sort(&self) -> &PolySortReader {
        &self.sort
    }
}

/// The two ways to compose a reader, chosen explicitly by the caller:
/// a direct view over one segment, or the aggregated view over a snapshot.
#[derive(Debug)]
pub enum IndexReader {
    /// Direct read of a single segment.
    Seg(Arc<SegReader>),
    /// Aggregated read across a snapshot's segments.
    Poly(Arc<PolyReader>),
}

impl IndexReader {
    /// Number of documents, including deleted ones.
    pub fn doc_max(&self) -> u32 {
        match self {
            IndexReader::Seg(reader) => reader.doc_max(),
            IndexReader::Poly(reader) => reader.doc_max(),
        }
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> u32 {
        match self {
            IndexReader::Seg(reader) => reader.doc_count(),
            IndexReader::Poly(reader) => reader.doc_count(),
        }
    }

    /// Whether a doc id (local or global, per the composition) is deleted.
    pub fn is_deleted(&self, doc_id: u32) -> bool {
        match self {
            IndexReader::Seg(reader) => reader.is_deleted(doc_id),
            IndexReader::Poly(reader) => reader.is_deleted(doc_id).unwrap_or(false),
        }
    }

    /// The stored document at a doc id.
    pub fn document(&self, doc_id: u32) -> Result<Document> {
        match self {
            IndexReader::Seg(reader) => reader.document(doc_id),
            IndexReader::Poly(reader) => reader.document(doc_id),
        }
    }
}

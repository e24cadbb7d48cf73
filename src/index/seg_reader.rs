//! Single-segment composite reader.
//!
//! A `SegReader` borrows one committed segment's data immutably for its
//! lifetime: the component readers plus the tombstone bitmap the owning
//! snapshot references. It never mutates segment state.

use std::sync::Arc;

use crate::document::Document;
use crate::error::Result;
use crate::index::data::{PostingsReader, SortCacheReader, StoredReader, VectorsReader};
use crate::index::deletions::DeletionBitmap;
use crate::index::segment::Segment;
use crate::index::snapshot::SnapshotSegment;
use crate::storage::Storage;

/// A read-only view over one segment.
#[derive(Debug)]
pub struct SegReader {
    segment: Segment,
    postings: Arc<PostingsReader>,
    stored: Arc<StoredReader>,
    vectors: Arc<VectorsReader>,
    sort: Arc<SortCacheReader>,
    deletions: Option<DeletionBitmap>,
}

impl SegReader {
    /// Open the segment a snapshot references, including its tombstones.
    pub fn open(storage: &dyn Storage, snap_seg: &SnapshotSegment) -> Result<Self> {
        let segment = Segment::read_meta(storage, &snap_seg.dir)?;
        Self::open_segment(storage, segment, snap_seg.deletions.as_deref())
    }

    /// Open a segment from its descriptor and an optional tombstone file.
    pub fn open_segment(
        storage: &dyn Storage,
        segment: Segment,
        deletions_path: Option<&str>,
    ) -> Result<Self> {
        let dir = segment.dir_name();

        let postings = if segment.components.contains_key("postings") {
            PostingsReader::open(storage, &dir)?
        } else {
            PostingsReader::empty()
        };
        let stored = if segment.components.contains_key("stored") {
            StoredReader::open(storage, &dir)?
        } else {
            StoredReader::empty()
        };
        let vectors = if segment.components.contains_key("vectors") {
            VectorsReader::open(storage, &dir)?
        } else {
            VectorsReader::empty()
        };
        let sort = if segment.components.contains_key("sort") {
            SortCacheReader::open(storage, &dir)?
        } else {
            SortCacheReader::empty()
        };

        let deletions = match deletions_path {
            Some(path) => Some(DeletionBitmap::read_from(storage, path)?),
            None => None,
        };

        Ok(SegReader {
            segment,
            postings: Arc::new(postings),
            stored: Arc::new(stored),
            vectors: Arc::new(vectors),
            sort: Arc::new(sort),
            deletions,
        })
    }

    /// The segment descriptor.
    pub fn seg(&self) -> &Segment {
        &self.segment
    }

    /// Number of documents, including deleted ones.
    pub fn doc_max(&self) -> u32 {
        self.segment.doc_count
    }

    /// Number of tombstoned documents.
    pub fn del_count(&self) -> u32 {
        self.deletions
            .as_ref()
            .map_or(0, DeletionBitmap::deleted_count)
    }

    /// Number of live documents.
    pub fn doc_count(&self) -> u32 {
        self.doc_max() - self.del_count()
    }

    /// Whether a local doc id is tombstoned.
    pub fn is_deleted(&self, local_id: u32) -> bool {
        self.deletions
            .as_ref()
            .is_some_and(|bitmap| bitmap.is_deleted(local_id))
    }

    /// The tombstone bitmap, if the segment has deletions.
    pub fn deletions(&self) -> Option<&DeletionBitmap> {
        self.deletions.as_ref()
    }

    /// The postings component.
    pub fn postings(&self) -> &Arc<PostingsReader> {
        &self.postings
    }

    /// The stored-documents component.
    pub fn stored(&self) -> &Arc<StoredReader> {
        &self.stored
    }

    /// The term-vectors component.
    pub fn vectors(&self) -> &Arc<VectorsReader> {
        &self.vectors
    }

    /// The sort-cache component.
    pub fn sort(&self) -> &Arc<SortCacheReader> {
        &self.sort
    }

    /// The stored document at a local id. Tombstoned documents are still
    /// readable; callers filter through [`SegReader::is_deleted`].
    pub fn document(&self, local_id: u32) -> Result<Document> {
        self.stored.document(local_id).cloned()
    }
}

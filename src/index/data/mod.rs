//! Per-component segment data: writers and readers.
//!
//! Each component (postings, stored documents, term vectors, sort caches)
//! knows how to write its slice of a new segment and how to read it back.
//! Writers share one surface — [`DataWriter`] — so the segment writer and
//! the merge path can route new documents, absorbed segments, and remapped
//! merges to every component uniformly. Readers compose across segments via
//! [`DataReader::aggregator`].

pub mod postings;
pub mod sort;
pub mod stored;
pub mod vectors;

use std::sync::Arc;

use crate::error::Result;
use crate::index::deletions::DocIdMap;
use crate::index::inverter::InvertedDoc;
use crate::index::seg_reader::SegReader;
use crate::storage::Storage;

pub use postings::{PolyPostingsReader, Posting, PostingsReader, PostingsWriter};
pub use sort::{PolySortReader, SortCacheReader, SortWriter};
pub use stored::{PolyStoredReader, StoredReader, StoredWriter};
pub use vectors::{DocVectors, PolyVectorsReader, VectorsReader, VectorsWriter};

/// One component's writer for a segment under construction.
pub trait DataWriter: std::fmt::Debug {
    /// Component name, used as the metadata key in the segment descriptor.
    fn component(&self) -> &'static str;

    /// Record one freshly inverted document at `local_id`.
    fn add_inverted_doc(&mut self, inv: &InvertedDoc, local_id: u32) -> Result<()>;

    /// Absorb an existing segment's contribution, remapping local ids
    /// through `doc_map` (used by merge and by index import).
    fn add_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()>;

    /// Drop a fully-tombstoned segment's contribution.
    fn delete_segment(&mut self, _reader: &SegReader) -> Result<()> {
        Ok(())
    }

    /// Merge path: ids are remapped but the segment is not dropped.
    fn merge_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()> {
        self.add_segment(reader, doc_map)
    }

    /// Flush and fsync the component's files under `seg_dir`, returning the
    /// metadata blob to embed in the segment descriptor.
    fn finish(&mut self, storage: &dyn Storage, seg_dir: &str) -> Result<serde_json::Value>;
}

/// One component's reader, composable across segments.
pub trait DataReader: Sized {
    /// The composite type presenting one logical view over many segments.
    type Composite;

    /// Build a composite reader; `offsets[i]` is the starting global doc id
    /// of segment `i`.
    fn aggregator(readers: Vec<Arc<Self>>, offsets: Vec<u32>) -> Self::Composite;
}

/// Locate the segment owning a global doc id: binary search the offsets,
/// subtract to get the local id.
pub fn locate(offsets: &[u32], doc_maxes: &[u32], global_id: u32) -> Option<(usize, u32)> {
    let idx = offsets.partition_point(|&offset| offset <= global_id);
    if idx == 0 {
        return None;
    }
    let seg_idx = idx - 1;
    let local_id = global_id - offsets[seg_idx];
    if local_id < doc_maxes[seg_idx] {
        Some((seg_idx, local_id))
    } else {
        None
    }
}

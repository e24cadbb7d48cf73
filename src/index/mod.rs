//! Index core: segment lifecycle, deletions, commit protocol, and merging.
//!
//! The pieces, leaves first:
//! - [`Snapshot`]: the versioned manifest naming the live segment set
//! - [`Segment`]: descriptor of one immutable unit of committed data
//! - [`deletions`]: tombstone tracking and compacting doc-id maps
//! - [`data`]: per-component writers/readers (postings, stored docs, term
//!   vectors, sort caches)
//! - [`SegWriter`] / [`SegReader`]: materialize and read one segment
//! - [`PolyReader`]: one logical reader over all live segments
//! - [`Indexer`]: the mutation API with two-phase commit
//! - [`IndexManager`]: merge policy, locks, and crash-recovery records
//! - [`BackgroundMerger`]: compaction concurrent with indexing
//! - [`FilePurger`]: deferred deletion of obsolete files

pub mod background_merger;
pub mod data;
pub mod deletions;
pub mod file_purger;
pub mod indexer;
pub mod inverter;
pub mod manager;
pub mod matcher;
pub mod poly_reader;
pub mod seg_reader;
pub mod seg_writer;
pub mod segment;
pub mod snapshot;
pub mod sort_cache;

pub use background_merger::{BackgroundMerger, MergeScheduler};
pub use deletions::{DeletionBitmap, DeletionsWriter, DocIdMap};
pub use file_purger::FilePurger;
pub use indexer::{Indexer, OpenMode};
pub use inverter::{InvertedDoc, Inverter};
pub use manager::{IndexManager, IndexManagerConfig, MergeData};
pub use matcher::{DeletionQuery, Matcher, TermQuery};
pub use poly_reader::{IndexReader, PolyReader};
pub use seg_reader::SegReader;
pub use seg_writer::SegWriter;
pub use segment::Segment;
pub use snapshot::{Snapshot, SnapshotSegment};
pub use sort_cache::SortCache;

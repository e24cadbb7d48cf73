//! Segment descriptors.
//!
//! A segment is one immutable unit of committed index data: a directory of
//! component files plus a `segmeta.json` descriptor. Segment ids increase
//! monotonically over the life of an index and are never reused, so a stale
//! reference can always be told apart from a recycled one.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};
use crate::storage::Storage;

/// Filename of the descriptor inside a segment directory.
pub const SEG_META: &str = "segmeta.json";

/// Descriptor of one immutable segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    /// Format version of the descriptor.
    pub format: u32,

    /// Unique id within the index's lifetime.
    pub id: u64,

    /// Number of documents, including deleted ones.
    pub doc_count: u32,

    /// Number of deletions folded in when the segment was written. Live
    /// tombstone counts come from the deletions component, not from here.
    pub del_count: u32,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Per-component metadata blobs, keyed by component name.
    pub components: BTreeMap<String, serde_json::Value>,
}

impl Segment {
    /// Create a descriptor for a new, empty segment.
    pub fn new(id: u64) -> Self {
        Segment {
            format: 1,
            id,
            doc_count: 0,
            del_count: 0,
            created_at: Utc::now(),
            components: BTreeMap::new(),
        }
    }

    /// Directory name for a segment id.
    pub fn dir_for(id: u64) -> String {
        format!("seg_{id}")
    }

    /// Directory name of this segment.
    pub fn dir_name(&self) -> String {
        Self::dir_for(self.id)
    }

    /// Parse a segment id out of a directory name.
    pub fn parse_dir_name(name: &str) -> Option<u64> {
        name.strip_prefix("seg_")?.parse().ok()
    }

    /// Path of the descriptor file for this segment.
    pub fn meta_path(&self) -> String {
        format!("{}/{SEG_META}", self.dir_name())
    }

    /// Write the descriptor into the segment directory.
    pub fn write_meta(&self, storage: &dyn Storage) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut output = storage.create_output(&self.meta_path())?;
        output.write_all(&json)?;
        output.close()?;
        Ok(())
    }

    /// Read a descriptor from a segment directory.
    pub fn read_meta(storage: &dyn Storage, dir: &str) -> Result<Segment> {
        let mut input = storage.open_input(&format!("{dir}/{SEG_META}"))?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        let segment: Segment = serde_json::from_slice(&bytes)?;

        if segment.format != 1 {
            return Err(KestrelError::index(format!(
                "Unsupported segment format {} in {dir}",
                segment.format
            )));
        }
        Ok(segment)
    }
}

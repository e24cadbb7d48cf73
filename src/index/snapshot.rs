//! Snapshot manifests: the unit of commit.
//!
//! A snapshot is an ordered manifest of the entries (segment directories and
//! metadata files) making up one consistent view of the index. Snapshots are
//! immutable once written; every commit produces a new file with the next
//! generation number. Readers pick the highest generation present; the
//! atomic-rename publish step is what makes a candidate visible.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};
use crate::storage::Storage;

/// Name of the persisted schema entry referenced by every snapshot.
pub const SCHEMA_ENTRY: &str = "schema.json";

/// One segment referenced by a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotSegment {
    /// Segment id.
    pub id: u64,

    /// Segment directory name.
    pub dir: String,

    /// Entry name of the live tombstone file for this segment, if any.
    /// Deletion files are written new under each committing generation,
    /// never updated in place.
    pub deletions: Option<String>,
}

/// A versioned manifest naming the live segment set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Format version of the manifest.
    pub format: u32,

    /// Commit generation; monotonically increasing.
    pub generation: u64,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// All entries this snapshot references, in order: metadata files first,
    /// then segment directories and their deletion files.
    pub entries: Vec<String>,

    /// The live segments, in global doc-id order.
    pub segments: Vec<SnapshotSegment>,
}

impl Snapshot {
    /// The empty snapshot an index starts from before its first commit.
    pub fn empty() -> Self {
        Snapshot {
            format: 1,
            generation: 0,
            created_at: Utc::now(),
            entries: Vec::new(),
            segments: Vec::new(),
        }
    }

    /// Build a snapshot for `generation` over the given segments, deriving
    /// the entry list.
    pub fn compose(generation: u64, segments: Vec<SnapshotSegment>) -> Self {
        let mut entries = vec![SCHEMA_ENTRY.to_string()];
        for seg in &segments {
            entries.push(seg.dir.clone());
            if let Some(deletions) = &seg.deletions {
                entries.push(deletions.clone());
            }
        }

        Snapshot {
            format: 1,
            generation,
            created_at: Utc::now(),
            entries,
            segments,
        }
    }

    /// Manifest filename for a generation. Generations are zero-padded so
    /// lexical order matches numeric order.
    pub fn filename(generation: u64) -> String {
        format!("snapshot_{generation:010}.json")
    }

    /// Temporary filename a candidate is written under before publication.
    pub fn temp_filename(generation: u64) -> String {
        format!("{}.tmp", Self::filename(generation))
    }

    /// Parse a generation out of a published manifest filename. Candidate
    /// (`.tmp`) names do not parse.
    pub fn parse_filename(name: &str) -> Option<u64> {
        name.strip_prefix("snapshot_")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    /// Find the highest published generation in storage.
    pub fn latest_generation(storage: &dyn Storage) -> Result<Option<u64>> {
        let mut latest = None;
        for name in storage.list_files()? {
            if let Some(generation) = Self::parse_filename(&name) {
                latest = latest.max(Some(generation));
            }
        }
        Ok(latest)
    }

    /// Read the current (highest-generation) snapshot, if one is published.
    pub fn read_latest(storage: &dyn Storage) -> Result<Option<Snapshot>> {
        match Self::latest_generation(storage)? {
            Some(generation) => {
                let snapshot = Self::read_file(storage, &Self::filename(generation))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Read a snapshot manifest from storage.
    pub fn read_file(storage: &dyn Storage, path: &str) -> Result<Snapshot> {
        let mut input = storage.open_input(path)?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        if snapshot.format != 1 {
            return Err(KestrelError::index(format!(
                "Unsupported snapshot format {} in {path}",
                snapshot.format
            )));
        }
        Ok(snapshot)
    }

    /// Write this snapshot to storage under `path`, fsyncing before return.
    pub fn write_file(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut output = storage.create_output(path)?;
        output.write_all(&json)?;
        output.close()?;
        Ok(())
    }

    /// Look up a referenced segment by id.
    pub fn segment(&self, id: u64) -> Option<&SnapshotSegment> {
        self.segments.iter().find(|seg| seg.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_filename_round_trip() {
        assert_eq!(Snapshot::filename(3), "snapshot_0000000003.json");
        assert_eq!(Snapshot::parse_filename("snapshot_0000000003.json"), Some(3));
        assert_eq!(Snapshot::parse_filename("snapshot_0000000003.json.tmp"), None);
        assert_eq!(Snapshot::parse_filename("seg_3"), None);
    }

    #[test]
    fn test_compose_entries() {
        let snapshot = Snapshot::compose(
            2,
            vec![
                SnapshotSegment {
                    id: 1,
                    dir: "seg_1".to_string(),
                    deletions: Some("seg_1/deletions-0000000002.bin".to_string()),
                },
                SnapshotSegment {
                    id: 3,
                    dir: "seg_3".to_string(),
                    deletions: None,
                },
            ],
        );

        assert_eq!(
            snapshot.entries,
            vec![
                "schema.json",
                "seg_1",
                "seg_1/deletions-0000000002.bin",
                "seg_3"
            ]
        );
        assert!(snapshot.segment(3).is_some());
        assert!(snapshot.segment(2).is_none());
    }

    #[test]
    fn test_latest_generation_picks_highest() {
        let storage = MemoryStorage::new_default();

        Snapshot::compose(1, vec![])
            .write_file(&storage, &Snapshot::filename(1))
            .unwrap();
        Snapshot::compose(4, vec![])
            .write_file(&storage, &Snapshot::filename(4))
            .unwrap();
        // An unpublished candidate never counts as current.
        Snapshot::compose(9, vec![])
            .write_file(&storage, &Snapshot::temp_filename(9))
            .unwrap();

        assert_eq!(Snapshot::latest_generation(&storage).unwrap(), Some(4));
        let latest = Snapshot::read_latest(&storage).unwrap().unwrap();
        assert_eq!(latest.generation, 4);
    }

    #[test]
    fn test_read_latest_empty_storage() {
        let storage = MemoryStorage::new_default();
        assert!(Snapshot::read_latest(&storage).unwrap().is_none());
    }
}

//! Segment writer: orchestrates all component writers for one new segment.
//!
//! Every route into a segment under construction — fresh documents, absorbed
//! segments, remapped merges — fans out to each registered component writer.
//! `finish` is all-or-nothing: every component must flush successfully
//! before the descriptor is written; any failure tears the half-built
//! directory down so a candidate snapshot can never reference it.

use std::sync::Arc;

use log::debug;

use crate::error::{KestrelError, Result};
use crate::index::data::{
    DataWriter, PostingsWriter, SortWriter, StoredWriter, VectorsWriter,
};
use crate::index::deletions::DocIdMap;
use crate::index::inverter::InvertedDoc;
use crate::index::seg_reader::SegReader;
use crate::index::segment::Segment;
use crate::schema::Schema;
use crate::storage::Storage;

/// Builds one new segment directory through its component writers.
#[derive(Debug)]
pub struct SegWriter {
    storage: Arc<dyn Storage>,
    segment: Segment,
    writers: Vec<Box<dyn DataWriter>>,
    doc_count: u32,
    finished: bool,
}

impl SegWriter {
    /// Allocate a segment directory for `seg_id` and register the component
    /// writers for the schema.
    pub fn prep_seg_dir(
        storage: Arc<dyn Storage>,
        schema: &Schema,
        seg_id: u64,
    ) -> Result<SegWriter> {
        let segment = Segment::new(seg_id);
        if storage.file_exists(&segment.dir_name()) {
            return Err(KestrelError::index(format!(
                "Segment directory {} already exists",
                segment.dir_name()
            )));
        }

        let writers: Vec<Box<dyn DataWriter>> = vec![
            Box::new(PostingsWriter::new()),
            Box::new(StoredWriter::new()),
            Box::new(VectorsWriter::new()),
            Box::new(SortWriter::new(schema)),
        ];

        debug!("prepared segment dir {}", segment.dir_name());
        Ok(SegWriter {
            storage,
            segment,
            writers,
            doc_count: 0,
            finished: false,
        })
    }

    /// The id of the segment under construction.
    pub fn seg_id(&self) -> u64 {
        self.segment.id
    }

    /// Number of documents routed so far.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Whether any documents have been routed.
    pub fn has_docs(&self) -> bool {
        self.doc_count > 0
    }

    /// Route one inverted document to every component writer. Returns the
    /// document's local id.
    pub fn add_doc(&mut self, inv: &InvertedDoc) -> Result<u32> {
        let local_id = self.doc_count;
        for writer in &mut self.writers {
            writer.add_inverted_doc(inv, local_id)?;
        }
        self.doc_count += 1;
        Ok(local_id)
    }

    /// Absorb an existing segment, remapping ids through `doc_map`. The map
    /// must have been generated with this writer's current doc count as its
    /// offset.
    pub fn add_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()> {
        for writer in &mut self.writers {
            writer.add_segment(reader, doc_map)?;
        }
        self.doc_count += doc_map.live_count();
        Ok(())
    }

    /// Merge path: ids remapped, segment consumed.
    pub fn merge_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()> {
        for writer in &mut self.writers {
            writer.merge_segment(reader, doc_map)?;
        }
        self.doc_count += doc_map.live_count();
        Ok(())
    }

    /// Drop a fully-tombstoned segment's contribution.
    pub fn delete_segment(&mut self, reader: &SegReader) -> Result<()> {
        for writer in &mut self.writers {
            writer.delete_segment(reader)?;
        }
        Ok(())
    }

    /// Finish every component, then write the segment descriptor.
    ///
    /// All components must succeed before the segment becomes referencable;
    /// a failure aborts the whole build and removes any files written.
    pub fn finish(&mut self) -> Result<Segment> {
        if self.finished {
            return Err(KestrelError::index("Segment already finished"));
        }

        let dir = self.segment.dir_name();
        for writer in &mut self.writers {
            match writer.finish(self.storage.as_ref(), &dir) {
                Ok(meta) => {
                    self.segment
                        .components
                        .insert(writer.component().to_string(), meta);
                }
                Err(err) => {
                    self.abort();
                    return Err(err);
                }
            }
        }

        self.segment.doc_count = self.doc_count;
        if let Err(err) = self.segment.write_meta(self.storage.as_ref()) {
            self.abort();
            return Err(err);
        }

        self.finished = true;
        debug!("finished segment {} with {} docs", dir, self.doc_count);
        Ok(self.segment.clone())
    }

    /// Remove whatever the build has written so far. Best-effort; leftover
    /// files are unreferenced and the purger collects them later.
    pub fn abort(&mut self) {
        let dir = self.segment.dir_name();
        let prefix = format!("{dir}/");
        if let Ok(files) = self.storage.list_files() {
            for file in files.iter().filter(|file| file.starts_with(&prefix)) {
                let _ = self.storage.delete_file(file);
            }
        }
        let _ = self.storage.delete_file(&dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SimpleAnalyzer;
    use crate::document::Document;
    use crate::index::inverter::Inverter;
    use crate::schema::FieldSpec;
    use crate::storage::MemoryStorage;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .add_field("title", FieldSpec::text().sortable(true))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_build_segment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let schema = schema();
        let inverter = Inverter::new(Arc::clone(&schema), Arc::new(SimpleAnalyzer));

        let mut writer = SegWriter::prep_seg_dir(Arc::clone(&storage), &schema, 1).unwrap();
        assert!(!writer.has_docs());

        for title in ["alpha", "beta"] {
            let doc = Document::builder().add_text("title", title).build();
            writer.add_doc(&inverter.invert(&doc, 1.0).unwrap()).unwrap();
        }

        let segment = writer.finish().unwrap();
        assert_eq!(segment.id, 1);
        assert_eq!(segment.doc_count, 2);
        assert!(segment.components.contains_key("postings"));
        assert!(segment.components.contains_key("stored"));
        assert!(segment.components.contains_key("vectors"));
        assert!(segment.components.contains_key("sort"));
        assert!(storage.file_exists("seg_1/segmeta.json"));
    }

    #[test]
    fn test_finish_twice_fails() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let schema = schema();

        let mut writer = SegWriter::prep_seg_dir(Arc::clone(&storage), &schema, 1).unwrap();
        writer.finish().unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_prep_rejects_existing_dir() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let schema = schema();

        let mut writer = SegWriter::prep_seg_dir(Arc::clone(&storage), &schema, 1).unwrap();
        writer.finish().unwrap();

        assert!(SegWriter::prep_seg_dir(Arc::clone(&storage), &schema, 1).is_err());
    }

    #[test]
    fn test_abort_removes_files() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let schema = schema();

        let mut writer = SegWriter::prep_seg_dir(Arc::clone(&storage), &schema, 2).unwrap();
        writer.finish().unwrap();
        assert!(storage.file_exists("seg_2/segmeta.json"));

        writer.abort();
        assert!(!storage.file_exists("seg_2/segmeta.json"));
    }
}

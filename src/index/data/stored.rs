//! The stored-documents component.
//!
//! Keeps the stored subset of each document, retrievable by local id.
//! Serialized as one `docs.bin` per segment, one JSON record per document.

use std::sync::Arc;

use crate::document::Document;
use crate::error::{KestrelError, Result};
use crate::index::data::{locate, DataReader, DataWriter};
use crate::index::deletions::DocIdMap;
use crate::index::inverter::InvertedDoc;
use crate::index::seg_reader::SegReader;
use crate::storage::{Storage, StructReader, StructWriter};

const STORED_MAGIC: u32 = 0x4B44_4F43; // "KDOC"

/// Filename of the stored-documents component inside a segment directory.
pub const STORED_FILE: &str = "docs.bin";

/// Writer for the stored-documents component of one new segment.
#[derive(Debug, Default)]
pub struct StoredWriter {
    docs: Vec<Document>,
}

impl StoredWriter {
    /// Create an empty stored-documents writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents recorded so far.
    pub fn doc_count(&self) -> u32 {
        self.docs.len() as u32
    }
}

impl DataWriter for StoredWriter {
    fn component(&self) -> &'static str {
        "stored"
    }

    fn add_inverted_doc(&mut self, inv: &InvertedDoc, local_id: u32) -> Result<()> {
        debug_assert_eq!(local_id as usize, self.docs.len());
        self.docs.push(inv.stored().clone());
        Ok(())
    }

    fn add_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()> {
        for old_id in 0..reader.doc_max() {
            if let Some(new_id) = doc_map.get(old_id) {
                debug_assert_eq!(new_id as usize, self.docs.len());
                self.docs.push(reader.stored().document(old_id)?.clone());
            }
        }
        Ok(())
    }

    fn finish(&mut self, storage: &dyn Storage, seg_dir: &str) -> Result<serde_json::Value> {
        let output = storage.create_output(&format!("{seg_dir}/{STORED_FILE}"))?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(STORED_MAGIC)?;
        writer.write_u32(1)?; // version
        writer.write_varint(self.docs.len() as u64)?;

        for doc in &self.docs {
            writer.write_string(&serde_json::to_string(doc)?)?;
        }

        writer.close()?;

        Ok(serde_json::json!({
            "format": 1,
            "doc_count": self.docs.len(),
        }))
    }
}

/// Reader for one segment's stored documents.
#[derive(Debug)]
pub struct StoredReader {
    docs: Vec<Document>,
}

impl StoredReader {
    /// Open the stored-documents component under `seg_dir`.
    pub fn open(storage: &dyn Storage, seg_dir: &str) -> Result<Self> {
        let input = storage.open_input(&format!("{seg_dir}/{STORED_FILE}"))?;
        let mut reader = StructReader::new(input)?;

        let magic = reader.read_u32()?;
        if magic != STORED_MAGIC {
            return Err(KestrelError::index(format!(
                "Invalid stored-documents format in {seg_dir}"
            )));
        }
        let version = reader.read_u32()?;
        if version != 1 {
            return Err(KestrelError::index(format!(
                "Unsupported stored-documents version {version} in {seg_dir}"
            )));
        }

        let doc_count = reader.read_varint()? as usize;
        let mut docs = Vec::with_capacity(doc_count);
        for _ in 0..doc_count {
            let json = reader.read_string()?;
            docs.push(serde_json::from_str(&json)?);
        }

        reader.verify_checksum()?;
        Ok(StoredReader { docs })
    }

    /// An empty reader for segments without stored documents.
    pub fn empty() -> Self {
        StoredReader { docs: Vec::new() }
    }

    /// Number of documents.
    pub fn doc_count(&self) -> u32 {
        self.docs.len() as u32
    }

    /// The stored document at a local id.
    pub fn document(&self, local_id: u32) -> Result<&Document> {
        self.docs.get(local_id as usize).ok_or_else(|| {
            KestrelError::index(format!("Doc id {local_id} out of range"))
        })
    }
}

impl DataReader for StoredReader {
    type Composite = PolyStoredReader;

    fn aggregator(readers: Vec<Arc<Self>>, offsets: Vec<u32>) -> PolyStoredReader {
        let doc_maxes = readers.iter().map(|reader| reader.doc_count()).collect();
        PolyStoredReader {
            readers,
            offsets,
            doc_maxes,
        }
    }
}

/// Composite stored-documents view over many segments.
#[derive(Debug)]
pub struct PolyStoredReader {
    readers: Vec<Arc<StoredReader>>,
    offsets: Vec<u32>,
    doc_maxes: Vec<u32>,
}

impl PolyStoredReader {
    /// The stored document at a global id.
    pub fn document(&self, global_id: u32) -> Result<&Document> {
        let (seg_idx, local_id) = locate(&self.offsets, &self.doc_maxes, global_id)
            .ok_or_else(|| KestrelError::index(format!("Doc id {global_id} out of range")))?;
        self.readers[seg_idx].document(local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SimpleAnalyzer;
    use crate::index::inverter::Inverter;
    use crate::schema::{FieldSpec, Schema};
    use crate::storage::MemoryStorage;

    fn inverted(title: &str) -> InvertedDoc {
        let schema = Schema::builder()
            .add_field("title", FieldSpec::text())
            .build()
            .unwrap();
        let inverter = Inverter::new(Arc::new(schema), Arc::new(SimpleAnalyzer));
        let doc = Document::builder().add_text("title", title).build();
        inverter.invert(&doc, 1.0).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let storage = MemoryStorage::new_default();
        let mut writer = StoredWriter::new();
        writer.add_inverted_doc(&inverted("one"), 0).unwrap();
        writer.add_inverted_doc(&inverted("two"), 1).unwrap();
        writer.finish(&storage, "seg_1").unwrap();

        let reader = StoredReader::open(&storage, "seg_1").unwrap();
        assert_eq!(reader.doc_count(), 2);
        assert_eq!(
            reader.document(1).unwrap().get_field("title").unwrap().as_text(),
            Some("two")
        );
        assert!(reader.document(2).is_err());
    }

    #[test]
    fn test_poly_lookup() {
        let storage = MemoryStorage::new_default();

        let mut writer = StoredWriter::new();
        writer.add_inverted_doc(&inverted("a"), 0).unwrap();
        writer.add_inverted_doc(&inverted("b"), 1).unwrap();
        writer.finish(&storage, "seg_1").unwrap();

        let mut writer = StoredWriter::new();
        writer.add_inverted_doc(&inverted("c"), 0).unwrap();
        writer.finish(&storage, "seg_2").unwrap();

        let r1 = Arc::new(StoredReader::open(&storage, "seg_1").unwrap());
        let r2 = Arc::new(StoredReader::open(&storage, "seg_2").unwrap());
        let poly = StoredReader::aggregator(vec![r1, r2], vec![0, 2]);

        assert_eq!(
            poly.document(2).unwrap().get_field("title").unwrap().as_text(),
            Some("c")
        );
        assert!(poly.document(3).is_err());
    }
}

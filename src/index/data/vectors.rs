//! The term-vectors component.
//!
//! Records positions and byte offsets per (field, term) for every document
//! with highlighted fields, so an excerpting layer can rebuild match
//! locations without re-analyzing text. Serialized as one `vectors.bin` per
//! segment.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{KestrelError, Result};
use crate::index::data::{locate, DataReader, DataWriter};
use crate::index::deletions::DocIdMap;
use crate::index::inverter::{InvertedDoc, TermPositions};
use crate::index::seg_reader::SegReader;
use crate::storage::{Storage, StructReader, StructWriter};

const VECTORS_MAGIC: u32 = 0x4B56_4543; // "KVEC"

/// Filename of the term-vectors component inside a segment directory.
pub const VECTORS_FILE: &str = "vectors.bin";

/// Term vectors of one document: field -> term -> positions and offsets.
pub type DocVectors = BTreeMap<String, BTreeMap<String, TermPositions>>;

/// Writer for the term-vectors component of one new segment.
#[derive(Debug, Default)]
pub struct VectorsWriter {
    docs: Vec<DocVectors>,
}

impl VectorsWriter {
    /// Create an empty term-vectors writer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataWriter for VectorsWriter {
    fn component(&self) -> &'static str {
        "vectors"
    }

    fn add_inverted_doc(&mut self, inv: &InvertedDoc, local_id: u32) -> Result<()> {
        debug_assert_eq!(local_id as usize, self.docs.len());
        self.docs.push(inv.vectors().clone());
        Ok(())
    }

    fn add_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()> {
        for old_id in 0..reader.doc_max() {
            if let Some(new_id) = doc_map.get(old_id) {
                debug_assert_eq!(new_id as usize, self.docs.len());
                self.docs.push(reader.vectors().doc_vectors(old_id)?.clone());
            }
        }
        Ok(())
    }

    fn finish(&mut self, storage: &dyn Storage, seg_dir: &str) -> Result<serde_json::Value> {
        let output = storage.create_output(&format!("{seg_dir}/{VECTORS_FILE}"))?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(VECTORS_MAGIC)?;
        writer.write_u32(1)?; // version
        writer.write_varint(self.docs.len() as u64)?;

        for doc in &self.docs {
            writer.write_varint(doc.len() as u64)?;
            for (field, terms) in doc {
                writer.write_string(field)?;
                writer.write_varint(terms.len() as u64)?;
                for (term, tp) in terms {
                    writer.write_string(term)?;
                    writer.write_delta_u32s(&tp.positions)?;
                    writer.write_delta_u32s(&tp.start_offsets)?;
                    writer.write_delta_u32s(&tp.end_offsets)?;
                }
            }
        }

        writer.close()?;

        Ok(serde_json::json!({
            "format": 1,
            "doc_count": self.docs.len(),
        }))
    }
}

/// Reader for one segment's term vectors.
#[derive(Debug)]
pub struct VectorsReader {
    docs: Vec<DocVectors>,
}

impl VectorsReader {
    /// Open the term-vectors component under `seg_dir`.
    pub fn open(storage: &dyn Storage, seg_dir: &str) -> Result<Self> {
        let input = storage.open_input(&format!("{seg_dir}/{VECTORS_FILE}"))?;
        let mut reader = StructReader::new(input)?;

        let magic = reader.read_u32()?;
        if magic != VECTORS_MAGIC {
            return Err(KestrelError::index(format!(
                "Invalid term-vectors format in {seg_dir}"
            )));
        }
        let version = reader.read_u32()?;
        if version != 1 {
            return Err(KestrelError::index(format!(
                "Unsupported term-vectors version {version} in {seg_dir}"
            )));
        }

        let doc_count = reader.read_varint()? as usize;
        let mut docs = Vec::with_capacity(doc_count);

        for _ in 0..doc_count {
            let field_count = reader.read_varint()? as usize;
            let mut fields = BTreeMap::new();
            for _ in 0..field_count {
                let field = reader.read_string()?;
                let term_count = reader.read_varint()? as usize;
                let mut terms = BTreeMap::new();
                for _ in 0..term_count {
                    let term = reader.read_string()?;
                    let positions = reader.read_delta_u32s()?;
                    let start_offsets = reader.read_delta_u32s()?;
                    let end_offsets = reader.read_delta_u32s()?;
                    terms.insert(
                        term,
                        TermPositions {
                            positions,
                            start_offsets,
                            end_offsets,
                        },
                    );
                }
                fields.insert(field, terms);
            }
            docs.push(fields);
        }

        reader.verify_checksum()?;
        Ok(VectorsReader { docs })
    }

    /// An empty reader for segments without term vectors.
    pub fn empty() -> Self {
        VectorsReader { docs: Vec::new() }
    }

    /// Number of documents covered.
    pub fn doc_count(&self) -> u32 {
        self.docs.len() as u32
    }

    /// Term vectors of the document at a local id.
    pub fn doc_vectors(&self, local_id: u32) -> Result<&DocVectors> {
        self.docs.get(local_id as usize).ok_or_else(|| {
            KestrelError::index(format!("Doc id {local_id} out of range"))
        })
    }
}

impl DataReader for VectorsReader {
    type Composite = PolyVectorsReader;

    fn aggregator(readers: Vec<Arc<Self>>, offsets: Vec<u32>) -> PolyVectorsReader {
        let doc_maxes = readers.iter().map(|reader| reader.doc_count()).collect();
        PolyVectorsReader {
            readers,
            offsets,
            doc_maxes,
        }
    }
}

/// Composite term-vectors view over many segments.
#[derive(Debug)]
pub struct PolyVectorsReader {
    readers: Vec<Arc<VectorsReader>>,
    offsets: Vec<u32>,
    doc_maxes: Vec<u32>,
}

impl PolyVectorsReader {
    /// Term vectors of the document at a global id.
    pub fn doc_vectors(&self, global_id: u32) -> Result<&DocVectors> {
        let (seg_idx, local_id) = locate(&self.offsets, &self.doc_maxes, global_id)
            .ok_or_else(|| KestrelError::index(format!("Doc id {global_id} out of range")))?;
        self.readers[seg_idx].doc_vectors(local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SimpleAnalyzer;
    use crate::document::Document;
    use crate::index::inverter::Inverter;
    use crate::schema::{FieldSpec, Schema};
    use crate::storage::MemoryStorage;

    fn inverted(text: &str) -> InvertedDoc {
        let schema = Schema::builder()
            .add_field("body", FieldSpec::text().highlighted(true))
            .build()
            .unwrap();
        let inverter = Inverter::new(Arc::new(schema), Arc::new(SimpleAnalyzer));
        let doc = Document::builder().add_text("body", text).build();
        inverter.invert(&doc, 1.0).unwrap()
    }

    #[test]
    fn test_round_trip_with_offsets() {
        let storage = MemoryStorage::new_default();
        let mut writer = VectorsWriter::new();
        writer.add_inverted_doc(&inverted("red fox red"), 0).unwrap();
        writer.finish(&storage, "seg_1").unwrap();

        let reader = VectorsReader::open(&storage, "seg_1").unwrap();
        let vectors = reader.doc_vectors(0).unwrap();
        let red = &vectors["body"]["red"];
        assert_eq!(red.positions, vec![0, 2]);
        assert_eq!(red.start_offsets, vec![0, 8]);
        assert_eq!(red.end_offsets, vec![3, 11]);
    }

    #[test]
    fn test_poly_lookup() {
        let storage = MemoryStorage::new_default();

        let mut writer = VectorsWriter::new();
        writer.add_inverted_doc(&inverted("one"), 0).unwrap();
        writer.finish(&storage, "seg_1").unwrap();

        let mut writer = VectorsWriter::new();
        writer.add_inverted_doc(&inverted("two"), 0).unwrap();
        writer.finish(&storage, "seg_2").unwrap();

        let r1 = Arc::new(VectorsReader::open(&storage, "seg_1").unwrap());
        let r2 = Arc::new(VectorsReader::open(&storage, "seg_2").unwrap());
        let poly = VectorsReader::aggregator(vec![r1, r2], vec![0, 1]);

        assert!(poly.doc_vectors(1).unwrap()["body"].contains_key("two"));
        assert!(poly.doc_vectors(2).is_err());
    }
}

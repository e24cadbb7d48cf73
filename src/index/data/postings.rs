//! The inverted-postings component.
//!
//! In-memory while a segment is under construction; serialized as one
//! `postings.bin` per segment with delta-compressed doc ids and positions.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{KestrelError, Result};
use crate::index::data::{DataReader, DataWriter};
use crate::index::deletions::DocIdMap;
use crate::index::inverter::InvertedDoc;
use crate::index::seg_reader::SegReader;
use crate::storage::{Storage, StructReader, StructWriter};

const POSTINGS_MAGIC: u32 = 0x4B50_5354; // "KPST"

/// Filename of the postings component inside a segment directory.
pub const POSTINGS_FILE: &str = "postings.bin";

/// One document's occurrence of a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    /// Local doc id within the segment.
    pub doc_id: u32,

    /// Token positions of the term in the document, ascending.
    pub positions: Vec<u32>,
}

impl Posting {
    /// Term frequency in the document.
    pub fn freq(&self) -> u32 {
        self.positions.len() as u32
    }
}

type FieldPostings = BTreeMap<String, Vec<Posting>>;

/// Writer for the postings component of one new segment.
#[derive(Debug, Default)]
pub struct PostingsWriter {
    fields: BTreeMap<String, FieldPostings>,
}

impl PostingsWriter {
    /// Create an empty postings writer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataWriter for PostingsWriter {
    fn component(&self) -> &'static str {
        "postings"
    }

    fn add_inverted_doc(&mut self, inv: &InvertedDoc, local_id: u32) -> Result<()> {
        for (field, terms) in inv.postings() {
            let field_postings = self.fields.entry(field.clone()).or_default();
            for (term, tp) in terms {
                field_postings.entry(term.clone()).or_default().push(Posting {
                    doc_id: local_id,
                    positions: tp.positions.clone(),
                });
            }
        }
        Ok(())
    }

    fn add_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()> {
        for (field, terms) in reader.postings().fields() {
            let field_postings = self.fields.entry(field.clone()).or_default();
            for (term, postings) in terms {
                let target = field_postings.entry(term.clone()).or_default();
                for posting in postings {
                    if let Some(new_id) = doc_map.get(posting.doc_id) {
                        target.push(Posting {
                            doc_id: new_id,
                            positions: posting.positions.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, storage: &dyn Storage, seg_dir: &str) -> Result<serde_json::Value> {
        let output = storage.create_output(&format!("{seg_dir}/{POSTINGS_FILE}"))?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(POSTINGS_MAGIC)?;
        writer.write_u32(1)?; // version
        writer.write_varint(self.fields.len() as u64)?;

        let mut term_count = 0u64;
        for (field, terms) in &self.fields {
            writer.write_string(field)?;
            writer.write_varint(terms.len() as u64)?;

            for (term, postings) in terms {
                term_count += 1;
                writer.write_string(term)?;

                let doc_ids: Vec<u32> = postings.iter().map(|p| p.doc_id).collect();
                writer.write_delta_u32s(&doc_ids)?;
                for posting in postings {
                    writer.write_delta_u32s(&posting.positions)?;
                }
            }
        }

        writer.close()?;

        Ok(serde_json::json!({
            "format": 1,
            "field_count": self.fields.len(),
            "term_count": term_count,
        }))
    }
}

/// Reader for one segment's postings component.
#[derive(Debug)]
pub struct PostingsReader {
    fields: BTreeMap<String, FieldPostings>,
}

impl PostingsReader {
    /// Open the postings component under `seg_dir`.
    pub fn open(storage: &dyn Storage, seg_dir: &str) -> Result<Self> {
        let input = storage.open_input(&format!("{seg_dir}/{POSTINGS_FILE}"))?;
        let mut reader = StructReader::new(input)?;

        let magic = reader.read_u32()?;
        if magic != POSTINGS_MAGIC {
            return Err(KestrelError::index(format!(
                "Invalid postings format in {seg_dir}"
            )));
        }
        let version = reader.read_u32()?;
        if version != 1 {
            return Err(KestrelError::index(format!(
                "Unsupported postings version {version} in {seg_dir}"
            )));
        }

        let field_count = reader.read_varint()? as usize;
        let mut fields = BTreeMap::new();

        for _ in 0..field_count {
            let field = reader.read_string()?;
            let term_entries = reader.read_varint()? as usize;
            let mut terms = BTreeMap::new();

            for _ in 0..term_entries {
                let term = reader.read_string()?;
                let doc_ids = reader.read_delta_u32s()?;
                let mut postings = Vec::with_capacity(doc_ids.len());
                for doc_id in doc_ids {
                    let positions = reader.read_delta_u32s()?;
                    postings.push(Posting { doc_id, positions });
                }
                terms.insert(term, postings);
            }
            fields.insert(field, terms);
        }

        reader.verify_checksum()?;
        Ok(PostingsReader { fields })
    }

    /// An empty reader for segments without a postings component.
    pub fn empty() -> Self {
        PostingsReader {
            fields: BTreeMap::new(),
        }
    }

    /// Postings for one term in one field.
    pub fn postings(&self, field: &str, term: &str) -> Option<&[Posting]> {
        self.fields
            .get(field)?
            .get(term)
            .map(|postings| postings.as_slice())
    }

    /// Number of documents containing the term.
    pub fn doc_freq(&self, field: &str, term: &str) -> u32 {
        self.postings(field, term).map_or(0, |p| p.len() as u32)
    }

    /// Iterate fields and their term maps.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldPostings)> {
        self.fields.iter()
    }

    /// Iterate the terms of one field in sorted order.
    pub fn terms(&self, field: &str) -> impl Iterator<Item = &String> {
        self.fields.get(field).into_iter().flat_map(|terms| terms.keys())
    }
}

impl DataReader for PostingsReader {
    type Composite = PolyPostingsReader;

    fn aggregator(readers: Vec<Arc<Self>>, offsets: Vec<u32>) -> PolyPostingsReader {
        PolyPostingsReader { readers, offsets }
    }
}

/// Composite postings view over many segments with translated doc ids.
#[derive(Debug)]
pub struct PolyPostingsReader {
    readers: Vec<Arc<PostingsReader>>,
    offsets: Vec<u32>,
}

impl PolyPostingsReader {
    /// Postings for one term across all segments, as (global doc id, freq)
    /// pairs in global doc-id order.
    pub fn postings(&self, field: &str, term: &str) -> Vec<(u32, u32)> {
        let mut result = Vec::new();
        for (reader, &offset) in self.readers.iter().zip(&self.offsets) {
            if let Some(postings) = reader.postings(field, term) {
                for posting in postings {
                    result.push((offset + posting.doc_id, posting.freq()));
                }
            }
        }
        result
    }

    /// Number of documents containing the term across all segments.
    pub fn doc_freq(&self, field: &str, term: &str) -> u32 {
        self.readers
            .iter()
            .map(|reader| reader.doc_freq(field, term))
            .sum()
    }

    /// The per-segment readers with their starting global ids.
    pub fn segments(&self) -> (&[Arc<PostingsReader>], &[u32]) {
        (&self.readers, &self.offsets)
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
            .add_field("body", FieldSpec::text())
            .build()
            .unwrap();
        let inverter = Inverter::new(std::sync::Arc::new(schema), std::sync::Arc::new(SimpleAnalyzer));
        let doc = Document::builder().add_text("body", text).build();
        inverter.invert(&doc, 1.0).unwrap()
    }

    #[test]
    fn test_write_read_round_trip() {
        let storage = MemoryStorage::new_default();
        let mut writer = PostingsWriter::new();

        writer.add_inverted_doc(&inverted("red fox"), 0).unwrap();
        writer.add_inverted_doc(&inverted("red red wine"), 1).unwrap();
        let meta = writer.finish(&storage, "seg_1").unwrap();
        assert_eq!(meta["field_count"], 1);

        let reader = PostingsReader::open(&storage, "seg_1").unwrap();
        let red = reader.postings("body", "red").unwrap();
        assert_eq!(red.len(), 2);
        assert_eq!(red[0].doc_id, 0);
        assert_eq!(red[1].doc_id, 1);
        assert_eq!(red[1].freq(), 2);
        assert_eq!(red[1].positions, vec![0, 1]);

        assert_eq!(reader.doc_freq("body", "fox"), 1);
        assert_eq!(reader.doc_freq("body", "absent"), 0);
        assert_eq!(reader.terms("body").count(), 3);
    }

    #[test]
    fn test_poly_translates_doc_ids() {
        let storage = MemoryStorage::new_default();

        let mut writer = PostingsWriter::new();
        writer.add_inverted_doc(&inverted("alpha"), 0).unwrap();
        writer.add_inverted_doc(&inverted("alpha beta"), 1).unwrap();
        writer.finish(&storage, "seg_1").unwrap();

        let mut writer = PostingsWriter::new();
        writer.add_inverted_doc(&inverted("alpha"), 0).unwrap();
        writer.finish(&storage, "seg_2").unwrap();

        let r1 = Arc::new(PostingsReader::open(&storage, "seg_1").unwrap());
        let r2 = Arc::new(PostingsReader::open(&storage, "seg_2").unwrap());
        let poly = PostingsReader::aggregator(vec![r1, r2], vec![0, 2]);

        let hits = poly.postings("body", "alpha");
        let ids: Vec<u32> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(poly.doc_freq("body", "alpha"), 3);
        assert_eq!(poly.doc_freq("body", "beta"), 1);
    }
}

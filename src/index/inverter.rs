//! Field inversion: turning one document into per-component input.
//!
//! The inverter consults the schema for each field's options and produces an
//! [`InvertedDoc`]: analyzed postings for indexed fields, offset-bearing term
//! vectors for highlighted fields, the stored subset of raw values, and sort
//! keys for sortable fields. Component writers consume it without touching
//! the schema again.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::analysis::Analyzer;
use crate::document::{Document, FieldValue};
use crate::error::{KestrelError, Result};
use crate::schema::{FieldType, Schema};

/// Positions (and byte offsets, when recorded) of one term in one field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermPositions {
    /// Token positions, ascending.
    pub positions: Vec<u32>,

    /// Byte offsets of token starts; empty unless the field is highlighted.
    pub start_offsets: Vec<u32>,

    /// Byte offsets just past token ends; empty unless the field is
    /// highlighted.
    pub end_offsets: Vec<u32>,
}

/// One document, inverted and routed by component concern.
#[derive(Debug, Clone)]
pub struct InvertedDoc {
    /// field -> term -> positions, for indexed fields.
    postings: BTreeMap<String, BTreeMap<String, TermPositions>>,

    /// field -> term -> positions with offsets, for highlighted fields.
    vectors: BTreeMap<String, BTreeMap<String, TermPositions>>,

    /// The stored subset of the document.
    stored: Document,

    /// field -> sort key, for sortable fields present in the document.
    sort_keys: BTreeMap<String, String>,

    /// Document boost, reserved for the scoring layer.
    boost: f32,
}

impl InvertedDoc {
    /// Postings by field and term.
    pub fn postings(&self) -> &BTreeMap<String, BTreeMap<String, TermPositions>> {
        &self.postings
    }

    /// Term vectors by field and term.
    pub fn vectors(&self) -> &BTreeMap<String, BTreeMap<String, TermPositions>> {
        &self.vectors
    }

    /// The stored field subset.
    pub fn stored(&self) -> &Document {
        &self.stored
    }

    /// Sort keys by field.
    pub fn sort_keys(&self) -> &BTreeMap<String, String> {
        &self.sort_keys
    }

    /// Document boost.
    pub fn boost(&self) -> f32 {
        self.boost
    }
}

/// Inverts documents against one schema with one analyzer.
#[derive(Debug)]
pub struct Inverter {
    schema: Arc<Schema>,
    analyzer: Arc<dyn Analyzer>,
}

impl Inverter {
    /// Create an inverter.
    pub fn new(schema: Arc<Schema>, analyzer: Arc<dyn Analyzer>) -> Self {
        Inverter { schema, analyzer }
    }

    /// The schema fields are routed against.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Invert one document whose field names are already canonical.
    pub fn invert(&self, doc: &Document, boost: f32) -> Result<InvertedDoc> {
        let mut postings: BTreeMap<String, BTreeMap<String, TermPositions>> = BTreeMap::new();
        let mut vectors: BTreeMap<String, BTreeMap<String, TermPositions>> = BTreeMap::new();
        let mut stored = Document::new();
        let mut sort_keys = BTreeMap::new();

        for (name, value) in doc.fields() {
            let spec = self.schema.get(name).ok_or_else(|| {
                KestrelError::schema(format!("Unknown field '{name}'"))
            })?;

            if spec.stored {
                stored.add_field(name.clone(), value.clone());
            }

            if spec.sortable
                && let Some(key) = value.sort_key()
            {
                sort_keys.insert(name.clone(), key);
            }

            if !spec.indexed {
                continue;
            }

            let field_postings = postings.entry(name.clone()).or_default();
            match (spec.field_type, value) {
                (FieldType::Text, FieldValue::Text(text)) => {
                    for token in self.analyzer.analyze(text) {
                        let entry = field_postings.entry(token.text.clone()).or_default();
                        entry.positions.push(token.position);
                        if spec.highlighted {
                            entry.start_offsets.push(token.start_offset);
                            entry.end_offsets.push(token.end_offset);
                        }
                    }
                }
                (_, value) => {
                    if let Some(term) = value.index_term() {
                        let entry = field_postings.entry(term).or_default();
                        entry.positions.push(0);
                    }
                }
            }

            if spec.highlighted {
                vectors.insert(name.clone(), field_postings.clone());
            }
        }

        Ok(InvertedDoc {
            postings,
            vectors,
            stored,
            sort_keys,
            boost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SimpleAnalyzer;
    use crate::schema::FieldSpec;

    fn test_inverter() -> Inverter {
        let schema = Schema::builder()
            .add_field("title", FieldSpec::text().sortable(true).highlighted(true))
            .add_field("body", FieldSpec::text().stored(false))
            .add_field("year", FieldSpec::integer())
            .add_field("raw", FieldSpec::bytes())
            .build()
            .unwrap();
        Inverter::new(Arc::new(schema), Arc::new(SimpleAnalyzer))
    }

    #[test]
    fn test_invert_routes_by_spec() {
        let inverter = test_inverter();
        let doc = Document::builder()
            .add_text("title", "Rust Rust rules")
            .add_text("body", "hidden text")
            .add_integer("year", 2024)
            .add_bytes("raw", vec![1, 2, 3])
            .build();

        let inv = inverter.invert(&doc, 1.0).unwrap();

        // Analyzed postings with positions.
        let title = &inv.postings()["title"];
        assert_eq!(title["rust"].positions, vec![0, 1]);
        assert_eq!(title["rules"].positions, vec![2]);

        // Integer indexed as a single term.
        assert!(inv.postings()["year"].contains_key("2024"));

        // Bytes fields are stored but never indexed.
        assert!(!inv.postings().contains_key("raw"));
        assert!(inv.stored().has_field("raw"));

        // Unstored fields are dropped from the stored subset.
        assert!(!inv.stored().has_field("body"));
        assert!(inv.stored().has_field("title"));

        // Only highlighted fields carry vectors, with offsets.
        assert!(inv.vectors().contains_key("title"));
        assert!(!inv.vectors().contains_key("body"));
        assert_eq!(inv.vectors()["title"]["rust"].start_offsets.len(), 2);

        // Sort keys only for sortable fields.
        assert_eq!(inv.sort_keys().get("title").map(String::as_str), Some("Rust Rust rules"));
        assert!(!inv.sort_keys().contains_key("year"));
    }

    #[test]
    fn test_invert_rejects_unknown_field() {
        let inverter = test_inverter();
        let doc = Document::builder().add_text("nope", "x").build();
        assert!(inverter.invert(&doc, 1.0).is_err());
    }
}

//! The sort-cache component.
//!
//! Accumulates sort keys per sortable field while a segment is built, then
//! freezes them into [`SortCache`] structures serialized as one `sort.bin`
//! per segment.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{KestrelError, Result};
use crate::index::data::{DataReader, DataWriter};
use crate::index::deletions::DocIdMap;
use crate::index::inverter::InvertedDoc;
use crate::index::seg_reader::SegReader;
use crate::index::sort_cache::SortCache;
use crate::schema::Schema;
use crate::storage::{Storage, StructReader, StructWriter};

const SORT_MAGIC: u32 = 0x4B53_5254; // "KSRT"

/// Filename of the sort-cache component inside a segment directory.
pub const SORT_FILE: &str = "sort.bin";

/// Writer for the sort-cache component of one new segment.
#[derive(Debug)]
pub struct SortWriter {
    /// Sortable field names, in schema order.
    fields: Vec<String>,

    /// One optional key per document per field, aligned with local doc ids.
    keys: BTreeMap<String, Vec<Option<String>>>,
}

impl SortWriter {
    /// Create a writer covering the schema's sortable fields.
    pub fn new(schema: &Schema) -> Self {
        let fields: Vec<String> = schema
            .fields()
            .filter(|(_, spec)| spec.sortable)
            .map(|(name, _)| name.to_string())
            .collect();
        let keys = fields
            .iter()
            .map(|field| (field.clone(), Vec::new()))
            .collect();

        SortWriter { fields, keys }
    }

    fn push_keys<F>(&mut self, mut key_for: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        for field in &self.fields {
            let key = key_for(field);
            if let Some(keys) = self.keys.get_mut(field) {
                keys.push(key);
            }
        }
    }
}

impl DataWriter for SortWriter {
    fn component(&self) -> &'static str {
        "sort"
    }

    fn add_inverted_doc(&mut self, inv: &InvertedDoc, _local_id: u32) -> Result<()> {
        self.push_keys(|field| inv.sort_keys().get(field).cloned());
        Ok(())
    }

    fn add_segment(&mut self, reader: &SegReader, doc_map: &DocIdMap) -> Result<()> {
        for old_id in 0..reader.doc_max() {
            if doc_map.get(old_id).is_none() {
                continue;
            }
            self.push_keys(|field| {
                reader
                    .sort()
                    .cache(field)
                    .and_then(|cache| cache.ordinal(old_id).and_then(|ord| cache.value(ord)))
                    .map(str::to_string)
            });
        }
        Ok(())
    }

    fn finish(&mut self, storage: &dyn Storage, seg_dir: &str) -> Result<serde_json::Value> {
        let output = storage.create_output(&format!("{seg_dir}/{SORT_FILE}"))?;
        let mut writer = StructWriter::new(output);

        writer.write_u32(SORT_MAGIC)?;
        writer.write_u32(1)?; // version
        writer.write_varint(self.fields.len() as u64)?;

        for field in &self.fields {
            let cache = SortCache::build(&self.keys[field]);

            writer.write_string(field)?;
            writer.write_varint(cache.num_values() as u64)?;
            for value in cache.values() {
                writer.write_string(value)?;
            }
            writer.write_varint(cache.doc_count() as u64)?;
            for &ord in cache.ords() {
                // -1 (no value) encodes as 0, ordinals shift up by one.
                writer.write_varint((ord + 1) as u64)?;
            }
        }

        writer.close()?;

        Ok(serde_json::json!({
            "format": 1,
            "fields": self.fields,
        }))
    }
}

/// Reader for one segment's sort caches.
#[derive(Debug)]
pub struct SortCacheReader {
    caches: BTreeMap<String, SortCache>,
}

impl SortCacheReader {
    /// Open the sort-cache component under `seg_dir`.
    pub fn open(storage: &dyn Storage, seg_dir: &str) -> Result<Self> {
        let input = storage.open_input(&format!("{seg_dir}/{SORT_FILE}"))?;
        let mut reader = StructReader::new(input)?;

        let magic = reader.read_u32()?;
        if magic != SORT_MAGIC {
            return Err(KestrelError::index(format!(
                "Invalid sort-cache format in {seg_dir}"
            )));
        }
        let version = reader.read_u32()?;
        if version != 1 {
            return Err(KestrelError::index(format!(
                "Unsupported sort-cache version {version} in {seg_dir}"
            )));
        }

        let field_count = reader.read_varint()? as usize;
        let mut caches = BTreeMap::new();

        for _ in 0..field_count {
            let field = reader.read_string()?;
            let value_count = reader.read_varint()? as usize;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                values.push(reader.read_string()?);
            }
            let doc_count = reader.read_varint()? as usize;
            let mut ords = Vec::with_capacity(doc_count);
            for _ in 0..doc_count {
                ords.push(reader.read_varint()? as i32 - 1);
            }
            caches.insert(field, SortCache::from_parts(values, ords));
        }

        reader.verify_checksum()?;
        Ok(SortCacheReader { caches })
    }

    /// An empty reader for segments without sort caches.
    pub fn empty() -> Self {
        SortCacheReader {
            caches: BTreeMap::new(),
        }
    }

    /// The cache for one field, if the field is sortable and present.
    pub fn cache(&self, field: &str) -> Option<&SortCache> {
        self.caches.get(field)
    }

    /// Iterate the cached fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.caches.keys()
    }
}

impl DataReader for SortCacheReader {
    type Composite = PolySortReader;

    fn aggregator(readers: Vec<Arc<Self>>, offsets: Vec<u32>) -> PolySortReader {
        PolySortReader { readers, offsets }
    }
}

/// Composite sort-cache view.
///
/// Ordinals are only meaningful within one segment, so the composite exposes
/// the ordered segment list rather than a merged cache; consumers iterate
/// segments and translate doc ids through the offsets.
#[derive(Debug)]
pub struct PolySortReader {
    readers: Vec<Arc<SortCacheReader>>,
    offsets: Vec<u32>,
}

impl PolySortReader {
    /// The per-segment readers with their starting global ids.
    pub fn segments(&self) -> (&[Arc<SortCacheReader>], &[u32]) {
        (&self.readers, &self.offsets)
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
                .add_field("name", FieldSpec::text().sortable(true))
                .build()
                .unwrap(),
        )
    }

    fn inverted(schema: &Arc<Schema>, name: &str) -> InvertedDoc {
        let inverter = Inverter::new(Arc::clone(schema), Arc::new(SimpleAnalyzer));
        let doc = Document::builder().add_text("name", name).build();
        inverter.invert(&doc, 1.0).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let storage = MemoryStorage::new_default();
        let schema = schema();

        let mut writer = SortWriter::new(&schema);
        writer.add_inverted_doc(&inverted(&schema, "cherry"), 0).unwrap();
        writer.add_inverted_doc(&inverted(&schema, "apple"), 1).unwrap();
        let meta = writer.finish(&storage, "seg_1").unwrap();
        assert_eq!(meta["fields"][0], "name");

        let reader = SortCacheReader::open(&storage, "seg_1").unwrap();
        let cache = reader.cache("name").unwrap();
        assert_eq!(cache.ordinal(0), Some(1)); // cherry
        assert_eq!(cache.ordinal(1), Some(0)); // apple
        assert_eq!(cache.value(0), Some("apple"));
        assert_eq!(cache.find("b"), 1);
        assert!(reader.cache("missing").is_none());
    }
}

//! Per-field sort caches.
//!
//! A sort cache maps a segment's documents to ordinal ranks over the field's
//! sorted distinct values, and back. Built once when a segment is finished,
//! never mutated, safe to read from any number of threads.

/// An immutable ordinal/value mapping for one field in one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortCache {
    /// Distinct values in sorted order.
    values: Vec<String>,

    /// Ordinal per local doc id; -1 for documents without a value.
    ords: Vec<i32>,
}

impl SortCache {
    /// Build a cache from one optional sort key per document, indexed by
    /// local doc id.
    pub fn build(keys: &[Option<String>]) -> Self {
        let mut values: Vec<String> = keys.iter().flatten().cloned().collect();
        values.sort();
        values.dedup();

        let ords = keys
            .iter()
            .map(|key| match key {
                // The value is present by construction.
                Some(key) => values.binary_search(key).map(|ord| ord as i32).unwrap_or(-1),
                None => -1,
            })
            .collect();

        SortCache { values, ords }
    }

    /// Reassemble a cache from its persisted parts.
    pub fn from_parts(values: Vec<String>, ords: Vec<i32>) -> Self {
        SortCache { values, ords }
    }

    /// The field value at sort rank `ord`.
    pub fn value(&self, ord: u32) -> Option<&str> {
        self.values.get(ord as usize).map(String::as_str)
    }

    /// The sort rank of a document, or `None` if it has no value.
    pub fn ordinal(&self, doc_id: u32) -> Option<u32> {
        match self.ords.get(doc_id as usize) {
            Some(&ord) if ord >= 0 => Some(ord as u32),
            _ => None,
        }
    }

    /// First ordinal whose value is >= `term`, or the value count as a
    /// sentinel when every value sorts before `term`.
    pub fn find(&self, term: &str) -> u32 {
        self.values.partition_point(|value| value.as_str() < term) as u32
    }

    /// Number of distinct values.
    pub fn num_values(&self) -> u32 {
        self.values.len() as u32
    }

    /// Number of documents covered.
    pub fn doc_count(&self) -> u32 {
        self.ords.len() as u32
    }

    /// The sorted distinct values.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// The raw ordinal per document.
    pub fn ords(&self) -> &[i32] {
        &self.ords
    }
}

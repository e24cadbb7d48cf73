//! The matcher seam consumed when resolving deletions.
//!
//! Query evaluation proper lives outside this crate. The index core only
//! consumes a [`Matcher`]: an opaque predicate over one segment's local doc
//! ids. [`TermQuery`] is the built-in query used by delete-by-term; anything
//! richer implements [`DeletionQuery`] externally.

use bit_vec::BitVec;

use crate::error::Result;
use crate::index::seg_reader::SegReader;

/// An opaque predicate over local document ids.
pub trait Matcher {
    /// Whether the document with the given local id matches.
    fn matches(&self, local_id: u32) -> bool;
}

/// A matcher backed by a bitset.
#[derive(Debug, Clone)]
pub struct BitsMatcher {
    bits: BitVec,
}

impl BitsMatcher {
    /// Create a matcher from a bitset.
    pub fn new(bits: BitVec) -> Self {
        BitsMatcher { bits }
    }
}

impl Matcher for BitsMatcher {
    fn matches(&self, local_id: u32) -> bool {
        self.bits.get(local_id as usize).unwrap_or(false)
    }
}

/// A deletion predicate that can be resolved against any segment.
pub trait DeletionQuery: Send + Sync + std::fmt::Debug {
    /// Build a matcher identifying this query's documents within one segment.
    fn matcher_for(&self, reader: &SegReader) -> Result<Box<dyn Matcher>>;
}

/// Matches every document containing `term` in an indexed field.
#[derive(Debug, Clone)]
pub struct TermQuery {
    field: String,
    term: String,
}

impl TermQuery {
    /// Create a term query over a canonical field name.
    pub fn new<S: Into<String>, T: Into<String>>(field: S, term: T) -> Self {
        TermQuery {
            field: field.into(),
            term: term.into(),
        }
    }

    /// The queried field.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The queried term.
    pub fn term(&self) -> &str {
        &self.term
    }
}

impl DeletionQuery for TermQuery {
    fn matcher_for(&self, reader: &SegReader) -> Result<Box<dyn Matcher>> {
        let mut bits = BitVec::from_elem(reader.doc_max() as usize, false);
        if let Some(postings) = reader.postings().postings(&self.field, &self.term) {
            for posting in postings {
                bits.set(posting.doc_id as usize, true);
            }
        }
        Ok(Box::new(BitsMatcher::new(bits)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_matcher() {
        let mut bits = BitVec::from_elem(4, false);
        bits.set(2, true);
        let matcher = BitsMatcher::new(bits);

        assert!(!matcher.matches(0));
        assert!(matcher.matches(2));
        // Out-of-range ids never match.
        assert!(!matcher.matches(99));
    }
}

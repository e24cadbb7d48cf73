//! Field types and per-field options.

use serde::{Deserialize, Serialize};

use crate::document::FieldValue;

/// The declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Analyzed text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating point.
    Float,
    /// Boolean flag.
    Boolean,
    /// Raw bytes (stored only, never indexed).
    Bytes,
}

impl FieldType {
    /// Check whether a field value matches this declared type.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (FieldType::Text, FieldValue::Text(_))
                | (FieldType::Integer, FieldValue::Integer(_))
                | (FieldType::Float, FieldValue::Float(_))
                | (FieldType::Boolean, FieldValue::Boolean(_))
                | (FieldType::Bytes, FieldValue::Bytes(_))
        )
    }
}

/// Per-field indexing options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Declared value type.
    pub field_type: FieldType,

    /// Whether the field's terms go into the inverted index.
    pub indexed: bool,

    /// Whether the raw value is kept in the stored-documents component.
    pub stored: bool,

    /// Whether a sort cache is built for the field.
    pub sortable: bool,

    /// Whether term vectors (positions and offsets) are recorded for
    /// excerpting/highlighting.
    pub highlighted: bool,
}

impl FieldSpec {
    /// Create a spec with the given type, indexed and stored by default.
    pub fn new(field_type: FieldType) -> Self {
        FieldSpec {
            field_type,
            indexed: !matches!(field_type, FieldType::Bytes),
            stored: true,
            sortable: false,
            highlighted: false,
        }
    }

    /// A text field.
    pub fn text() -> Self {
        Self::new(FieldType::Text)
    }

    /// An integer field.
    pub fn integer() -> Self {
        Self::new(FieldType::Integer)
    }

    /// A float field.
    pub fn float() -> Self {
        Self::new(FieldType::Float)
    }

    /// A boolean field.
    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    /// A bytes field (stored only).
    pub fn bytes() -> Self {
        Self::new(FieldType::Bytes)
    }

    /// Set whether the field is indexed.
    pub fn indexed(mut self, indexed: bool) -> Self {
        self.indexed = indexed;
        self
    }

    /// Set whether the field is stored.
    pub fn stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }

    /// Set whether the field is sortable.
    pub fn sortable(mut self, sortable: bool) -> Self {
        self.sortable = sortable;
        self
    }

    /// Set whether term vectors are recorded for the field.
    pub fn highlighted(mut self, highlighted: bool) -> Self {
        self.highlighted = highlighted;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_accepts() {
        assert!(FieldType::Text.accepts(&FieldValue::Text("x".to_string())));
        assert!(FieldType::Integer.accepts(&FieldValue::Integer(1)));
        assert!(!FieldType::Text.accepts(&FieldValue::Integer(1)));
        assert!(!FieldType::Integer.accepts(&FieldValue::Float(1.0)));
        assert!(!FieldType::Bytes.accepts(&FieldValue::List(vec![])));
    }

    #[test]
    fn test_spec_defaults() {
        let spec = FieldSpec::text();
        assert!(spec.indexed);
        assert!(spec.stored);
        assert!(!spec.sortable);
        assert!(!spec.highlighted);

        // Bytes fields are never indexed by default.
        assert!(!FieldSpec::bytes().indexed);
    }

    #[test]
    fn test_spec_builder_chain() {
        let spec = FieldSpec::text().stored(false).sortable(true).highlighted(true);
        assert!(!spec.stored);
        assert!(spec.sortable);
        assert!(spec.highlighted);
    }
}

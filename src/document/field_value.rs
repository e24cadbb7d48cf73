//! Field value types for documents.
//!
//! [`FieldValue`] is the explicit variant type exchanged across the
//! indexing boundary: no runtime reflection, just a closed set of value
//! shapes with defined equality and ordering of their text forms.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Represents a value for a field in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Text value
    Text(String),
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value
    Boolean(bool),
    /// Binary data
    Bytes(Vec<u8>),
    /// Nested list of values
    List(Vec<FieldValue>),
    /// Nested map of values
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Get the value as text, if it is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the value as a float, if it is a float value.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get the value as a boolean, if it is a boolean value.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the value as bytes, if it is a binary value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// A short name for the value's shape, used in schema error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::List(_) => "list",
            FieldValue::Map(_) => "map",
        }
    }

    /// The single indexable term for a non-text value. Text values go
    /// through analysis instead and have no fixed term form.
    pub fn index_term(&self) -> Option<String> {
        match self {
            FieldValue::Text(_) => None,
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Boolean(b) => Some(b.to_string()),
            FieldValue::Bytes(_) | FieldValue::List(_) | FieldValue::Map(_) => None,
        }
    }

    /// The canonical single-term text form used when indexing non-text
    /// values and when building sort keys.
    ///
    /// Integers are zero-padded so lexical order matches numeric order for
    /// non-negative values.
    pub fn sort_key(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(i) => Some(format!("{i:020}")),
            FieldValue::Float(f) => Some(format!("{f}")),
            FieldValue::Boolean(b) => Some(if *b { "T" } else { "F" }.to_string()),
            FieldValue::Bytes(_) | FieldValue::List(_) | FieldValue::Map(_) => None,
        }
    }
}

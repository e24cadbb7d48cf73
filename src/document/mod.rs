//! Document model: field values and the document container.

pub mod document;
pub mod field_value;

pub use document::{Document, DocumentBuilder};
pub use field_value::FieldValue;

//! Schema: declared field types and per-field indexing options.

pub mod field;
pub mod schema;

pub use field::{FieldSpec, FieldType};
pub use schema::{Schema, SchemaBuilder};

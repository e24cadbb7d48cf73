//! Schema registry with case-insensitive field resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{KestrelError, Result};
use crate::schema::field::FieldSpec;

/// The set of declared fields for an index.
///
/// Field names are matched case-insensitively on lookup, but the canonical
/// (declared) spelling is what gets written into segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    /// Declared fields by canonical name.
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// Create a builder for constructing a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Get the spec for a canonical field name.
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Resolve a field name case-insensitively to its canonical spelling.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if self.fields.contains_key(name) {
            return self.fields.get_key_value(name).map(|(k, _)| k.as_str());
        }
        let lowered = name.to_lowercase();
        self.fields
            .keys()
            .find(|k| k.to_lowercase() == lowered)
            .map(|k| k.as_str())
    }

    /// Iterate declared fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the schema declares no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate a document against the schema and rewrite field names to
    /// their canonical spelling.
    ///
    /// Fails with a schema error on an unknown field or a value whose shape
    /// does not match the declared type; the document is returned untouched
    /// by side effects either way.
    pub fn validate_doc(&self, doc: &Document) -> Result<Document> {
        let mut canonical = Document::new();

        for (name, value) in doc.fields() {
            let resolved = self.resolve(name).ok_or_else(|| {
                KestrelError::schema(format!("Unknown field '{name}'"))
            })?;
            let spec = &self.fields[resolved];

            if !spec.field_type.accepts(value) {
                return Err(KestrelError::schema(format!(
                    "Field '{resolved}' expects {:?}, got {}",
                    spec.field_type,
                    value.type_name()
                )));
            }

            canonical.add_field(resolved, value.clone());
        }

        Ok(canonical)
    }
}

/// A builder for constructing schemas.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: BTreeMap<String, FieldSpec>,
}

impl SchemaBuilder {
    /// Create a new schema builder.
    pub fn new() -> Self {
        SchemaBuilder {
            fields: BTreeMap::new(),
        }
    }

    /// Add a field to the schema.
    pub fn add_field<S: Into<String>>(mut self, name: S, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Build the schema.
    ///
    /// Fails if two declared names collide case-insensitively, since lookup
    /// could then resolve ambiguously.
    pub fn build(self) -> Result<Schema> {
        let mut seen = BTreeMap::new();
        for name in self.fields.keys() {
            if let Some(other) = seen.insert(name.to_lowercase(), name.clone()) {
                return Err(KestrelError::schema(format!(
                    "Field names '{other}' and '{name}' collide case-insensitively"
                )));
            }
        }

        Ok(Schema {
            fields: self.fields,
        })
    }
}

//! Schema-less documents.
//!
//! A document is an ordered mapping from field name to [`Value`]. Nested
//! documents are addressed with dotted paths such as `address.city`.

use crate::{DocumentId, Error, Result, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier field.
pub const DOC_ID: &str = "_id";
/// Revision counter, 1 on insert and incremented on every update.
pub const DOC_REVISION: &str = "_revision";
/// Last-modified time in epoch milliseconds.
pub const DOC_MODIFIED: &str = "_modified";
/// Origin tag of the last write.
pub const DOC_SOURCE: &str = "_source";
/// Value of [`DOC_SOURCE`] for writes applied by the replicator.
pub const REPLICATOR: &str = "replicator";

const FIELD_SEPARATOR: char = '.';

/// A schema-less document.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style put for literal field names. Dotted names create nested
    /// documents. Invalid paths are ignored; use [`Document::put`] to see the
    /// error.
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        let _ = self.put(path, value);
        self
    }

    /// Build a document from a JSON object.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        match Value::from_json(json) {
            Value::Document(doc) => Ok(doc),
            other => Err(Error::Validation(format!(
                "expected a JSON object, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Convert to a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Read a field by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split(FIELD_SEPARATOR);
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = current.as_document()?.fields.get(segment)?;
        }
        Some(current)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Write a field by dotted path, creating intermediate documents.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        if path.is_empty() || path.split(FIELD_SEPARATOR).any(str::is_empty) {
            return Err(Error::Validation(format!("invalid field name '{path}'")));
        }

        let mut current = self;
        let mut segments = path.split(FIELD_SEPARATOR).peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                current.fields.insert(segment.to_string(), value.into());
                return Ok(());
            }
            let slot = current
                .fields
                .entry(segment.to_string())
                .or_insert_with(|| Value::Document(Document::new()));
            if slot.is_null() {
                *slot = Value::Document(Document::new());
            }
            current = slot.as_document_mut().ok_or_else(|| {
                Error::Validation(format!("field '{segment}' in '{path}' is not a document"))
            })?;
        }
        Ok(())
    }

    /// Insert a top-level field without interpreting dots.
    pub(crate) fn insert_raw(&mut self, key: String, value: Value) {
        self.fields.insert(key, value);
    }

    /// Remove a field by dotted path, returning its previous value.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        match path.rsplit_once(FIELD_SEPARATOR) {
            None => self.fields.remove(path),
            Some((parent, leaf)) => {
                let mut current = self;
                for segment in parent.split(FIELD_SEPARATOR) {
                    current = current.fields.get_mut(segment)?.as_document_mut()?;
                }
                current.fields.remove(leaf)
            }
        }
    }

    /// Top-level fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The document id, if one is set.
    ///
    /// Non-negative integers become numeric ids and strings become text ids.
    /// Anything else is rejected.
    pub fn id(&self) -> Result<Option<DocumentId>> {
        match self.fields.get(DOC_ID) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => DocumentId::from_value(value).map(Some),
        }
    }

    pub fn set_id(&mut self, id: &DocumentId) {
        self.fields.insert(DOC_ID.to_string(), id.to_value());
    }

    pub fn revision(&self) -> i64 {
        self.fields
            .get(DOC_REVISION)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn set_revision(&mut self, revision: i64) {
        self.fields
            .insert(DOC_REVISION.to_string(), Value::Int(revision));
    }

    pub fn last_modified(&self) -> Timestamp {
        self.fields
            .get(DOC_MODIFIED)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn set_last_modified(&mut self, millis: Timestamp) {
        self.fields
            .insert(DOC_MODIFIED.to_string(), Value::Int(millis));
    }

    pub fn source(&self) -> Option<&str> {
        self.fields.get(DOC_SOURCE).and_then(Value::as_str)
    }

    pub fn set_source(&mut self, source: &str) {
        self.fields
            .insert(DOC_SOURCE.to_string(), Value::from(source));
    }

    pub fn clear_source(&mut self) {
        self.fields.remove(DOC_SOURCE);
    }

    /// Whether the last write came from the replicator.
    pub fn is_replicated(&self) -> bool {
        self.source() == Some(REPLICATOR)
    }

    /// Merge another document into this one. Nested documents merge
    /// recursively, every other value is overwritten.
    pub fn merge(&mut self, other: &Document) {
        for (key, incoming) in &other.fields {
            match (self.fields.get_mut(key), incoming) {
                (Some(Value::Document(existing)), Value::Document(nested)) => {
                    existing.merge(nested);
                }
                _ => {
                    self.fields.insert(key.clone(), incoming.clone());
                }
            }
        }
    }

    /// Copy of the document without reserved fields.
    pub fn user_fields(&self) -> Document {
        let fields = self
            .fields
            .iter()
            .filter(|(key, _)| !is_reserved(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Document { fields }
    }
}

/// Whether a top-level field name is reserved by the engine.
pub fn is_reserved(field: &str) -> bool {
    matches!(field, DOC_ID | DOC_REVISION | DOC_MODIFIED | DOC_SOURCE)
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Document {
            fields: iter.into_iter().collect(),
        }
    }
}

//! Local document model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Collection-specific fields of a document, keyed by field name.
pub type Payload = Map<String, Value>;

/// Generate a new time-ordered document identifier.
pub fn new_document_id() -> String {
    Uuid::now_v7().to_string()
}

/// A record in a named local collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier, never reused within a collection
    pub id: String,
    /// Tombstone flag for soft deletes
    pub deleted: bool,
    /// Last modification marker as reported by the remote (`updated_at`)
    pub modified: Option<String>,
    /// Collection-specific fields, without `id`
    pub payload: Payload,
}

impl Document {
    /// Create a live document with no known remote marker.
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            deleted: false,
            modified: None,
            payload,
        }
    }

    /// Set the remote modification marker.
    #[must_use]
    pub fn with_modified(mut self, modified: impl Into<String>) -> Self {
        self.modified = Some(modified.into());
        self
    }

    /// Read a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name).filter(|value| !value.is_null())
    }

    /// Read a payload field as an integer, accepting numeric strings.
    pub fn int_field(&self, name: &str) -> Option<i64> {
        match self.field(name)? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Read a payload field as text.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }
}

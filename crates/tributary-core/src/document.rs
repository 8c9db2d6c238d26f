//! Schemaless document values.
//!
//! Payloads are intentionally opaque trees. `Document` wraps a JSON object
//! and exposes field-level operations; `DocumentDelta` is the `{set, unset}`
//! update form applied as a top-level merge; `DocumentId` is the logical key
//! with exact, type-sensitive equality (the string `"1"`, the integer `1`
//! and the float `1.0` are three different keys).

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Field name that carries a document's logical key.
pub const ID_FIELD: &str = "_id";

/// An opaque schemaless document: a JSON object with field operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// An empty document.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps an existing JSON object map.
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Converts a JSON value into a document.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the value is not an object.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::validation(format!(
                "document payload must be an object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Returns the value of a top-level field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets a top-level field, returning the previous value if any.
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    /// Removes a top-level field, returning the previous value if any.
    pub fn unset(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// The document's logical key, read from the `_id` field.
    #[must_use]
    pub fn id(&self) -> Option<DocumentId> {
        self.0.get(ID_FIELD).cloned().map(DocumentId::new)
    }

    /// Writes the `_id` field.
    pub fn set_id(&mut self, id: &DocumentId) {
        self.0.insert(ID_FIELD.to_string(), id.as_value().clone());
    }

    /// Number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the document has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying object map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume the document into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A field-level update: `set` merges at the top level, then `unset` removes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentDelta {
    /// Fields to write (top-level merge; nested values replace wholesale).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub set: Map<String, Value>,

    /// Fields to remove, applied after `set`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
}

impl DocumentDelta {
    /// An empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field write.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set.insert(field.into(), value);
        self
    }

    /// Adds a field removal.
    #[must_use]
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    /// True when the delta changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Applies the delta to a document in place.
    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            doc.set(field.clone(), value.clone());
        }
        for field in &self.unset {
            doc.unset(field);
        }
    }
}

/// The logical key of a document.
///
/// Wraps an arbitrary JSON value; equality and hashing are exact and
/// type-sensitive, as supplied by the WAL payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Value);

impl DocumentId {
    /// Wraps an existing key value.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Creates a string key.
    #[must_use]
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(Value::String(value.into()))
    }

    /// Generates a fresh UUIDv7 string key.
    #[must_use]
    pub fn generate() -> Self {
        Self(Value::String(Uuid::now_v7().to_string()))
    }

    /// Borrow the key value.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

// Document ids are keys: `Value` equality is already type-exact, and float
// keys with NaN are rejected by serde_json at construction, so full Eq holds.
impl Eq for DocumentId {}

impl Hash for DocumentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0, state);
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Value::String(s) => write!(f, "{s}"),
            other => write!(f, "{other}"),
        }
    }
}

impl From<Value> for DocumentId {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => state.write_u8(0),
        Value::Bool(b) => {
            state.write_u8(1);
            b.hash(state);
        }
        Value::Number(n) => {
            state.write_u8(2);
            // serde_json keeps u64/i64/f64 representations distinct, which
            // matches the type-exact equality rule.
            n.to_string().hash(state);
        }
        Value::String(s) => {
            state.write_u8(3);
            s.hash(state);
        }
        Value::Array(items) => {
            state.write_u8(4);
            state.write_usize(items.len());
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            state.write_u8(5);
            state.write_usize(map.len());
            for (key, item) in map {
                key.hash(state);
                hash_value(item, state);
            }
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Common types used throughout the live query engine.
///
/// Rows are immutable values shared behind `Arc`. The engine never mutates a
/// row in place: a changed row is a new `Row`, and an unchanged row keeps the
/// very same allocation across refreshes so callers can compare by identity.
use crate::error::{LiveError, LiveResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Internal column carrying a row's content hash.
///
/// The delta statement adds this column to every row it returns. It is
/// stripped before any row is handed to a subscriber.
pub const HASH_FIELD: &str = "___hash";

/// Name of the named parameter that carries known hashes.
pub const HASHES_PARAM: &str = "___hashes";

/// Conventional identifier column used when no key field is configured.
pub const DEFAULT_KEY_FIELD: &str = "_id";

/// A single result row: an ordered mapping of column name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    columns: Map<String, JsonValue>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column, consuming and returning the row.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns.get(column)
    }

    /// All columns in their original order.
    pub fn columns(&self) -> &Map<String, JsonValue> {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The row's key under the given key field.
    pub fn key(&self, key_field: &str) -> RowKey {
        RowKey::from_value(self.columns.get(key_field).unwrap_or(&JsonValue::Null))
    }

    /// Compute the content hash over the row's canonical JSON form.
    pub fn content_hash(&self) -> ContentHash {
        let canonical = canonical_json(&JsonValue::Object(self.columns.clone()));
        // Serializing a `Value` cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        ContentHash(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Split off the internal hash column, if present.
    pub(crate) fn take_hash(mut self) -> (Row, Option<ContentHash>) {
        let hash = match self.columns.shift_remove(HASH_FIELD) {
            Some(JsonValue::String(hash)) => Some(ContentHash(hash)),
            Some(other) => Some(ContentHash(other.to_string())),
            None => None,
        };
        (self, hash)
    }

    /// Consume the row, returning its columns.
    pub fn into_map(self) -> Map<String, JsonValue> {
        self.columns
    }

    /// Convert to a JSON object.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.columns.clone())
    }
}

impl From<Map<String, JsonValue>> for Row {
    fn from(columns: Map<String, JsonValue>) -> Self {
        Self { columns }
    }
}

impl TryFrom<JsonValue> for Row {
    type Error = LiveError;

    fn try_from(value: JsonValue) -> LiveResult<Self> {
        match value {
            JsonValue::Object(columns) => Ok(Self { columns }),
            other => Err(LiveError::invalid(format!(
                "row must be a JSON object, got {}",
                other
            ))),
        }
    }
}

/// Identity of a row within one query's result set.
///
/// Holds the canonical JSON text of the key column's value, so `1` and `"1"`
/// are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(pub String);

impl RowKey {
    /// Build a key from a JSON value.
    pub fn from_value(value: &JsonValue) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of a row's serialized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// The hash as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bound query parameters.
///
/// A query takes either positional parameters (`$1`, `$2`, ...) or named
/// parameters (`${name}` / `$[name]`), never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Params {
    /// No parameters.
    #[default]
    None,
    /// Positional parameters.
    Positional(Vec<JsonValue>),
    /// Named parameters.
    Named(Map<String, JsonValue>),
}

impl Params {
    /// Serialize any value into parameters.
    ///
    /// Arrays become positional, objects become named, `null` means no
    /// parameters and any other scalar is a single positional parameter.
    pub fn from_serialize<T: Serialize>(value: &T) -> LiveResult<Self> {
        let value = serde_json::to_value(value).map_err(|e| {
            LiveError::invalid(format!("parameters are not serializable: {}", e))
        })?;
        Ok(Self::from(value))
    }

    /// Positional view of the parameters; `None` is the empty sequence.
    pub fn positional(&self) -> Option<&[JsonValue]> {
        match self {
            Params::None => Some(&[]),
            Params::Positional(values) => Some(values),
            Params::Named(_) => None,
        }
    }

    /// Look up a positional parameter (1-based, as in `$1`).
    pub fn nth(&self, index: usize) -> Option<&JsonValue> {
        match self {
            Params::Positional(values) if index > 0 => values.get(index - 1),
            _ => None,
        }
    }

    /// Look up a named parameter.
    pub fn named(&self, name: &str) -> Option<&JsonValue> {
        match self {
            Params::Named(map) => map.get(name),
            _ => None,
        }
    }

    /// Whether no parameters are bound.
    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Positional(values) => values.is_empty(),
            Params::Named(map) => map.is_empty(),
        }
    }

    /// Canonical JSON form used for hashing: object keys are sorted so that
    /// equal mappings hash equally regardless of insertion order.
    pub fn canonical(&self) -> JsonValue {
        match self {
            Params::None => JsonValue::Null,
            Params::Positional(values) => canonical_json(&JsonValue::Array(values.clone())),
            Params::Named(map) => canonical_json(&JsonValue::Object(map.clone())),
        }
    }
}

impl From<JsonValue> for Params {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Params::None,
            JsonValue::Array(values) => Params::Positional(values),
            JsonValue::Object(map) => Params::Named(map),
            scalar => Params::Positional(vec![scalar]),
        }
    }
}

impl From<Vec<JsonValue>> for Params {
    fn from(values: Vec<JsonValue>) -> Self {
        Params::Positional(values)
    }
}

impl From<Map<String, JsonValue>> for Params {
    fn from(map: Map<String, JsonValue>) -> Self {
        Params::Named(map)
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

/// Stable identity of a (query, parameters, key field) registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey([u8; 32]);

impl QueryKey {
    /// Derive the key from the query text, its parameters and key field.
    pub fn derive(query: &str, params: &Params, key_field: &str) -> Self {
        let canonical = JsonValue::Array(vec![
            JsonValue::String(query.to_string()),
            params.canonical(),
            JsonValue::String(key_field.to_string()),
        ]);
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(*blake3::hash(&bytes).as_bytes())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A row as held in the canonical cache: identity, content hash and the
/// shared public row.
#[derive(Debug)]
pub(crate) struct CachedRow {
    pub key: RowKey,
    pub hash: ContentHash,
    pub row: Arc<Row>,
}

/// Rewrite a JSON value with object keys sorted at every level.
pub(crate) fn canonical_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let sorted: BTreeMap<&String, JsonValue> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            JsonValue::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        JsonValue::Array(values) => JsonValue::Array(values.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Delta statement builder.
///
/// Rewrites a caller's query into a statement that reports the key and
/// content hash of every current row, but full column data only for rows
/// whose hash the caller does not already hold:
///
/// ```text
/// WITH
///   res AS ( <query> ),
///   data AS ( SELECT res.*, MD5(...) AS ___hash FROM res ),
///   data2 AS ( SELECT data.* FROM data WHERE NOT (___hash = ANY (<hashes>)) )
/// SELECT data2.*, data.<key> AS <key>, data.___hash AS ___hash
/// FROM data LEFT JOIN data2 USING(<key>)
/// ```
///
/// Known rows come back as key + hash markers, so previously fetched rows
/// can be reused, while removals and reorderings stay visible.
use crate::error::{LiveError, LiveResult};
use crate::types::{ContentHash, HASH_FIELD, HASHES_PARAM, Params};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::LazyLock;

/// Value bound in place of the hash set when no hashes are known yet.
///
/// `= ANY(...)` must receive at least one comparable value, so the first
/// fetch binds this marker instead of an empty array.
pub const SENTINEL_HASH: &str = "x";

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

static RENDERED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?s)^\s*WITH\s+res AS \(\n(?P<source>.*)\n  \),\s+data AS \(.*?",
        r"WHERE NOT \(___hash = ANY \((?P<placeholder>\$\d+|\$\{\w+\})\)\)\s*\)\s*",
        r"SELECT data2\.\*, data\.(?P<key>\w+) AS \w+, data\.___hash AS ___hash\s+",
        r"FROM data\s+LEFT JOIN data2 USING\(\w+\)\s*$",
    ))
    .expect("valid delta statement regex")
});

/// Where the known-hash array is bound in the delta statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashPlaceholder {
    /// Positional parameter `$n`.
    Positional(usize),
    /// Named parameter `${___hashes}`.
    Named,
}

impl HashPlaceholder {
    /// Pick the placeholder for the given parameter shape: one past the last
    /// positional parameter, or the reserved named parameter.
    pub fn for_params(params: &Params) -> Self {
        match params {
            Params::None => HashPlaceholder::Positional(1),
            Params::Positional(values) => HashPlaceholder::Positional(values.len() + 1),
            Params::Named(_) => HashPlaceholder::Named,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        if let Some(index) = text.strip_prefix('$').and_then(|n| n.parse().ok()) {
            return Some(HashPlaceholder::Positional(index));
        }
        (text == format!("${{{}}}", HASHES_PARAM)).then_some(HashPlaceholder::Named)
    }
}

impl fmt::Display for HashPlaceholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashPlaceholder::Positional(index) => write!(f, "${}", index),
            HashPlaceholder::Named => write!(f, "${{{}}}", HASHES_PARAM),
        }
    }
}

/// Hashes the caller already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownHashes {
    /// Nothing fetched yet.
    Sentinel,
    /// Hashes of the currently cached rows.
    Set(Vec<ContentHash>),
}

impl KnownHashes {
    /// Build from cached hashes; an empty cache still binds the sentinel.
    pub fn from_hashes(hashes: Vec<ContentHash>) -> Self {
        if hashes.is_empty() {
            KnownHashes::Sentinel
        } else {
            KnownHashes::Set(hashes)
        }
    }

    /// The array value bound to the placeholder.
    pub fn to_json(&self) -> JsonValue {
        match self {
            KnownHashes::Sentinel => JsonValue::Array(vec![JsonValue::from(SENTINEL_HASH)]),
            KnownHashes::Set(hashes) => JsonValue::Array(
                hashes
                    .iter()
                    .map(|h| JsonValue::from(h.as_str()))
                    .collect(),
            ),
        }
    }

    /// Whether a hash is known. The sentinel knows nothing.
    pub fn contains(&self, hash: &str) -> bool {
        match self {
            KnownHashes::Sentinel => false,
            KnownHashes::Set(hashes) => hashes.iter().any(|h| h.as_str() == hash),
        }
    }

    /// Recover the known set from a bound array value.
    pub fn from_json(value: &JsonValue) -> Self {
        let hashes: Vec<ContentHash> = value
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter(|h| *h != SENTINEL_HASH)
                    .map(|h| ContentHash(h.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Self::from_hashes(hashes)
    }
}

/// A rendered delta statement for one live query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaQuery {
    source: String,
    key_field: String,
    placeholder: HashPlaceholder,
    sql: String,
}

impl DeltaQuery {
    /// Render the delta statement for `source`.
    ///
    /// The key field is interpolated into SQL, so it must be a plain
    /// identifier.
    pub fn build(source: &str, params: &Params, key_field: &str) -> LiveResult<Self> {
        if source.trim().is_empty() {
            return Err(LiveError::invalid("query must not be empty"));
        }
        if !IDENTIFIER.is_match(key_field) {
            return Err(LiveError::invalid(format!(
                "key field '{}' is not a plain identifier",
                key_field
            )));
        }

        let source = source.trim_end().trim_end_matches(';').to_string();
        let placeholder = HashPlaceholder::for_params(params);
        let sql = render(&source, key_field, &placeholder);

        Ok(Self {
            source,
            key_field: key_field.to_string(),
            placeholder,
            sql,
        })
    }

    /// Recognize a statement produced by [`DeltaQuery::build`].
    pub fn parse(sql: &str) -> Option<Self> {
        let caps = RENDERED.captures(sql)?;
        let source = caps.name("source")?.as_str().to_string();
        let key_field = caps.name("key")?.as_str().to_string();
        let placeholder = HashPlaceholder::parse(caps.name("placeholder")?.as_str())?;

        Some(Self {
            source,
            key_field,
            placeholder,
            sql: sql.to_string(),
        })
    }

    /// The statement text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The caller's original query.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The key field joined on.
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Where the hash array is bound.
    pub fn placeholder(&self) -> &HashPlaceholder {
        &self.placeholder
    }

    /// Bind the caller's parameters plus the known hashes.
    pub fn bind(&self, params: &Params, known: &KnownHashes) -> Params {
        let hashes = known.to_json();
        match params {
            Params::None => Params::Positional(vec![hashes]),
            Params::Positional(values) => {
                let mut values = values.clone();
                values.push(hashes);
                Params::Positional(values)
            }
            Params::Named(map) => {
                let mut map = map.clone();
                map.insert(HASHES_PARAM.to_string(), hashes);
                Params::Named(map)
            }
        }
    }

    /// Split bound parameters back into the caller's parameters and the
    /// known hashes.
    pub fn unbind(&self, params: &Params) -> (Params, KnownHashes) {
        match (&self.placeholder, params) {
            (HashPlaceholder::Positional(index), Params::Positional(values))
                if values.len() == *index =>
            {
                let mut values = values.clone();
                let known = values
                    .pop()
                    .map(|v| KnownHashes::from_json(&v))
                    .unwrap_or(KnownHashes::Sentinel);
                let params = if values.is_empty() {
                    Params::None
                } else {
                    Params::Positional(values)
                };
                (params, known)
            }
            (HashPlaceholder::Named, Params::Named(map)) => {
                let mut map = map.clone();
                let known = map
                    .shift_remove(HASHES_PARAM)
                    .map(|v| KnownHashes::from_json(&v))
                    .unwrap_or(KnownHashes::Sentinel);
                (Params::Named(map), known)
            }
            _ => (params.clone(), KnownHashes::Sentinel),
        }
    }
}

fn render(source: &str, key_field: &str, placeholder: &HashPlaceholder) -> String {
    format!(
        "WITH
  res AS (
{source}
  ),
  data AS (
    SELECT res.*, MD5(CAST(ROW_TO_JSON(res.*) AS TEXT)) AS {hash}
    FROM res
  ),
  data2 AS (
    SELECT data.*
    FROM data
    WHERE NOT ({hash} = ANY ({placeholder}))
  )
SELECT data2.*, data.{key} AS {key}, data.{hash} AS {hash}
FROM data
LEFT JOIN data2 USING({key})
",
        source = source,
        hash = HASH_FIELD,
        placeholder = placeholder,
        key = key_field,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholder_positions() {
        assert_eq!(
            HashPlaceholder::for_params(&Params::None),
            HashPlaceholder::Positional(1)
        );
        assert_eq!(
            HashPlaceholder::for_params(&Params::from(json!([1, 2]))),
            HashPlaceholder::Positional(3)
        );
        assert_eq!(
            HashPlaceholder::for_params(&Params::from(json!({"id": 3}))),
            HashPlaceholder::Named
        );
        assert_eq!(HashPlaceholder::Named.to_string(), "${___hashes}");
    }

    #[test]
    fn test_render_shape() {
        let params = Params::from(json!([3]));
        let delta = DeltaQuery::build("SELECT * FROM t WHERE id < $1;", &params, "id").unwrap();

        assert!(delta.sql().contains("SELECT * FROM t WHERE id < $1\n"));
        assert!(delta.sql().contains("WHERE NOT (___hash = ANY ($2))"));
        assert!(delta.sql().contains("data.id AS id"));
        assert!(delta.sql().contains("LEFT JOIN data2 USING(id)"));
    }

    #[test]
    fn test_parse_inverts_build() {
        let params = Params::from(json!({"id": 3}));
        let built = DeltaQuery::build("SELECT *\nFROM test\nWHERE id < $[id]", &params, "id")
            .unwrap();
        let parsed = DeltaQuery::parse(built.sql()).unwrap();

        assert_eq!(parsed, built);
        assert!(DeltaQuery::parse("SELECT * FROM t").is_none());
    }

    #[test]
    fn test_rejects_bad_key_field() {
        let err = DeltaQuery::build("SELECT 1", &Params::None, "id; DROP TABLE t").unwrap_err();
        assert!(matches!(err, LiveError::InvalidArgument { .. }));
        assert!(DeltaQuery::build("   ", &Params::None, "id").is_err());
    }

    #[test]
    fn test_bind_sentinel_and_set() {
        let delta = DeltaQuery::build("SELECT * FROM t", &Params::None, "id").unwrap();

        let bound = delta.bind(&Params::None, &KnownHashes::Sentinel);
        assert_eq!(bound, Params::Positional(vec![json!(["x"])]));

        let known = KnownHashes::from_hashes(vec![ContentHash("h1".into())]);
        let bound = delta.bind(&Params::None, &known);
        assert_eq!(bound, Params::Positional(vec![json!(["h1"])]));

        let (params, recovered) = delta.unbind(&bound);
        assert_eq!(params, Params::None);
        assert_eq!(recovered, known);
    }

    #[test]
    fn test_bind_named_does_not_touch_caller_params() {
        let params = Params::from(json!({"id": 3}));
        let delta = DeltaQuery::build("SELECT * FROM t WHERE id < ${id}", &params, "id").unwrap();

        let bound = delta.bind(&params, &KnownHashes::Sentinel);
        assert_eq!(bound.named(HASHES_PARAM), Some(&json!(["x"])));
        assert!(params.named(HASHES_PARAM).is_none());

        let (unbound, known) = delta.unbind(&bound);
        assert_eq!(unbound, params);
        assert_eq!(known, KnownHashes::Sentinel);
    }

    #[test]
    fn test_empty_hash_list_becomes_sentinel() {
        assert_eq!(KnownHashes::from_hashes(Vec::new()), KnownHashes::Sentinel);
        assert!(!KnownHashes::Sentinel.contains(SENTINEL_HASH));
    }
}

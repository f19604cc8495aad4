//! Query keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Ordered list of values identifying a cached query,
/// e.g. `["museums", "detail", "abc123"]` or `["museums", "list", {"page": 2}]`.
///
/// Two keys are the same query when their parts are deeply equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
  pub fn new(parts: Vec<Value>) -> Self {
    Self(parts)
  }

  pub fn parts(&self) -> &[Value] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Stable hash of the key, used as the in-memory index.
  ///
  /// Object fields serialize in sorted order, so deep-equal keys hash the same
  /// regardless of how they were built.
  pub fn cache_hash(&self) -> String {
    let canonical = serde_json::to_string(&self.0).unwrap_or_default();

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Whether `prefix` matches the leading parts of this key.
  ///
  /// Object parts match partially: every field of the prefix object must be
  /// present and equal in this key's object.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    prefix.0.len() <= self.0.len()
      && prefix
        .0
        .iter()
        .zip(&self.0)
        .all(|(p, k)| partial_match(p, k))
  }
}

fn partial_match(prefix: &Value, value: &Value) -> bool {
  match (prefix, value) {
    (Value::Object(p), Value::Object(v)) => p
      .iter()
      .all(|(field, pv)| v.get(field).is_some_and(|vv| partial_match(pv, vv))),
    _ => prefix == value,
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self
      .0
      .iter()
      .map(|p| match p {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      })
      .collect();
    write!(f, "{}", parts.join(":"))
  }
}

impl From<Vec<Value>> for QueryKey {
  fn from(parts: Vec<Value>) -> Self {
    Self(parts)
  }
}

impl From<&[&str]> for QueryKey {
  fn from(parts: &[&str]) -> Self {
    Self(parts.iter().map(|p| Value::String(p.to_string())).collect())
  }
}

/// Convert one key part. Used by [`query_key!`](crate::query_key).
pub fn key_part<T: Serialize + ?Sized>(part: &T) -> Value {
  serde_json::to_value(part).unwrap_or(Value::Null)
}

/// Build a [`QueryKey`] from any serializable parts.
///
/// ```ignore
/// let key = query_key!["museums", "detail", museum_id];
/// let page = query_key!["museums", "list", Filter { page: 2 }];
/// ```
#[macro_export]
macro_rules! query_key {
  ($($part:expr),* $(,)?) => {
    $crate::cache::QueryKey::new(vec![$($crate::cache::key_part(&$part)),*])
  };
}

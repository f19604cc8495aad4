//! Persisted form of the query cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::QueryKey;

/// Whole-cache snapshot written under a single storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
  /// Build version tag; snapshots from other builds are discarded
  pub buster: String,
  pub timestamp: DateTime<Utc>,
  pub entries: Vec<PersistedEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
  pub key: QueryKey,
  pub value: Value,
  pub inserted_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Why a stored snapshot was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
  Corrupt(String),
  BusterMismatch { found: String, expected: String },
  Expired { age: Duration },
}

impl PersistedSnapshot {
  /// Parse and validate a stored snapshot against the running build.
  pub fn decode(
    raw: &str,
    buster: &str,
    max_age: Duration,
    now: DateTime<Utc>,
  ) -> Result<Self, Rejection> {
    let snapshot: PersistedSnapshot =
      serde_json::from_str(raw).map_err(|e| Rejection::Corrupt(e.to_string()))?;

    if snapshot.buster != buster {
      return Err(Rejection::BusterMismatch {
        found: snapshot.buster,
        expected: buster.to_string(),
      });
    }

    let age = now - snapshot.timestamp;
    if age > max_age {
      return Err(Rejection::Expired { age });
    }

    Ok(snapshot)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn snapshot(buster: &str, timestamp: DateTime<Utc>) -> String {
    serde_json::to_string(&PersistedSnapshot {
      buster: buster.to_string(),
      timestamp,
      entries: vec![PersistedEntry {
        key: crate::query_key!["museums"],
        value: json!([]),
        inserted_at: timestamp,
        updated_at: timestamp,
      }],
    })
    .unwrap()
  }

  #[test]
  fn test_rejections() {
    let now = Utc::now();
    let max_age = Duration::hours(24);

    assert!(PersistedSnapshot::decode(&snapshot("v1", now), "v1", max_age, now).is_ok());
    assert!(matches!(
      PersistedSnapshot::decode(&snapshot("v0", now), "v1", max_age, now),
      Err(Rejection::BusterMismatch { .. })
    ));
    assert!(matches!(
      PersistedSnapshot::decode(&snapshot("v1", now - Duration::hours(25)), "v1", max_age, now),
      Err(Rejection::Expired { .. })
    ));
    assert!(matches!(
      PersistedSnapshot::decode("{\"buster\":", "v1", max_age, now),
      Err(Rejection::Corrupt(_))
    ));
  }
}

//! Storage engine trait and the no-op engine.

use chrono::{DateTime, Utc};
use color_eyre::Result;

/// Trait for durable key-value storage engines.
///
/// Engines are synchronous and may fail; [`super::DurableStore`] runs them off
/// the async executor and contains every failure.
pub trait StorageEngine: Send + Sync {
  /// Short engine name for logs (e.g. "sqlite").
  fn name(&self) -> &'static str;

  /// Get the value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, recording `written_at` in the age index.
  fn set(&self, key: &str, value: &str, written_at: DateTime<Utc>) -> Result<()>;

  /// Remove `key` if present.
  fn remove(&self, key: &str) -> Result<()>;

  /// Remove every key.
  fn clear(&self) -> Result<()>;

  /// All stored keys, sorted.
  fn keys(&self) -> Result<Vec<String>>;

  /// Number of stored keys.
  fn len(&self) -> Result<usize>;

  /// Approximate bytes used by keys and values.
  fn usage_bytes(&self) -> Result<u64>;

  /// Delete entries written strictly before `cutoff`. Returns how many were removed.
  fn remove_written_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Engine that doesn't store anything.
/// Used when persistence is disabled or no engine could be opened.
pub struct NoopEngine;

impl StorageEngine for NoopEngine {
  fn name(&self) -> &'static str {
    "noop"
  }

  fn get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str, _written_at: DateTime<Utc>) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn len(&self) -> Result<usize> {
    Ok(0)
  }

  fn usage_bytes(&self) -> Result<u64> {
    Ok(0)
  }

  fn remove_written_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }
}

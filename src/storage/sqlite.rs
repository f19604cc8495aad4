//! SQLite storage engine, the primary durable store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::StorageEngine;

/// Schema for the key-value table and its write-time index.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_kv_store_written_at ON kv_store(written_at);
"#;

/// SQLite-based storage engine.
pub struct SqliteEngine {
  conn: Mutex<Connection>,
}

impl SqliteEngine {
  /// Open (or create) the database file at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    let engine = Self {
      conn: Mutex::new(conn),
    };
    engine.run_migrations()?;

    Ok(engine)
  }

  /// Run database migrations for the store table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl StorageEngine for SqliteEngine {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str, written_at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at) VALUES (?, ?, ?)",
        params![key, value, written_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove key {}: {}", key, e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM kv_store", [])
      .map_err(|e| eyre!("Failed to clear store: {}", e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn len(&self) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count keys: {}", e))?;

    Ok(count as usize)
  }

  fn usage_bytes(&self) -> Result<u64> {
    let conn = self.lock()?;

    let bytes: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM kv_store",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to measure storage usage: {}", e))?;

    Ok(bytes as u64)
  }

  fn remove_written_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM kv_store WHERE written_at < ?",
        params![cutoff.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to remove old entries: {}", e))?;

    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn open_temp() -> (tempfile::TempDir, SqliteEngine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = SqliteEngine::open(&dir.path().join("nested").join("store.db")).unwrap();
    (dir, engine)
  }

  #[test]
  fn test_set_get_replace() {
    let (_dir, engine) = open_temp();
    let now = Utc::now();

    engine.set("a", "one", now).unwrap();
    engine.set("a", "two", now).unwrap();

    assert_eq!(engine.get("a").unwrap().as_deref(), Some("two"));
    assert_eq!(engine.len().unwrap(), 1);
    assert_eq!(engine.get("missing").unwrap(), None);
  }

  #[test]
  fn test_remove_written_before_uses_write_time() {
    let (_dir, engine) = open_temp();
    let now = Utc::now();

    engine.set("old", "x", now - Duration::hours(30)).unwrap();
    engine.set("new", "y", now - Duration::hours(1)).unwrap();

    let removed = engine
      .remove_written_before(now - Duration::hours(24))
      .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(engine.keys().unwrap(), vec!["new".to_string()]);
  }

  #[test]
  fn test_usage_counts_bytes() {
    let (_dir, engine) = open_temp();
    engine.set("k", "héllo", Utc::now()).unwrap();

    // 1 byte key + 6 byte value ("é" is two bytes)
    assert_eq!(engine.usage_bytes().unwrap(), 7);

    engine.clear().unwrap();
    assert_eq!(engine.usage_bytes().unwrap(), 0);
  }
}

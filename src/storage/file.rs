//! Single-file JSON storage engine.
//!
//! Used when SQLite can't be opened. The whole map lives in memory and is
//! rewritten to disk on every change (write to a temp file, then rename).

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::StorageEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
  value: String,
  /// Write time in milliseconds since the epoch
  written_at: i64,
}

/// JSON-file storage engine.
pub struct JsonFileEngine {
  path: PathBuf,
  records: Mutex<BTreeMap<String, FileRecord>>,
}

impl JsonFileEngine {
  /// Open the store at `path`, loading any existing contents.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let records = if path.exists() {
      let contents = std::fs::read_to_string(path)
        .map_err(|e| eyre!("Failed to read store file {}: {}", path.display(), e))?;
      if contents.trim().is_empty() {
        BTreeMap::new()
      } else {
        serde_json::from_str(&contents)
          .map_err(|e| eyre!("Failed to parse store file {}: {}", path.display(), e))?
      }
    } else {
      BTreeMap::new()
    };

    Ok(Self {
      path: path.to_path_buf(),
      records: Mutex::new(records),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, FileRecord>>> {
    self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn flush(&self, records: &BTreeMap<String, FileRecord>) -> Result<()> {
    let data =
      serde_json::to_vec(records).map_err(|e| eyre!("Failed to serialize store: {}", e))?;

    let tmp = self.path.with_extension("tmp");
    std::fs::write(&tmp, data)
      .map_err(|e| eyre!("Failed to write store file {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to replace store file {}: {}", self.path.display(), e))?;

    Ok(())
  }
}

impl StorageEngine for JsonFileEngine {
  fn name(&self) -> &'static str {
    "json-file"
  }

  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(key).map(|r| r.value.clone()))
  }

  fn set(&self, key: &str, value: &str, written_at: DateTime<Utc>) -> Result<()> {
    let mut records = self.lock()?;
    records.insert(
      key.to_string(),
      FileRecord {
        value: value.to_string(),
        written_at: written_at.timestamp_millis(),
      },
    );
    self.flush(&records)
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut records = self.lock()?;
    if records.remove(key).is_some() {
      self.flush(&records)?;
    }
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let mut records = self.lock()?;
    records.clear();
    self.flush(&records)
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }

  fn usage_bytes(&self) -> Result<u64> {
    let records = self.lock()?;
    Ok(
      records
        .iter()
        .map(|(k, r)| (k.len() + r.value.len()) as u64)
        .sum(),
    )
  }

  fn remove_written_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let mut records = self.lock()?;
    let cutoff = cutoff.timestamp_millis();
    let before = records.len();
    records.retain(|_, r| r.written_at >= cutoff);
    let removed = before - records.len();
    if removed > 0 {
      self.flush(&records)?;
    }
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_contents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    {
      let engine = JsonFileEngine::open(&path).unwrap();
      engine.set("museums", "[1,2]", Utc::now()).unwrap();
      engine.set("events", "[]", Utc::now()).unwrap();
      engine.remove("events").unwrap();
    }

    let engine = JsonFileEngine::open(&path).unwrap();
    assert_eq!(engine.get("museums").unwrap().as_deref(), Some("[1,2]"));
    assert_eq!(engine.keys().unwrap(), vec!["museums".to_string()]);
  }

  #[test]
  fn test_corrupt_file_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    std::fs::write(&path, "{not json").unwrap();

    assert!(JsonFileEngine::open(&path).is_err());
  }

  #[test]
  fn test_remove_written_before() {
    let dir = tempfile::tempdir().unwrap();
    let engine = JsonFileEngine::open(&dir.path().join("store.json")).unwrap();
    let now = Utc::now();

    engine.set("a", "1", now - Duration::hours(2)).unwrap();
    engine.set("b", "22", now).unwrap();

    assert_eq!(engine.remove_written_before(now - Duration::hours(1)).unwrap(), 1);
    assert_eq!(engine.len().unwrap(), 1);
    assert_eq!(engine.usage_bytes().unwrap(), 3);
  }
}

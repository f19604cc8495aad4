//! Async, failure-containing front for the storage engines.

use chrono::Duration;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::file::JsonFileEngine;
use super::sqlite::SqliteEngine;
use super::traits::{NoopEngine, StorageEngine};
use crate::clock::{Clock, SystemClock};

/// Where the durable store keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
  /// Directory holding `store.db` (or `store.json` for the fallback engine)
  Directory(PathBuf),
  /// No persistent location; every operation is a no-op
  Unavailable,
}

impl StoreLocation {
  /// Default location: `$XDG_DATA_HOME/<app>/`.
  pub fn default_for(app_name: &str) -> Self {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| Self::Directory(dir.join(app_name)))
      .unwrap_or(Self::Unavailable)
  }
}

/// Durable key-value store.
///
/// Every operation is best effort: engine failures are logged and turned into
/// a safe default (`None`, `0`, empty list, no-op). Nothing here returns an
/// error to the caller.
#[derive(Clone)]
pub struct DurableStore {
  inner: Arc<Inner>,
}

struct Inner {
  location: StoreLocation,
  engine: OnceCell<Arc<dyn StorageEngine>>,
  clock: Arc<dyn Clock>,
}

impl DurableStore {
  /// Create a store that opens its engine at `location` on first use.
  pub fn new(location: StoreLocation, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Arc::new(Inner {
        location,
        engine: OnceCell::new(),
        clock,
      }),
    }
  }

  /// Create a store around an already opened engine.
  pub fn with_engine(engine: Arc<dyn StorageEngine>, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Arc::new(Inner {
        location: StoreLocation::Unavailable,
        engine: OnceCell::new_with(Some(engine)),
        clock,
      }),
    }
  }

  /// Store under the default data directory for `app_name`.
  pub fn open_default(app_name: &str) -> Self {
    Self::new(StoreLocation::default_for(app_name), Arc::new(SystemClock))
  }

  /// A store that never persists anything.
  pub fn disabled() -> Self {
    Self::with_engine(Arc::new(NoopEngine), Arc::new(SystemClock))
  }

  /// Open the underlying engine. Safe to call any number of times.
  pub async fn init(&self) {
    let engine = self.engine().await;
    debug!(engine = engine.name(), "durable store ready");
  }

  /// Name of the engine in use (opens it if necessary).
  pub async fn engine_name(&self) -> &'static str {
    self.engine().await.name()
  }

  pub async fn get_item(&self, key: &str) -> Option<String> {
    let key = key.to_string();
    self.run("get_item", move |e| e.get(&key)).await
  }

  pub async fn set_item(&self, key: &str, value: &str) {
    let key = key.to_string();
    let value = value.to_string();
    let now = self.inner.clock.now();
    self.run("set_item", move |e| e.set(&key, &value, now)).await
  }

  pub async fn remove_item(&self, key: &str) {
    let key = key.to_string();
    self.run("remove_item", move |e| e.remove(&key)).await
  }

  pub async fn clear(&self) {
    self.run("clear", |e| e.clear()).await
  }

  pub async fn get_all_keys(&self) -> Vec<String> {
    self.run("get_all_keys", |e| e.keys()).await
  }

  /// Number of stored entries.
  pub async fn size(&self) -> usize {
    self.run("size", |e| e.len()).await
  }

  pub async fn get_storage_usage_bytes(&self) -> u64 {
    self.run("get_storage_usage_bytes", |e| e.usage_bytes()).await
  }

  /// Delete entries written more than `max_age` ago. Returns how many were removed.
  pub async fn cleanup(&self, max_age: Duration) -> usize {
    if max_age < Duration::zero() {
      warn!(?max_age, "negative cleanup age, nothing removed");
      return 0;
    }
    let Some(cutoff) = self.inner.clock.now().checked_sub_signed(max_age) else {
      return 0;
    };
    let removed = self
      .run("cleanup", move |e| e.remove_written_before(cutoff))
      .await;
    if removed > 0 {
      info!(removed, "removed expired entries from durable store");
    }
    removed
  }

  async fn engine(&self) -> Arc<dyn StorageEngine> {
    let location = self.inner.location.clone();
    self
      .inner
      .engine
      .get_or_init(|| async move {
        tokio::task::spawn_blocking(move || open_engine(&location))
          .await
          .unwrap_or_else(|e| {
            warn!(error = %e, "storage engine initialisation panicked");
            Arc::new(NoopEngine) as Arc<dyn StorageEngine>
          })
      })
      .await
      .clone()
  }

  async fn run<T, F>(&self, op: &'static str, f: F) -> T
  where
    T: Default + Send + 'static,
    F: FnOnce(&dyn StorageEngine) -> Result<T> + Send + 'static,
  {
    let engine = self.engine().await;
    match tokio::task::spawn_blocking(move || f(engine.as_ref())).await {
      Ok(Ok(value)) => value,
      Ok(Err(e)) => {
        warn!(op, error = %e, "storage operation failed");
        T::default()
      }
      Err(e) => {
        warn!(op, error = %e, "storage task failed");
        T::default()
      }
    }
  }
}

/// Open SQLite, falling back to the JSON file engine, then to no storage at all.
fn open_engine(location: &StoreLocation) -> Arc<dyn StorageEngine> {
  let dir = match location {
    StoreLocation::Directory(dir) => dir,
    StoreLocation::Unavailable => {
      debug!("no storage location available, persistence disabled");
      return Arc::new(NoopEngine);
    }
  };

  match SqliteEngine::open(&dir.join("store.db")) {
    Ok(engine) => return Arc::new(engine),
    Err(e) => warn!(error = %e, "SQLite storage unavailable, falling back to JSON file store"),
  }

  match JsonFileEngine::open(&dir.join("store.json")) {
    Ok(engine) => Arc::new(engine),
    Err(e) => {
      warn!(error = %e, "JSON file store unavailable, persistence disabled");
      Arc::new(NoopEngine)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use chrono::{DateTime, Utc};
  use color_eyre::eyre::eyre;

  struct BrokenEngine;

  impl StorageEngine for BrokenEngine {
    fn name(&self) -> &'static str {
      "broken"
    }
    fn get(&self, _key: &str) -> Result<Option<String>> {
      Err(eyre!("disk on fire"))
    }
    fn set(&self, _key: &str, _value: &str, _written_at: DateTime<Utc>) -> Result<()> {
      Err(eyre!("disk on fire"))
    }
    fn remove(&self, _key: &str) -> Result<()> {
      Err(eyre!("disk on fire"))
    }
    fn clear(&self) -> Result<()> {
      Err(eyre!("disk on fire"))
    }
    fn keys(&self) -> Result<Vec<String>> {
      Err(eyre!("disk on fire"))
    }
    fn len(&self) -> Result<usize> {
      Err(eyre!("disk on fire"))
    }
    fn usage_bytes(&self) -> Result<u64> {
      Err(eyre!("disk on fire"))
    }
    fn remove_written_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
      Err(eyre!("disk on fire"))
    }
  }

  #[tokio::test]
  async fn test_engine_errors_become_defaults() {
    let store = DurableStore::with_engine(Arc::new(BrokenEngine), Arc::new(SystemClock));

    store.set_item("k", "v").await;
    assert_eq!(store.get_item("k").await, None);
    assert!(store.get_all_keys().await.is_empty());
    assert_eq!(store.size().await, 0);
    assert_eq!(store.get_storage_usage_bytes().await, 0);
    assert_eq!(store.cleanup(Duration::hours(1)).await, 0);
    store.remove_item("k").await;
    store.clear().await;
  }

  #[tokio::test]
  async fn test_falls_back_to_json_file() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the database file should be makes SQLite fail
    std::fs::create_dir_all(dir.path().join("store.db")).unwrap();

    let store = DurableStore::new(
      StoreLocation::Directory(dir.path().to_path_buf()),
      Arc::new(SystemClock),
    );
    store.init().await;
    store.init().await;

    assert_eq!(store.engine_name().await, "json-file");
    store.set_item("a", "1").await;
    assert_eq!(store.get_item("a").await.as_deref(), Some("1"));
  }

  #[tokio::test]
  async fn test_unavailable_location_is_noop() {
    let store = DurableStore::new(StoreLocation::Unavailable, Arc::new(SystemClock));
    store.init().await;

    store.set_item("a", "1").await;
    assert_eq!(store.get_item("a").await, None);
    assert_eq!(store.engine_name().await, "noop");
  }

  #[tokio::test]
  async fn test_cleanup_measures_age_with_clock() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let store = DurableStore::new(
      StoreLocation::Directory(dir.path().to_path_buf()),
      Arc::new(clock.clone()),
    );

    store.set_item("old", "x").await;
    clock.advance(Duration::hours(20));
    store.set_item("new", "y").await;
    clock.advance(Duration::hours(5));

    assert_eq!(store.cleanup(Duration::hours(24)).await, 1);
    assert_eq!(store.get_all_keys().await, vec!["new".to_string()]);
    assert_eq!(store.size().await, 1);
  }

  #[tokio::test]
  async fn test_cleanup_out_of_range_ages_remove_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = DurableStore::new(
      StoreLocation::Directory(dir.path().to_path_buf()),
      Arc::new(SystemClock),
    );
    store.set_item("a", "1").await;

    assert_eq!(store.cleanup(Duration::hours(-1)).await, 0);
    assert_eq!(store.cleanup(Duration::MAX).await, 0);
    assert_eq!(store.cleanup(crate::config::span_hours(u64::MAX)).await, 0);
    assert_eq!(store.size().await, 1);
  }
}

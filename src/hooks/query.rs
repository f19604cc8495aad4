//! Cache-backed query for event-loop callers.
//!
//! A `Query<T>` binds a [`QueryKey`] and a fetcher to the shared
//! [`CacheManager`]. It registers as an observer of its key while alive, so
//! invalidations and reconnects refetch it, and exposes a polled state machine
//! for UIs that drive everything from a tick handler.
//!
//! # Example
//!
//! ```ignore
//! let api = ctx.api.clone();
//! let mut query = Query::new(&ctx.cache, query_key!["museums", "detail", id], move || {
//!     let api = api.clone();
//!     let path = format!("/museums/{}", id);
//!     async move { api.get::<Museum>(&path).await }
//! });
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(museum) => render_museum(museum),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::mpsc;

use crate::cache::{
  query_fn, CacheManager, CacheResult, CacheSource, EntryState, ObserverGuard, QueryData,
  QueryFn, QueryKey,
};
use crate::transport::ApiError;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(ApiError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Per-query behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// Disabled queries never fetch
  pub enabled: bool,
  /// Keep showing the previous key's data while a new key loads
  pub keep_previous_data: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      enabled: true,
      keep_previous_data: false,
    }
  }
}

type Outcome<T> = Result<CacheResult<T>, ApiError>;

/// Async query bound to the shared cache.
pub struct Query<T> {
  manager: CacheManager,
  key: QueryKey,
  fetcher: QueryFn,
  options: QueryOptions,
  state: QueryState<T>,
  /// Data from the previous key, shown while the current one loads
  placeholder: Option<T>,
  receiver: Option<mpsc::UnboundedReceiver<Outcome<T>>>,
  source: Option<CacheSource>,
  /// Cache write time of the data in `state`
  seen_at: Option<DateTime<Utc>>,
  _observer: ObserverGuard,
}

impl<T: QueryData> Query<T> {
  /// Create a query for `key`.
  ///
  /// Data already in the cache (e.g. from hydration) is available immediately;
  /// nothing is fetched until [`Self::fetch`] is called.
  pub fn new<F, Fut>(manager: &CacheManager, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let fetcher = query_fn(fetcher);
    let observer = manager.observe(&key, Some(fetcher.clone()));

    let mut query = Self {
      manager: manager.clone(),
      key,
      fetcher,
      options: QueryOptions::default(),
      state: QueryState::Idle,
      placeholder: None,
      receiver: None,
      source: None,
      seen_at: None,
      _observer: observer,
    };
    query.sync_from_cache();
    query
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.options.enabled = enabled;
    self
  }

  pub fn keep_previous_data(mut self, keep: bool) -> Self {
    self.options.keep_previous_data = keep;
    self
  }

  /// Enable or disable fetching. Disabling drops any pending result.
  pub fn set_enabled(&mut self, enabled: bool) {
    self.options.enabled = enabled;
    if !enabled && self.receiver.take().is_some() {
      self.state = QueryState::Idle;
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.options.enabled
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Current data, or the previous key's data while loading when
  /// `keep_previous_data` is set.
  pub fn data(&self) -> Option<&T> {
    self.state.data().or(self.placeholder.as_ref())
  }

  pub fn is_placeholder_data(&self) -> bool {
    self.state.data().is_none() && self.placeholder.is_some()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.state.error()
  }

  /// Where the current data came from.
  pub fn source(&self) -> Option<CacheSource> {
    self.source
  }

  pub fn is_stale(&self) -> bool {
    self
      .manager
      .get_query_info(&self.key)
      .is_some_and(|info| info.state == EntryState::Stale)
  }

  /// Start fetching through the cache if not already loading.
  ///
  /// Fresh cached data resolves without a request; stale data resolves
  /// immediately and is refreshed in the background.
  pub fn fetch(&mut self) {
    if !self.options.enabled || self.state.is_loading() {
      return;
    }
    self.start_fetch(false);
  }

  /// Force a new request, superseding any pending one.
  pub fn refetch(&mut self) {
    if !self.options.enabled {
      return;
    }
    self.receiver = None;
    self.start_fetch(true);
  }

  /// Move to another key, e.g. the next page. Fetches the new key if enabled.
  pub fn switch<F, Fut>(&mut self, key: QueryKey, fetcher: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    if key == self.key {
      return;
    }

    if self.options.keep_previous_data {
      if let QueryState::Success(data) = std::mem::replace(&mut self.state, QueryState::Idle) {
        self.placeholder = Some(data);
      }
    } else {
      self.placeholder = None;
    }

    self.fetcher = query_fn(fetcher);
    self._observer = self.manager.observe(&key, Some(self.fetcher.clone()));
    self.key = key;
    self.receiver = None;
    self.state = QueryState::Idle;
    self.source = None;
    self.seen_at = None;

    self.sync_from_cache();
    self.fetch();
  }

  /// Poll for results from a pending fetch, or for newer data written to the
  /// cache by someone else (background refetch, invalidation, optimistic update).
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return self.sync_from_cache();
    };

    match receiver.try_recv() {
      Ok(outcome) => {
        self.receiver = None;
        self.apply(outcome);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.receiver = None;
        self.state = QueryState::Error(ApiError::cancelled(&self.key.to_string()));
        true
      }
    }
  }

  /// Fetch through the cache and wait for the result.
  pub async fn fetch_now(&mut self) -> Result<T, ApiError> {
    if !self.options.enabled {
      return Err(ApiError::invalid_request(
        &self.key.to_string(),
        "Query is disabled",
      ));
    }

    self.receiver = None;
    let outcome = self
      .manager
      .fetch_typed(&self.key, Some(self.fetcher.clone()))
      .await;
    self.apply(outcome.clone());
    outcome.map(|result| result.data)
  }

  fn start_fetch(&mut self, force: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);

    let previous = std::mem::replace(&mut self.state, QueryState::Loading);
    if let QueryState::Success(data) = previous {
      if self.options.keep_previous_data {
        self.placeholder = Some(data);
      }
    }

    let manager = self.manager.clone();
    let key = self.key.clone();
    let fetcher = self.fetcher.clone();
    tokio::spawn(async move {
      let outcome = if force {
        match manager.refetch(&key).await {
          Ok(value) => CacheResult::from_network(value).try_map(|v| {
            serde_json::from_value(v).map_err(|e| ApiError::decode(&key.to_string(), &e))
          }),
          Err(e) => Err(e),
        }
      } else {
        manager.fetch_typed(&key, Some(fetcher)).await
      };
      // Ignore send errors - the query may have moved on
      let _ = tx.send(outcome);
    });
  }

  fn apply(&mut self, outcome: Outcome<T>) {
    match outcome {
      Ok(result) => {
        self.state = QueryState::Success(result.data);
        self.source = Some(result.source);
        self.placeholder = None;
        self.seen_at = self.cache_updated_at();
      }
      Err(e) => self.state = QueryState::Error(e),
    }
  }

  fn cache_updated_at(&self) -> Option<DateTime<Utc>> {
    self
      .manager
      .get_query_info(&self.key)
      .and_then(|info| info.updated_at)
  }

  /// Take cache data newer than what this query last saw.
  fn sync_from_cache(&mut self) -> bool {
    let updated_at = self.cache_updated_at();
    if updated_at.is_none() || updated_at <= self.seen_at {
      return false;
    }

    let Some(data) = self.manager.get_query_data::<T>(&self.key) else {
      return false;
    };
    self.state = QueryState::Success(data);
    self.source = Some(if self.is_stale() {
      CacheSource::CacheStale
    } else {
      CacheSource::CacheFresh
    });
    self.placeholder = None;
    self.seen_at = updated_at;
    true
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("options", &self.options)
      .field("source", &self.source)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheManager;
  use crate::config::CacheConfig;
  use crate::query_key;
  use crate::storage::DurableStore;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  fn manager() -> CacheManager {
    CacheManager::new(
      CacheConfig {
        persist: false,
        ..Default::default()
      },
      DurableStore::disabled(),
    )
  }

  #[tokio::test]
  async fn test_query_success() {
    let m = manager();
    let mut query = Query::new(&m, query_key!["numbers"], || async {
      Ok::<_, ApiError>(vec![1, 2, 3])
    });

    assert!(matches!(query.state(), QueryState::Idle));

    query.fetch();
    assert!(query.is_loading());

    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_success());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
    assert_eq!(query.source(), Some(CacheSource::Network));
  }

  #[tokio::test]
  async fn test_query_error() {
    let m = manager();
    let mut query: Query<i32> = Query::new(&m, query_key!["broken"], || async {
      Err(ApiError::from_status(500, "/broken", &serde_json::Value::Null))
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_error());
    assert_eq!(query.error().map(|e| e.code.as_str()), Some("HTTP_500"));
  }

  #[tokio::test]
  async fn test_disabled_query_does_not_fetch() {
    let m = manager();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut query = Query::new(&m, query_key!["museums"], move || {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Ok::<_, ApiError>(42) }
    })
    .enabled(false);

    query.fetch();
    assert!(matches!(query.state(), QueryState::Idle));
    assert!(query.fetch_now().await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    query.set_enabled(true);
    assert_eq!(query.fetch_now().await.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_starts_from_cached_data() {
    let m = manager();
    m.set_query_data(&query_key!["museums"], &vec!["Louvre"]);

    let query: Query<Vec<String>> = Query::new(&m, query_key!["museums"], || async {
      Ok(Vec::<String>::new())
    });

    assert_eq!(query.data(), Some(&vec!["Louvre".to_string()]));
    assert_eq!(query.source(), Some(CacheSource::CacheFresh));
  }

  #[tokio::test]
  async fn test_keep_previous_data_while_switching() {
    let m = manager();
    let page = |n: u32| {
      move || async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok::<_, ApiError>(vec![n * 10, n * 10 + 1])
      }
    };

    let mut query = Query::new(&m, query_key!["museums", serde_json::json!({ "page": 1 })], page(1))
      .keep_previous_data(true);
    assert_eq!(query.fetch_now().await.unwrap(), vec![10, 11]);

    query.switch(query_key!["museums", serde_json::json!({ "page": 2 })], page(2));
    assert!(query.is_loading());
    assert!(query.is_placeholder_data());
    assert_eq!(query.data(), Some(&vec![10, 11]));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(query.poll());
    assert!(!query.is_placeholder_data());
    assert_eq!(query.data(), Some(&vec![20, 21]));
  }

  #[tokio::test]
  async fn test_switch_without_placeholder() {
    let m = manager();
    let mut query = Query::new(&m, query_key!["a"], || async { Ok::<_, ApiError>(1) });
    query.fetch_now().await.unwrap();

    query.switch(query_key!["b"], || async {
      tokio::time::sleep(Duration::from_millis(30)).await;
      Ok::<_, ApiError>(2)
    });
    assert!(query.data().is_none());
  }

  #[tokio::test]
  async fn test_poll_picks_up_cache_writes() {
    let m = manager();
    let key = query_key!["museums", "detail", "abc123"];
    let mut query = Query::new(&m, key.clone(), || async {
      Ok::<_, ApiError>("Louvre".to_string())
    });
    query.fetch_now().await.unwrap();
    assert!(!query.poll());

    tokio::time::sleep(Duration::from_millis(5)).await;
    m.set_query_data(&key, "Musée du Louvre");
    assert!(query.poll());
    assert_eq!(query.data().map(String::as_str), Some("Musée du Louvre"));
  }

  #[tokio::test]
  async fn test_refetch_cancels_pending() {
    let m = manager();
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let mut query = Query::new(&m, query_key!["counter"], move || {
      let n = counter_clone.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, ApiError>(n)
      }
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Refetch should supersede the first and start a new one
    query.refetch();
    tokio::time::sleep(Duration::from_millis(100)).await;

    query.poll();
    assert_eq!(query.data(), Some(&1));
    assert_eq!(m.get_query_data::<u32>(&query_key!["counter"]), Some(1));
  }

  #[tokio::test]
  async fn test_observes_key_while_alive() {
    let m = manager();
    let key = query_key!["museums"];
    let query = Query::new(&m, key.clone(), || async { Ok::<_, ApiError>(1) });
    assert_eq!(m.get_query_info(&key).unwrap().observers, 1);

    drop(query);
    assert_eq!(m.get_query_info(&key).unwrap().observers, 0);
  }
}

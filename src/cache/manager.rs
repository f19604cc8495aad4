//! Cache manager: the in-memory query cache plus persistence, connectivity
//! handling and the background loops that keep it fresh.

use chrono::{DateTime, Duration, Utc};
use futures::future::{join_all, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::connectivity::{ConnectivityObserver, ManualConnectivity, Subscription};
use super::entry::{CacheEntry, EntryState, SharedFetch};
use super::key::QueryKey;
use super::mutation::{MutationQueue, PendingMutation, Replay, ReplayFn};
use super::snapshot::{PersistedEntry, PersistedSnapshot, Rejection};
use super::status::SyncStatus;
use super::throttle::Throttle;
use super::traits::{query_fn, CacheResult, QueryData, QueryFn};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, MAX_SPAN_SECS};
use crate::storage::DurableStore;
use crate::transport::ApiError;

/// What happened when the persisted cache was loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrateOutcome {
  /// Persistence is turned off
  Disabled,
  /// Nothing was stored
  Missing,
  /// A snapshot was found but not used
  Discarded(Rejection),
  /// Number of entries restored
  Restored(usize),
}

/// Result of a storage cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
  pub removed: usize,
  /// Usage measured after the regular pass
  pub usage_bytes: u64,
  /// Whether usage crossed the quota warning threshold and a second pass ran
  pub aggressive: bool,
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone)]
pub struct QueryInfo {
  pub key: QueryKey,
  pub value: Option<Value>,
  pub updated_at: Option<DateTime<Utc>>,
  pub state: EntryState,
  pub is_fetching: bool,
  pub observers: usize,
  pub last_error: Option<ApiError>,
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder {
  config: CacheConfig,
  persist_key: String,
  store: Option<DurableStore>,
  clock: Arc<dyn Clock>,
  connectivity: Arc<dyn ConnectivityObserver>,
}

impl CacheManagerBuilder {
  pub fn store(mut self, store: DurableStore) -> Self {
    self.store = Some(store);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityObserver>) -> Self {
    self.connectivity = connectivity;
    self
  }

  /// Storage key of the persisted snapshot (`<app>-query-cache`).
  pub fn persist_key(mut self, key: impl Into<String>) -> Self {
    self.persist_key = key.into();
    self
  }

  pub fn build(self) -> CacheManager {
    let priority_keys = self
      .config
      .priority_keys
      .iter()
      .cloned()
      .map(QueryKey::new)
      .collect();
    let throttle = Throttle::new(self.config.persist_throttle());
    let (status, _) = watch::channel(SyncStatus::Idle);

    CacheManager {
      inner: Arc::new(Inner {
        priority_keys,
        persist_key: self.persist_key,
        store: self.store.unwrap_or_else(DurableStore::disabled),
        clock: self.clock,
        connectivity: self.connectivity,
        entries: Mutex::new(HashMap::new()),
        status,
        paused: Mutex::new(MutationQueue::default()),
        sync_lock: tokio::sync::Mutex::new(()),
        replay_lock: tokio::sync::Mutex::new(()),
        persist_lock: tokio::sync::Mutex::new(()),
        next_mutation_id: AtomicU64::new(0),
        active_mutations: AtomicUsize::new(0),
        throttle: Mutex::new(throttle),
        trailing_persist: AtomicBool::new(false),
        tasks: Mutex::new(Vec::new()),
        subscription: Mutex::new(None),
        config: self.config,
      }),
    }
  }
}

/// Owner of the query cache.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct CacheManager {
  inner: Arc<Inner>,
}

struct Inner {
  config: CacheConfig,
  priority_keys: Vec<QueryKey>,
  persist_key: String,
  store: DurableStore,
  clock: Arc<dyn Clock>,
  connectivity: Arc<dyn ConnectivityObserver>,
  /// Entries indexed by [`QueryKey::cache_hash`]
  entries: Mutex<HashMap<String, CacheEntry>>,
  status: watch::Sender<SyncStatus>,
  paused: Mutex<MutationQueue>,
  /// Held for a whole background sync or reconnect pass
  sync_lock: tokio::sync::Mutex<()>,
  /// Held while paused writes are being replayed
  replay_lock: tokio::sync::Mutex<()>,
  persist_lock: tokio::sync::Mutex<()>,
  next_mutation_id: AtomicU64,
  active_mutations: AtomicUsize,
  throttle: Mutex<Throttle>,
  trailing_persist: AtomicBool,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  subscription: Mutex<Option<Subscription>>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
    for task in tasks.drain(..) {
      task.abort();
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CacheManager {
  pub fn builder(config: CacheConfig) -> CacheManagerBuilder {
    CacheManagerBuilder {
      config,
      persist_key: "museo-query-cache".to_string(),
      store: None,
      clock: Arc::new(SystemClock),
      connectivity: Arc::new(ManualConnectivity::new(true)),
    }
  }

  pub fn new(config: CacheConfig, store: DurableStore) -> Self {
    Self::builder(config).store(store).build()
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  pub fn store(&self) -> &DurableStore {
    &self.inner.store
  }

  pub fn persist_key(&self) -> &str {
    &self.inner.persist_key
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  pub fn is_online(&self) -> bool {
    self.inner.connectivity.is_online()
  }

  pub fn sync_status(&self) -> SyncStatus {
    *self.inner.status.borrow()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.inner.status.subscribe()
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    lock(&self.inner.entries)
  }

  fn paused(&self) -> MutexGuard<'_, MutationQueue> {
    lock(&self.inner.paused)
  }

  fn new_entry(&self, key: &QueryKey, now: DateTime<Utc>) -> CacheEntry {
    CacheEntry::new(
      key.clone(),
      now,
      self.inner.config.stale_time(),
      self.inner.config.gc_time(),
    )
  }

  // ==========================================================================
  // Queries
  // ==========================================================================

  /// Read `key` through the cache.
  ///
  /// - Fresh data is returned without calling `fetcher`
  /// - Stale data is returned immediately and refetched in the background
  /// - Missing data is fetched; concurrent callers share one request
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
  ) -> Result<CacheResult<T>, ApiError>
  where
    T: QueryData,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    self.fetch_typed(key, Some(query_fn(fetcher))).await
  }

  /// Typed read with an already erased fetcher. `None` reuses the fetcher
  /// registered for the key.
  pub async fn fetch_typed<T: QueryData>(
    &self,
    key: &QueryKey,
    fetcher: Option<QueryFn>,
  ) -> Result<CacheResult<T>, ApiError> {
    self
      .fetch_value(key, fetcher)
      .await?
      .try_map(|v| decode_value(key, v))
  }

  pub async fn fetch_value(
    &self,
    key: &QueryKey,
    fetcher: Option<QueryFn>,
  ) -> Result<CacheResult<Value>, ApiError> {
    enum Plan {
      Cached(CacheResult<Value>),
      Wait(SharedFetch),
      NoFetcher,
    }

    let now = self.now();
    let online = self.is_online();

    let plan = {
      let mut entries = self.entries();
      let entry = entries
        .entry(key.cache_hash())
        .or_insert_with(|| self.new_entry(key, now));
      if let Some(fetcher) = fetcher {
        entry.fetcher = Some(fetcher);
      }

      match (entry.value.clone(), entry.updated_at) {
        (Some(value), Some(updated_at)) if !entry.is_stale(now) => {
          Plan::Cached(CacheResult::from_cache(value, updated_at, false))
        }
        (Some(value), Some(updated_at)) if !online => {
          entry.refetch_on_reconnect = true;
          Plan::Cached(CacheResult::offline(value, updated_at))
        }
        (Some(value), Some(updated_at)) => {
          // Stale-while-revalidate
          if self.start_fetch(entry).is_some() {
            debug!(key = %key, "serving stale data, refetching in background");
          }
          Plan::Cached(CacheResult::from_cache(value, updated_at, true))
        }
        _ => match self.start_fetch(entry) {
          Some(fetch) => Plan::Wait(fetch),
          None => Plan::NoFetcher,
        },
      }
    };

    match plan {
      Plan::Cached(result) => Ok(result),
      Plan::Wait(fetch) => fetch.await.map(CacheResult::from_network),
      Plan::NoFetcher => Err(no_query_fn(key)),
    }
  }

  /// Fetch `key` again even if a request is already running. The running
  /// request is superseded and its result discarded.
  pub async fn refetch(&self, key: &QueryKey) -> Result<Value, ApiError> {
    let fetch = {
      let mut entries = self.entries();
      entries.get_mut(&key.cache_hash()).and_then(|entry| {
        entry.cancel_fetch();
        self.start_fetch(entry)
      })
    };

    match fetch {
      Some(fetch) => fetch.await,
      None => Err(no_query_fn(key)),
    }
  }

  /// Join the running fetch for `entry` or start one. `None` when the entry
  /// has no fetcher.
  ///
  /// Called with the entries lock held, so the fetcher itself only runs once
  /// the returned future is first polled.
  fn start_fetch(&self, entry: &mut CacheEntry) -> Option<SharedFetch> {
    if let Some((_, fetch)) = &entry.in_flight {
      return Some(fetch.clone());
    }

    let fetcher = entry.fetcher.clone()?;
    entry.generation += 1;
    let generation = entry.generation;
    let hash = entry.key.cache_hash();
    let weak = Arc::downgrade(&self.inner);

    let fetch = async move {
      let result = fetcher().await;
      if let Some(inner) = weak.upgrade() {
        CacheManager { inner }.settle_fetch(&hash, generation, &result);
      }
      result
    }
    .boxed()
    .shared();

    // Drive the request even if every caller goes away
    tokio::spawn(fetch.clone());
    entry.in_flight = Some((generation, fetch.clone()));
    Some(fetch)
  }

  fn settle_fetch(&self, hash: &str, generation: u64, result: &Result<Value, ApiError>) {
    let now = self.now();
    let online = self.is_online();

    {
      let mut entries = self.entries();
      let Some(entry) = entries.get_mut(hash) else {
        debug!("discarding result for removed query");
        return;
      };
      if entry.generation != generation {
        debug!(key = %entry.key, "discarding superseded fetch result");
        return;
      }
      entry.in_flight = None;

      match result {
        Ok(value) => entry.set_value(value.clone(), now),
        Err(err) => {
          debug!(key = %entry.key, error = %err, "query failed");
          entry.last_error = Some(err.clone());
          if err.is_network() && !online {
            entry.refetch_on_reconnect = true;
          }
        }
      }
    }

    match result {
      Ok(_) => self.persist(),
      Err(err) if err.is_network() && !online => {
        self.inner.status.send_replace(SyncStatus::Offline);
      }
      Err(_) => {}
    }
  }

  pub fn get_query_value(&self, key: &QueryKey) -> Option<Value> {
    self
      .entries()
      .get(&key.cache_hash())
      .and_then(|e| e.value.clone())
  }

  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    self
      .get_query_value(key)
      .and_then(|v| serde_json::from_value(v).ok())
  }

  pub fn get_query_info(&self, key: &QueryKey) -> Option<QueryInfo> {
    let now = self.now();
    self.entries().get(&key.cache_hash()).map(|e| QueryInfo {
      key: e.key.clone(),
      value: e.value.clone(),
      updated_at: e.updated_at,
      state: e.state(now),
      is_fetching: e.is_fetching(),
      observers: e.observers,
      last_error: e.last_error.clone(),
    })
  }

  /// Write `value` as the current data for `key`.
  pub fn set_query_value(&self, key: &QueryKey, value: Value) {
    let now = self.now();
    {
      let mut entries = self.entries();
      entries
        .entry(key.cache_hash())
        .or_insert_with(|| self.new_entry(key, now))
        .set_value(value, now);
    }
    self.persist();
  }

  pub fn set_query_data<T: Serialize + ?Sized>(&self, key: &QueryKey, data: &T) {
    match serde_json::to_value(data) {
      Ok(value) => self.set_query_value(key, value),
      Err(e) => warn!(key = %key, error = %e, "failed to serialize query data"),
    }
  }

  /// Put back a value captured earlier. `None` empties the entry but keeps its
  /// observers and fetcher.
  pub fn restore_query_value(&self, key: &QueryKey, previous: Option<Value>) {
    match previous {
      Some(value) => self.set_query_value(key, value),
      None => {
        if let Some(entry) = self.entries().get_mut(&key.cache_hash()) {
          entry.value = None;
          entry.updated_at = None;
        }
        self.persist();
      }
    }
  }

  /// Supersede in-flight fetches under `prefix` so they can't overwrite
  /// data written in the meantime.
  pub fn cancel_queries(&self, prefix: &QueryKey) -> usize {
    let mut cancelled = 0;
    for entry in self.entries().values_mut() {
      if entry.key.starts_with(prefix) && entry.is_fetching() {
        entry.cancel_fetch();
        cancelled += 1;
      }
    }
    cancelled
  }

  /// Remove every entry under `prefix` from memory.
  pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
    let removed = {
      let mut entries = self.entries();
      let before = entries.len();
      entries.retain(|_, e| !e.key.starts_with(prefix));
      before - entries.len()
    };
    if removed > 0 {
      self.persist();
    }
    removed
  }

  /// Mark every entry under `prefix` stale and refetch the observed ones.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let mut invalidated = 0;
    let mut refetching = 0;
    {
      let mut entries = self.entries();
      for entry in entries.values_mut() {
        if !entry.key.starts_with(prefix) {
          continue;
        }
        entry.invalidated = true;
        invalidated += 1;
        if entry.observers > 0 {
          // Supersede anything started before the invalidation
          entry.cancel_fetch();
          if self.start_fetch(entry).is_some() {
            refetching += 1;
          }
        }
      }
    }
    debug!(prefix = %prefix, invalidated, refetching, "invalidated queries");
    invalidated
  }

  /// Register interest in `key`. The entry is kept from garbage collection
  /// until the guard is dropped.
  pub fn observe(&self, key: &QueryKey, fetcher: Option<QueryFn>) -> ObserverGuard {
    let now = self.now();
    let hash = key.cache_hash();
    {
      let mut entries = self.entries();
      let entry = entries
        .entry(hash.clone())
        .or_insert_with(|| self.new_entry(key, now));
      entry.add_observer();
      if let Some(fetcher) = fetcher {
        entry.fetcher = Some(fetcher);
      }
    }
    ObserverGuard {
      manager: self.clone(),
      hash,
    }
  }

  fn unobserve(&self, hash: &str) {
    let now = self.now();
    if let Some(entry) = self.entries().get_mut(hash) {
      entry.remove_observer(now);
    }
  }

  /// Drop entries nobody has observed for their gc time.
  pub fn collect_garbage(&self) -> usize {
    let now = self.now();
    let removed = {
      let mut entries = self.entries();
      let before = entries.len();
      entries.retain(|_, e| !e.is_gc_eligible(now));
      before - entries.len()
    };
    if removed > 0 {
      debug!(removed, "garbage collected queries");
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries().is_empty()
  }

  /// Keys of every entry, sorted by their display form.
  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.entries().values().map(|e| e.key.clone()).collect();
    keys.sort_by_key(|k| k.to_string());
    keys
  }

  /// Empty the cache and forget the persisted snapshot.
  pub async fn clear(&self) {
    self.entries().clear();
    let dropped = self.paused().clear();
    if dropped > 0 {
      warn!(dropped, "dropped paused mutations");
    }
    self.inner.store.remove_item(&self.inner.persist_key).await;
  }

  // ==========================================================================
  // Persistence
  // ==========================================================================

  /// Load the persisted snapshot into memory. Never fails; anything wrong with
  /// the snapshot means starting empty.
  pub async fn hydrate(&self) -> HydrateOutcome {
    if !self.inner.config.persist {
      return HydrateOutcome::Disabled;
    }

    let store = &self.inner.store;
    store.init().await;

    let Some(raw) = store.get_item(&self.inner.persist_key).await else {
      debug!("no persisted query cache");
      return HydrateOutcome::Missing;
    };

    let now = self.now();
    let config = &self.inner.config;
    let snapshot = match PersistedSnapshot::decode(&raw, &config.buster, config.max_age(), now) {
      Ok(snapshot) => snapshot,
      Err(rejection) => {
        info!(?rejection, "discarding persisted query cache");
        store.remove_item(&self.inner.persist_key).await;
        return HydrateOutcome::Discarded(rejection);
      }
    };

    // Build everything first, then apply under one lock
    let restored: Vec<CacheEntry> = snapshot
      .entries
      .into_iter()
      .map(|p| {
        let mut entry = CacheEntry::new(p.key, p.inserted_at, config.stale_time(), config.gc_time());
        entry.set_value(p.value, p.updated_at);
        entry.unobserved_since = Some(now);
        entry
      })
      .collect();
    let offered = restored.len();

    let adopted = {
      let mut entries = self.entries();
      let mut adopted = 0;
      for entry in restored {
        let hash = entry.key.cache_hash();
        match entries.get_mut(&hash) {
          // Data fetched since startup is newer than the snapshot
          Some(existing) if existing.value.is_some() => continue,
          Some(existing) => {
            existing.inserted_at = entry.inserted_at;
            if let (Some(value), Some(updated_at)) = (entry.value, entry.updated_at) {
              existing.set_value(value, updated_at);
            }
          }
          None => {
            entries.insert(hash, entry);
          }
        }
        adopted += 1;
      }
      adopted
    };

    info!(restored = adopted, skipped = offered - adopted, "hydrated query cache");
    HydrateOutcome::Restored(adopted)
  }

  /// Schedule a throttled write of the cache to durable storage.
  ///
  /// Writes at most once per throttle window; calls inside the window
  /// collapse into one trailing write.
  pub fn persist(&self) {
    if !self.inner.config.persist {
      return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return;
    };

    let now = self.now();
    let acquired = lock(&self.inner.throttle).try_acquire(now);

    match acquired {
      Ok(()) => {
        let manager = self.clone();
        handle.spawn(async move { manager.persist_now().await });
      }
      Err(wait) => {
        if self.inner.trailing_persist.swap(true, Ordering::SeqCst) {
          return;
        }
        let manager = self.clone();
        handle.spawn(async move {
          tokio::time::sleep(wait.to_std().unwrap_or_default()).await;
          manager.inner.trailing_persist.store(false, Ordering::SeqCst);
          let now = manager.now();
          lock(&manager.inner.throttle).mark(now);
          manager.persist_now().await;
        });
      }
    }
  }

  /// Write the cache to durable storage immediately.
  pub async fn persist_now(&self) {
    if !self.inner.config.persist {
      return;
    }

    // Serialize writers so an older snapshot never lands after a newer one
    let _guard = self.inner.persist_lock.lock().await;

    let snapshot = self.snapshot();
    let count = snapshot.entries.len();
    match serde_json::to_string(&snapshot) {
      Ok(raw) => {
        self.inner.store.set_item(&self.inner.persist_key, &raw).await;
        debug!(entries = count, bytes = raw.len(), "persisted query cache");
      }
      Err(e) => warn!(error = %e, "failed to serialize query cache"),
    }
  }

  /// Current cache contents in persisted form.
  pub fn snapshot(&self) -> PersistedSnapshot {
    let entries = self
      .entries()
      .values()
      .filter_map(|e| match (&e.value, e.updated_at) {
        (Some(value), Some(updated_at)) => Some(PersistedEntry {
          key: e.key.clone(),
          value: value.clone(),
          inserted_at: e.inserted_at,
          updated_at,
        }),
        _ => None,
      })
      .collect();

    PersistedSnapshot {
      buster: self.inner.config.buster.clone(),
      timestamp: self.now(),
      entries,
    }
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  /// One background sync pass: refetch the priority keys, then mark every
  /// stale entry for refetch on next read.
  ///
  /// Returns `false` without doing anything when offline or when another pass
  /// is running.
  pub async fn background_sync(&self) -> bool {
    if !self.is_online() {
      return false;
    }
    let Ok(_sync) = self.inner.sync_lock.try_lock() else {
      debug!("another sync pass is running, skipping");
      return false;
    };

    let started = self.inner.status.send_if_modified(|status| {
      if status.can_start_sync() {
        *status = SyncStatus::Syncing;
        true
      } else {
        false
      }
    });
    if !started {
      debug!("sync already running or offline, skipping");
      return false;
    }

    let mut failed = false;
    for key in &self.inner.priority_keys {
      let fetch = {
        let mut entries = self.entries();
        entries
          .get_mut(&key.cache_hash())
          .and_then(|entry| self.start_fetch(entry))
      };
      if let Some(fetch) = fetch {
        if let Err(e) = fetch.await {
          warn!(key = %key, error = %e, "priority refetch failed");
          failed = true;
        }
      }
    }

    let now = self.now();
    let marked = {
      let mut entries = self.entries();
      let mut marked = 0;
      for entry in entries.values_mut() {
        if entry.value.is_some() && entry.is_stale(now) && !entry.invalidated {
          entry.invalidated = true;
          marked += 1;
        }
      }
      marked
    };
    debug!(marked, failed, "background sync finished");

    self.finish_sync(failed);
    true
  }

  fn finish_sync(&self, failed: bool) {
    self.inner.status.send_if_modified(|status| {
      if *status == SyncStatus::Syncing {
        *status = if failed {
          SyncStatus::Error
        } else {
          SyncStatus::Idle
        };
        true
      } else {
        false
      }
    });
  }

  /// React to a connectivity transition.
  ///
  /// Going online replays paused writes in submission order, then refetches
  /// observed queries and those that failed while offline.
  pub async fn handle_network_status_change(&self, is_online: bool) {
    if !is_online {
      info!("network offline, pausing writes");
      self.inner.status.send_replace(SyncStatus::Offline);
      return;
    }

    info!("network online, resuming");
    // Wait out a running background pass, then own the status until done
    let _sync = self.inner.sync_lock.lock().await;
    self.inner.status.send_replace(SyncStatus::Syncing);

    let replay = self.inner.replay_lock.lock().await;
    let drained = self.replay_paused().await;
    drop(replay);
    if !drained {
      self.inner.status.send_replace(SyncStatus::Offline);
      return;
    }

    let fetches: Vec<SharedFetch> = {
      let mut entries = self.entries();
      entries
        .values_mut()
        .filter(|e| e.observers > 0 || e.refetch_on_reconnect)
        .filter_map(|e| self.start_fetch(e))
        .collect()
    };
    let refetched = fetches.len();
    let failed = join_all(fetches).await.iter().any(Result::is_err);
    debug!(refetched, failed, "reconnect refetch finished");

    self.finish_sync(failed);
  }

  /// Run paused writes in order. Returns `false` if the network dropped again.
  async fn replay_paused(&self) -> bool {
    loop {
      let next = self.paused().pop_front();
      let Some(mut mutation) = next else {
        return true;
      };

      debug!(id = mutation.id, key = ?mutation.mutation_key, "replaying paused mutation");
      if (mutation.run)().await == Replay::Paused {
        self.paused().push_front(mutation);
        return false;
      }
    }
  }

  /// Delete old durable entries; if usage is still above the quota warning
  /// threshold, run a second pass at half the age.
  pub async fn perform_cleanup(&self, max_age: Duration) -> CleanupReport {
    let store = &self.inner.store;
    let mut removed = store.cleanup(max_age).await;
    let usage_bytes = store.get_storage_usage_bytes().await;

    let config = &self.inner.config;
    let threshold = config.storage_quota_bytes as f64 * config.quota_warning_ratio;
    let aggressive = usage_bytes as f64 > threshold;

    if aggressive {
      warn!(
        usage_bytes,
        quota = config.storage_quota_bytes,
        "storage usage above warning threshold, cleaning up aggressively"
      );
      removed += store.cleanup(max_age / 2).await;
    }

    CleanupReport {
      removed,
      usage_bytes,
      aggressive,
    }
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Run a write. While offline (or if the network drops mid-request) the
  /// write is paused and replayed on reconnect; the returned future settles
  /// only once it has really run.
  pub async fn run_mutation<T, F, Fut>(
    &self,
    mutation_key: Option<QueryKey>,
    mutate: F,
  ) -> Result<T, ApiError>
  where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let _active = ActiveMutation::new(&self.inner.active_mutations);
    let label = mutation_key
      .as_ref()
      .map(ToString::to_string)
      .unwrap_or_else(|| "mutation".to_string());

    let (tx, rx) = oneshot::channel();
    let mut mutation = PendingMutation {
      id: self.inner.next_mutation_id.fetch_add(1, Ordering::SeqCst),
      mutation_key,
      submitted_at: self.now(),
      run: self.replay_fn(mutate, tx),
    };

    // Queue behind earlier paused writes so submission order holds
    let queued_behind =
      self.paused_mutations() > 0 || self.inner.replay_lock.try_lock().is_err();
    let paused = if self.is_online() && !queued_behind {
      (mutation.run)().await == Replay::Paused
    } else {
      true
    };

    if paused {
      debug!(id = mutation.id, key = %label, "pausing mutation until online");
      self.paused().push(mutation);
      if self.is_online() {
        let manager = self.clone();
        tokio::spawn(async move {
          let _replay = manager.inner.replay_lock.lock().await;
          manager.replay_paused().await;
        });
      } else {
        self.inner.status.send_replace(SyncStatus::Offline);
      }
    }

    rx.await.unwrap_or_else(|_| Err(ApiError::cancelled(&label)))
  }

  fn replay_fn<T, F, Fut>(&self, mutate: F, tx: oneshot::Sender<Result<T, ApiError>>) -> ReplayFn
  where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let mutate = Arc::new(mutate);
    let tx = Arc::new(Mutex::new(Some(tx)));
    let connectivity = Arc::clone(&self.inner.connectivity);

    Box::new(move || {
      let mutate = Arc::clone(&mutate);
      let tx = Arc::clone(&tx);
      let connectivity = Arc::clone(&connectivity);
      async move {
        let result = (*mutate)().await;
        if let Err(err) = &result {
          if err.is_network() && !connectivity.is_online() {
            return Replay::Paused;
          }
        }
        let sender = lock(&tx).take();
        if let Some(sender) = sender {
          let _ = sender.send(result);
        }
        Replay::Settled
      }
      .boxed()
    })
  }

  /// Writes that are running or paused.
  pub fn pending_mutations(&self) -> usize {
    self.inner.active_mutations.load(Ordering::SeqCst)
  }

  /// Writes waiting for connectivity.
  pub fn paused_mutations(&self) -> usize {
    self.paused().len()
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Spawn the background sync, storage cleanup and garbage collection loops
  /// and subscribe to connectivity changes. Calling it again is a no-op.
  pub fn start(&self) {
    let mut tasks = lock(&self.inner.tasks);
    if !tasks.is_empty() {
      return;
    }

    let config = &self.inner.config;
    tasks.push(self.spawn_every(config.background_sync_secs, |m| async move {
      m.background_sync().await;
    }));
    tasks.push(self.spawn_every(config.cleanup_interval_secs, |m| async move {
      let max_age = m.config().max_age();
      m.perform_cleanup(max_age).await;
    }));
    tasks.push(self.spawn_every(config.gc_sweep_secs, |m| async move {
      m.collect_garbage();
    }));
    drop(tasks);

    let handle = tokio::runtime::Handle::current();
    let weak = Arc::downgrade(&self.inner);
    let subscription = self.inner.connectivity.subscribe(Arc::new(move |online| {
      if let Some(inner) = weak.upgrade() {
        let manager = CacheManager { inner };
        handle.spawn(async move { manager.handle_network_status_change(online).await });
      }
    }));
    *lock(&self.inner.subscription) = Some(subscription);

    info!(
      sync_secs = config.background_sync_secs,
      cleanup_secs = config.cleanup_interval_secs,
      "cache manager started"
    );
  }

  fn spawn_every<F, Fut>(&self, secs: u64, task: F) -> JoinHandle<()>
  where
    F: Fn(CacheManager) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let period = std::time::Duration::from_secs(secs.clamp(1, MAX_SPAN_SECS));
    let weak = Arc::downgrade(&self.inner);

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        task(CacheManager { inner }).await;
      }
    })
  }

  /// Stop the loops, unsubscribe and write the cache one last time.
  pub async fn shutdown(&self) {
    let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
    for task in tasks {
      task.abort();
    }
    lock(&self.inner.subscription).take();
    self.persist_now().await;
    info!("cache manager stopped");
  }
}

/// Keeps a query observed while alive.
pub struct ObserverGuard {
  manager: CacheManager,
  hash: String,
}

impl Drop for ObserverGuard {
  fn drop(&mut self) {
    self.manager.unobserve(&self.hash);
  }
}

struct ActiveMutation<'a>(&'a AtomicUsize);

impl<'a> ActiveMutation<'a> {
  fn new(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for ActiveMutation<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

fn no_query_fn(key: &QueryKey) -> ApiError {
  ApiError::invalid_request(&key.to_string(), "No query function registered for this key")
}

fn decode_value<T: DeserializeOwned>(key: &QueryKey, value: Value) -> Result<T, ApiError> {
  serde_json::from_value(value).map_err(|e| ApiError::decode(&key.to_string(), &e))
}

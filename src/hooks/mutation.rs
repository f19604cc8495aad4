//! Cache-aware writes.
//!
//! A `Mutation<V, T>` wraps a write function taking variables `V` and
//! producing `T`. On success it invalidates and refetches the queries it was
//! told about. An optimistic mutation writes its expected result into the
//! cache first and rolls it back if the server rejects the write.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheManager, QueryData, QueryKey};
use crate::transport::ApiError;

type MutateFn<V, T> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

type UpdateFn<V> = Arc<dyn Fn(Option<Value>, &V) -> Option<Value> + Send + Sync>;

struct Optimistic<V> {
  key: QueryKey,
  update: UpdateFn<V>,
}

/// Write bound to the shared cache.
pub struct Mutation<V, T> {
  manager: CacheManager,
  mutate_fn: MutateFn<V, T>,
  mutation_key: Option<QueryKey>,
  invalidates: Vec<QueryKey>,
  refetches: Vec<QueryKey>,
  optimistic: Option<Optimistic<V>>,
}

impl<V, T> Mutation<V, T>
where
  V: Clone + Send + Sync + 'static,
  T: Send + 'static,
{
  pub fn new<F, Fut>(manager: &CacheManager, mutate_fn: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    Self {
      manager: manager.clone(),
      mutate_fn: Arc::new(move |vars| mutate_fn(vars).boxed()),
      mutation_key: None,
      invalidates: Vec::new(),
      refetches: Vec::new(),
      optimistic: None,
    }
  }

  /// Label used for logging and for paused writes.
  pub fn mutation_key(mut self, key: QueryKey) -> Self {
    self.mutation_key = Some(key);
    self
  }

  /// Query prefixes marked stale after a successful write.
  pub fn invalidates(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
    self.invalidates.extend(keys);
    self
  }

  /// Queries refetched (and awaited) after a successful write.
  pub fn refetches(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
    self.refetches.extend(keys);
    self
  }

  /// Apply `update` to the cached data under `key` before the write is sent.
  ///
  /// `update` receives the current data (if any) and the variables. The
  /// previous data is restored if the write fails; either way the key is
  /// invalidated once the write settles.
  pub fn optimistic<D, F>(mut self, key: QueryKey, update: F) -> Self
  where
    D: QueryData,
    F: Fn(Option<D>, &V) -> D + Send + Sync + 'static,
  {
    let update: UpdateFn<V> = Arc::new(move |current, vars| {
      let current = current.and_then(|v| serde_json::from_value::<D>(v).ok());
      serde_json::to_value(update(current, vars)).ok()
    });
    self.optimistic = Some(Optimistic { key, update });
    self
  }

  /// Run the write. While offline it is paused and this resolves once the
  /// write has been replayed after reconnecting.
  pub async fn mutate(&self, vars: V) -> Result<T, ApiError> {
    let rollback = self.optimistic.as_ref().map(|o| {
      // Keep in-flight fetches from overwriting the optimistic value
      self.manager.cancel_queries(&o.key);
      let previous = self.manager.get_query_value(&o.key);
      if let Some(next) = (o.update)(previous.clone(), &vars) {
        self.manager.set_query_value(&o.key, next);
      }
      (o.key.clone(), previous)
    });

    let mutate_fn = Arc::clone(&self.mutate_fn);
    let result = self
      .manager
      .run_mutation(self.mutation_key.clone(), move || mutate_fn(vars.clone()))
      .await;

    match &result {
      Ok(_) => {
        for key in &self.invalidates {
          self.manager.invalidate(key);
        }
        for key in &self.refetches {
          if let Err(e) = self.manager.refetch(key).await {
            warn!(key = %key, error = %e, "refetch after mutation failed");
          }
        }
      }
      Err(e) => {
        if let Some((key, previous)) = &rollback {
          debug!(key = %key, error = %e, "rolling back optimistic update");
          self.manager.restore_query_value(key, previous.clone());
        }
      }
    }

    if let Some((key, _)) = &rollback {
      self.manager.invalidate(key);
    }

    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheManager, ManualConnectivity};
  use crate::config::CacheConfig;
  use crate::query_key;
  use crate::storage::DurableStore;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  fn manager_with(net: &ManualConnectivity) -> CacheManager {
    CacheManager::builder(CacheConfig {
      persist: false,
      ..Default::default()
    })
    .store(DurableStore::disabled())
    .connectivity(Arc::new(net.clone()))
    .build()
  }

  fn rejected() -> ApiError {
    ApiError::from_status(409, "/visits", &json!({ "code": "SLOT_TAKEN" }))
  }

  #[tokio::test]
  async fn test_invalidates_and_refetches_on_success() {
    let m = manager_with(&ManualConnectivity::new(true));
    let visits = query_key!["visits"];
    let museum = query_key!["museums", "detail", "abc123"];
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    m.fetch_query(&museum, move || {
      let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
      async move { Ok::<_, ApiError>(n) }
    })
    .await
    .unwrap();
    m.set_query_data(&visits, &json!([]));

    let book = Mutation::new(&m, |slot: u32| async move { Ok::<_, ApiError>(slot) })
      .invalidates([visits.clone()])
      .refetches([museum.clone()]);

    assert_eq!(book.mutate(7).await.unwrap(), 7);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(m.get_query_data::<usize>(&museum), Some(2));
    assert_eq!(
      m.get_query_info(&visits).unwrap().state,
      crate::cache::EntryState::Stale
    );
  }

  #[tokio::test]
  async fn test_optimistic_update_rolls_back_on_error() {
    let m = manager_with(&ManualConnectivity::new(true));
    let key = query_key!["visits"];
    m.set_query_data(&key, &vec![1u32, 2]);

    let seen = Arc::new(Mutex::new(None));
    let observer = m.clone();
    let seen_during = seen.clone();
    let add = Mutation::new(&m, move |_slot: u32| {
      *seen_during.lock().unwrap() = observer.get_query_data::<Vec<u32>>(&query_key!["visits"]);
      async { Err::<(), _>(rejected()) }
    })
    .optimistic(key.clone(), |current: Option<Vec<u32>>, slot: &u32| {
      let mut visits = current.unwrap_or_default();
      visits.push(*slot);
      visits
    });

    let err = add.mutate(3).await.unwrap_err();
    assert_eq!(err.code, "SLOT_TAKEN");
    assert_eq!(*seen.lock().unwrap(), Some(vec![1, 2, 3]));
    assert_eq!(m.get_query_data::<Vec<u32>>(&key), Some(vec![1, 2]));
  }

  #[tokio::test]
  async fn test_optimistic_rollback_without_previous_data() {
    let m = manager_with(&ManualConnectivity::new(true));
    let key = query_key!["visits"];
    let _observer = m.observe(&key, None);

    let add = Mutation::new(&m, |_slot: u32| async { Err::<(), _>(rejected()) })
      .optimistic(key.clone(), |_: Option<Vec<u32>>, slot: &u32| vec![*slot]);

    assert!(add.mutate(1).await.is_err());
    assert!(m.get_query_value(&key).is_none());
    assert_eq!(m.get_query_info(&key).unwrap().observers, 1);
  }

  #[tokio::test]
  async fn test_optimistic_update_kept_on_success() {
    let m = manager_with(&ManualConnectivity::new(true));
    let key = query_key!["visits"];
    m.set_query_data(&key, &vec![1u32]);

    let add = Mutation::new(&m, |_slot: u32| async { Ok::<_, ApiError>(()) })
      .optimistic(key.clone(), |current: Option<Vec<u32>>, slot: &u32| {
        let mut visits = current.unwrap_or_default();
        visits.push(*slot);
        visits
      });

    add.mutate(2).await.unwrap();
    assert_eq!(m.get_query_data::<Vec<u32>>(&key), Some(vec![1, 2]));
    assert_eq!(
      m.get_query_info(&key).unwrap().state,
      crate::cache::EntryState::Stale
    );
  }

  #[tokio::test]
  async fn test_paused_while_offline() {
    let net = ManualConnectivity::new(false);
    let m = manager_with(&net);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let add = Mutation::new(&m, move |slot: u32| {
      counter.fetch_add(1, Ordering::SeqCst);
      async move { Ok::<_, ApiError>(slot) }
    })
    .mutation_key(query_key!["visits", "create"]);

    let pending = tokio::spawn(async move { add.mutate(5).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(m.paused_mutations(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    net.set_online(true);
    m.handle_network_status_change(true).await;

    assert_eq!(pending.await.unwrap().unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}

//! Core traits and types for the query cache.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::transport::ApiError;

/// Trait for data that can live in the query cache.
///
/// Cached values are stored as JSON so they can be persisted and hydrated;
/// anything that round-trips through serde qualifies.
pub trait QueryData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> QueryData for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Future produced by a type-erased query function
pub type QueryFuture = BoxFuture<'static, Result<Value, ApiError>>;

/// Type-erased query function stored on a cache entry so it can be refetched
/// without the caller.
pub type QueryFn = Arc<dyn Fn() -> QueryFuture + Send + Sync>;

/// Erase a typed fetcher into a [`QueryFn`].
pub fn query_fn<T, F, Fut>(fetcher: F) -> QueryFn
where
  T: QueryData,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
{
  Arc::new(move || {
    let fut = fetcher();
    Box::pin(async move {
      let data = fut.await?;
      serde_json::to_value(data).map_err(|e| ApiError::decode("query", &e))
    })
  })
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last fetched (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Convert the data, keeping the metadata.
  pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<CacheResult<U>, E> {
    Ok(CacheResult {
      data: f(self.data)?,
      source: self.source,
      cached_at: self.cached_at,
    })
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale; a background refetch was started
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

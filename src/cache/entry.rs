use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use serde_json::Value;

use super::key::QueryKey;
use super::traits::QueryFn;
use crate::transport::ApiError;

/// In-flight fetch shared by every caller asking for the same key
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

/// Lifecycle stage of an entry at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
  /// No data fetched yet
  Empty,
  Fresh,
  Stale,
}

/// One cached query.
pub struct CacheEntry {
  pub key: QueryKey,
  pub value: Option<Value>,
  pub inserted_at: DateTime<Utc>,
  /// When `value` was last written
  pub updated_at: Option<DateTime<Utc>>,
  pub stale_time: Duration,
  pub gc_time: Duration,
  /// Forced stale regardless of age
  pub invalidated: bool,
  pub observers: usize,
  /// Set while there are no observers
  pub unobserved_since: Option<DateTime<Utc>>,
  pub last_error: Option<ApiError>,
  /// Failed while offline; fetch again on reconnect
  pub refetch_on_reconnect: bool,
  pub(crate) fetcher: Option<QueryFn>,
  /// Bumped for every fetch started; older results are discarded
  pub(crate) generation: u64,
  pub(crate) in_flight: Option<(u64, SharedFetch)>,
}

impl CacheEntry {
  pub fn new(key: QueryKey, now: DateTime<Utc>, stale_time: Duration, gc_time: Duration) -> Self {
    Self {
      key,
      value: None,
      inserted_at: now,
      updated_at: None,
      stale_time,
      gc_time,
      invalidated: false,
      observers: 0,
      unobserved_since: Some(now),
      last_error: None,
      refetch_on_reconnect: false,
      fetcher: None,
      generation: 0,
      in_flight: None,
    }
  }

  /// When the entry turns stale, if it holds data.
  pub fn stale_at(&self) -> Option<DateTime<Utc>> {
    self.updated_at.map(|t| t + self.stale_time)
  }

  /// When the entry may be garbage collected, if nobody observes it.
  pub fn gc_at(&self) -> Option<DateTime<Utc>> {
    self.unobserved_since.map(|t| t + self.gc_time)
  }

  pub fn state(&self, now: DateTime<Utc>) -> EntryState {
    match (&self.value, self.stale_at()) {
      (None, _) | (_, None) => EntryState::Empty,
      (Some(_), Some(stale_at)) if self.invalidated || now >= stale_at => EntryState::Stale,
      _ => EntryState::Fresh,
    }
  }

  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    self.state(now) != EntryState::Fresh
  }

  pub fn is_fetching(&self) -> bool {
    self.in_flight.is_some()
  }

  pub fn is_gc_eligible(&self, now: DateTime<Utc>) -> bool {
    self.observers == 0 && !self.is_fetching() && self.gc_at().is_some_and(|at| now >= at)
  }

  /// Store a new value and reset staleness.
  pub fn set_value(&mut self, value: Value, now: DateTime<Utc>) {
    self.value = Some(value);
    self.updated_at = Some(now);
    self.invalidated = false;
    self.last_error = None;
    self.refetch_on_reconnect = false;
  }

  pub fn add_observer(&mut self) {
    self.observers += 1;
    self.unobserved_since = None;
  }

  pub fn remove_observer(&mut self, now: DateTime<Utc>) {
    self.observers = self.observers.saturating_sub(1);
    if self.observers == 0 {
      self.unobserved_since = Some(now);
    }
  }

  /// Supersede any in-flight fetch so its result is discarded.
  pub fn cancel_fetch(&mut self) {
    if self.in_flight.take().is_some() {
      self.generation += 1;
    }
  }
}

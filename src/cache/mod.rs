//! Query cache with persistence and offline support.
//!
//! This module provides the cache the query and mutation hooks are built on:
//! - Entries are keyed by structured [`QueryKey`]s and go stale after a fixed time
//! - Stale reads return cached data and refetch in the background
//! - The whole cache is persisted to the durable store and hydrated on startup
//! - Writes made while offline are paused and replayed in order on reconnect

mod connectivity;
mod entry;
mod key;
mod manager;
mod mutation;
mod snapshot;
mod status;
mod throttle;
mod traits;

pub use connectivity::{
  ConnectivityCallback, ConnectivityObserver, ManualConnectivity, ProbeConnectivity, Subscription,
};
pub use entry::EntryState;
pub use key::{key_part, QueryKey};
pub use manager::{
  CacheManager, CacheManagerBuilder, CleanupReport, HydrateOutcome, ObserverGuard, QueryInfo,
};
pub use mutation::Replay;
pub use snapshot::{PersistedEntry, PersistedSnapshot, Rejection};
pub use status::SyncStatus;
pub use throttle::Throttle;
pub use traits::{query_fn, CacheResult, CacheSource, QueryData, QueryFn, QueryFuture};

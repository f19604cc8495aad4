//! Online/offline detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

/// Callback invoked with the new online state on every transition
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Source of connectivity transitions.
pub trait ConnectivityObserver: Send + Sync {
  fn is_online(&self) -> bool;

  /// Register `callback` for transitions until the returned subscription is dropped.
  fn subscribe(&self, callback: ConnectivityCallback) -> Subscription;
}

/// Handle that unsubscribes when dropped.
pub struct Subscription {
  unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
  pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
    Self {
      unsubscribe: Some(Box::new(unsubscribe)),
    }
  }

  pub fn unsubscribe(mut self) {
    if let Some(f) = self.unsubscribe.take() {
      f();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(f) = self.unsubscribe.take() {
      f();
    }
  }
}

/// Connectivity state set explicitly by the host.
#[derive(Clone)]
pub struct ManualConnectivity {
  inner: Arc<ManualInner>,
}

struct ManualInner {
  online: AtomicBool,
  next_id: AtomicU64,
  subscribers: Mutex<HashMap<u64, ConnectivityCallback>>,
}

impl ManualConnectivity {
  pub fn new(online: bool) -> Self {
    Self {
      inner: Arc::new(ManualInner {
        online: AtomicBool::new(online),
        next_id: AtomicU64::new(0),
        subscribers: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Record the current state; subscribers are only notified on a change.
  pub fn set_online(&self, online: bool) {
    if self.inner.online.swap(online, Ordering::SeqCst) == online {
      return;
    }
    info!(online, "connectivity changed");

    let callbacks: Vec<ConnectivityCallback> = self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .cloned()
      .collect();

    for callback in callbacks {
      callback(online);
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .len()
  }
}

impl Default for ManualConnectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

impl ConnectivityObserver for ManualConnectivity {
  fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  fn subscribe(&self, callback: ConnectivityCallback) -> Subscription {
    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, callback);

    let inner = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(inner) = inner.upgrade() {
        inner
          .subscribers
          .lock()
          .unwrap_or_else(|e| e.into_inner())
          .remove(&id);
      }
    })
  }
}

/// Connectivity derived from periodically opening a TCP connection to the API host.
pub struct ProbeConnectivity {
  state: ManualConnectivity,
  task: JoinHandle<()>,
}

impl ProbeConnectivity {
  /// Start probing `base_url` every `interval`. Must be called inside a Tokio runtime.
  pub fn spawn(base_url: &Url, interval: Duration) -> Self {
    let state = ManualConnectivity::new(true);
    let host = base_url.host_str().unwrap_or("localhost").to_string();
    let port = base_url.port_or_known_default().unwrap_or(443);

    let probe_state = state.clone();
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let reachable = tokio::time::timeout(
          Duration::from_secs(5),
          tokio::net::TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        debug!(host = %host, port, reachable, "connectivity probe");
        probe_state.set_online(reachable);
      }
    });

    Self { state, task }
  }
}

impl Drop for ProbeConnectivity {
  fn drop(&mut self) {
    self.task.abort();
  }
}

impl ConnectivityObserver for ProbeConnectivity {
  fn is_online(&self) -> bool {
    self.state.is_online()
  }

  fn subscribe(&self, callback: ConnectivityCallback) -> Subscription {
    self.state.subscribe(callback)
  }
}

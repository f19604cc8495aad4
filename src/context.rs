//! Application context: the transport client and cache manager, built once
//! at startup and handed to whoever needs them.

use color_eyre::{eyre::eyre, Result};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::cache::{CacheManager, HydrateOutcome, ProbeConnectivity};
use crate::config::Config;
use crate::storage::DurableStore;
use crate::transport::ApiClient;

const PROBE_INTERVAL: Duration = Duration::from_secs(10);

static GLOBAL: OnceCell<AppContext> = OnceCell::new();

/// Shared services for one process.
#[derive(Clone)]
pub struct AppContext {
  pub api: ApiClient,
  pub cache: CacheManager,
}

impl AppContext {
  /// Build the client, open the durable store, hydrate the cache and start its
  /// background loops. Fails only when the API base URL is missing or invalid.
  pub async fn init(config: &Config) -> Result<Self> {
    let base_url = config.base_url()?;
    let probe_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    let mut api_config = config.api.clone();
    api_config.base_url = Some(base_url.to_string());
    let api = ApiClient::new(&api_config)?;
    if let Some(token) = Config::get_api_token() {
      api.set_auth(token);
    }

    let store = DurableStore::open_default(&config.app_name);
    let connectivity = ProbeConnectivity::spawn(&probe_url, PROBE_INTERVAL);

    let cache = CacheManager::builder(config.cache.clone())
      .store(store)
      .connectivity(Arc::new(connectivity))
      .persist_key(config.persist_key())
      .build();

    match cache.hydrate().await {
      HydrateOutcome::Restored(n) => info!(entries = n, "restored query cache"),
      outcome => info!(?outcome, "starting with an empty query cache"),
    }
    cache.start();

    Ok(Self { api, cache })
  }

  /// Stop background work and flush the cache.
  pub async fn shutdown(&self) {
    self.cache.shutdown().await;
  }
}

/// Install `ctx` as the process-wide context. Returns it back if one was
/// already set.
pub fn set_global(ctx: AppContext) -> std::result::Result<(), AppContext> {
  GLOBAL.set(ctx)
}

/// The process-wide context, if [`set_global`] was called.
pub fn global() -> Option<&'static AppContext> {
  GLOBAL.get()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_init_requires_base_url() {
    let config = Config::default();
    assert!(AppContext::init(&config).await.is_err());
  }

  #[tokio::test]
  async fn test_init_rejects_invalid_url() {
    let mut config = Config::default();
    config.api.base_url = Some("not a url".to_string());
    assert!(AppContext::init(&config).await.is_err());
  }
}

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Application name, used for storage paths and the persisted cache key
  #[serde(default = "default_app_name")]
  pub app_name: String,
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

fn default_app_name() -> String {
  "museo".to_string()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app_name: default_app_name(),
      api: ApiConfig::default(),
      cache: CacheConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL every request path is resolved against
  #[serde(default)]
  pub base_url: Option<String>,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// Log request and response bodies. Development builds only.
  #[serde(default)]
  pub dev_logging: bool,
}

fn default_timeout_ms() -> u64 {
  50_000
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_ms: default_timeout_ms(),
      dev_logging: false,
    }
  }
}

/// Cache manager tuning. Every field defaults to the values the web and
/// mobile clients ship with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_secs: u64,
  pub gc_time_secs: u64,
  /// Persisted snapshots older than this are discarded on hydrate
  pub max_age_hours: u64,
  pub background_sync_secs: u64,
  pub persist_throttle_ms: u64,
  pub storage_quota_bytes: u64,
  /// Fraction of the quota above which cleanup becomes aggressive
  pub quota_warning_ratio: f64,
  pub cleanup_interval_secs: u64,
  pub gc_sweep_secs: u64,
  /// Version tag; snapshots written by a different build are discarded
  pub buster: String,
  /// Query keys refreshed first on every background sync
  pub priority_keys: Vec<Vec<serde_json::Value>>,
  /// Persist the cache to durable storage
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 5 * 60,
      gc_time_secs: 10 * 60,
      max_age_hours: 24,
      background_sync_secs: 30,
      persist_throttle_ms: 1_000,
      storage_quota_bytes: 50 * 1024 * 1024,
      quota_warning_ratio: 0.9,
      cleanup_interval_secs: 60 * 60,
      gc_sweep_secs: 60,
      buster: env!("CARGO_PKG_VERSION").to_string(),
      priority_keys: Vec::new(),
      persist: true,
    }
  }
}

/// Longest span a duration setting can express (100 years). Larger values
/// are clamped so date arithmetic stays in range.
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

pub fn span_secs(secs: u64) -> Duration {
  Duration::seconds(secs.min(MAX_SPAN_SECS) as i64)
}

pub fn span_hours(hours: u64) -> Duration {
  span_secs(hours.saturating_mul(60 * 60))
}

pub fn span_millis(ms: u64) -> Duration {
  Duration::milliseconds(ms.min(MAX_SPAN_SECS * 1000) as i64)
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    span_secs(self.stale_time_secs)
  }

  pub fn gc_time(&self) -> Duration {
    span_secs(self.gc_time_secs)
  }

  pub fn max_age(&self) -> Duration {
    span_hours(self.max_age_hours)
  }

  pub fn persist_throttle(&self) -> Duration {
    span_millis(self.persist_throttle_ms)
  }
}

impl Config {
  /// Load configuration from file, then apply environment overrides.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./museo.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/museo/config.yaml
  ///
  /// A missing file is not an error when no explicit path was given; the
  /// defaults plus `MUSEO_API_URL` are enough to run.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("museo.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("museo").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(url) = std::env::var("MUSEO_API_URL") {
      if !url.trim().is_empty() {
        self.api.base_url = Some(url);
      }
    }
    self
  }

  /// Resolve the base API URL. Its absence is fatal.
  pub fn base_url(&self) -> Result<&str> {
    self
      .api
      .base_url
      .as_deref()
      .filter(|u| !u.trim().is_empty())
      .ok_or_else(|| {
        eyre!("API base URL not configured. Set api.base_url or the MUSEO_API_URL environment variable.")
      })
  }

  /// Get an API token from the environment, if one was provided.
  pub fn get_api_token() -> Option<String> {
    std::env::var("MUSEO_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// Key of the persisted cache record in durable storage.
  pub fn persist_key(&self) -> String {
    format!("{}-query-cache", self.app_name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_huge_durations_are_clamped() {
    let cache = CacheConfig {
      stale_time_secs: u64::MAX,
      gc_time_secs: u64::MAX,
      max_age_hours: u64::MAX,
      persist_throttle_ms: u64::MAX,
      ..Default::default()
    };
    let cap = Duration::seconds(MAX_SPAN_SECS as i64);

    assert_eq!(cache.stale_time(), cap);
    assert_eq!(cache.gc_time(), cap);
    assert_eq!(cache.max_age(), cap);
    assert_eq!(cache.persist_throttle(), cap);
    assert!(chrono::Utc::now().checked_sub_signed(cache.max_age()).is_some());

    assert_eq!(span_hours(24), Duration::hours(24));
    assert_eq!(span_millis(1_000), Duration::seconds(1));
  }

  #[test]
  fn test_defaults_match_shipped_values() {
    let config = Config::from_yaml("api:\n  base_url: https://api.example.org\n").unwrap();

    assert_eq!(config.app_name, "museo");
    assert_eq!(config.api.timeout_ms, 50_000);
    assert_eq!(config.cache.stale_time(), Duration::minutes(5));
    assert_eq!(config.cache.gc_time(), Duration::minutes(10));
    assert_eq!(config.cache.max_age(), Duration::hours(24));
    assert_eq!(config.cache.background_sync_secs, 30);
    assert_eq!(config.cache.persist_throttle(), Duration::seconds(1));
    assert_eq!(config.cache.storage_quota_bytes, 50 * 1024 * 1024);
    assert_eq!(config.cache.cleanup_interval_secs, 3600);
    assert_eq!(config.persist_key(), "museo-query-cache");
  }

  #[test]
  fn test_partial_cache_section() {
    let config = Config::from_yaml(
      "app_name: portal\ncache:\n  stale_time_secs: 10\n  priority_keys:\n    - [\"museums\", \"list\"]\n",
    )
    .unwrap();

    assert_eq!(config.cache.stale_time_secs, 10);
    assert_eq!(config.cache.gc_time_secs, 600);
    assert_eq!(config.cache.priority_keys.len(), 1);
    assert_eq!(config.persist_key(), "portal-query-cache");
  }

  #[test]
  fn test_missing_base_url_is_error() {
    let config = Config::default();
    assert!(config.base_url().is_err());
  }
}

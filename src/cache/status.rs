use serde::Serialize;
use std::fmt;

/// Process-wide synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  #[default]
  Idle,
  Syncing,
  Error,
  Offline,
}

impl SyncStatus {
  /// Whether a background sync pass may start from this state. A failed
  /// pass leaves `Error`, which the next pass may clear.
  pub fn can_start_sync(self) -> bool {
    matches!(self, SyncStatus::Idle | SyncStatus::Error)
  }
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SyncStatus::Idle => "idle",
      SyncStatus::Syncing => "syncing",
      SyncStatus::Error => "error",
      SyncStatus::Offline => "offline",
    };
    f.write_str(s)
  }
}

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directory for daily log files: `$XDG_DATA_HOME/<app>/logs`.
pub fn log_dir(app_name: &str) -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join(app_name).join("logs"))
}

/// Install the global subscriber.
///
/// Logs go to a daily rolling file when a data directory exists, stderr
/// otherwise. `RUST_LOG` overrides the default `<app>=info` filter. Keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init(app_name: &str) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("{}=info", app_name)));

  match log_dir(app_name) {
    Some(dir) => {
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(&dir, format!("{}.log", app_name));
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(None)
    }
  }
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use museo::cache::{CacheSource, QueryKey};
use museo::config::{span_hours, Config};
use museo::AppContext;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "museo")]
#[command(about = "Query cache and offline sync for the museum portal API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/museo/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET a path through the query cache
  Get {
    /// API path, e.g. /museums/abc123
    path: String,

    /// Query key as a JSON array (default: ["get", <path>])
    #[arg(short, long)]
    key: Option<String>,
  },
  /// Inspect or maintain the persisted cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Run one background sync pass
  Sync,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Show cache and storage statistics
  Stats,
  /// Drop every cached query
  Clear,
  /// Remove stored entries older than the given age
  Cleanup {
    #[arg(long, default_value_t = 24)]
    max_age_hours: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = museo::logging::init(&config.app_name)?;

  let ctx = AppContext::init(&config).await?;
  if museo::context::set_global(ctx.clone()).is_err() {
    return Err(eyre!("Application context already initialized"));
  }

  let result = run(&ctx, args.command).await;
  ctx.shutdown().await;
  result
}

async fn run(ctx: &AppContext, command: Command) -> Result<()> {
  match command {
    Command::Get { path, key } => {
      let key = match key {
        Some(raw) => parse_key(&raw)?,
        None => QueryKey::new(vec![Value::from("get"), Value::from(path.as_str())]),
      };

      let api = ctx.api.clone();
      let result = ctx
        .cache
        .fetch_query(&key, move || {
          let api = api.clone();
          let path = path.clone();
          async move { api.get::<Value>(&path).await }
        })
        .await
        .map_err(|e| eyre!("Request failed: {}", e))?;

      let source = match result.source {
        CacheSource::Network => "network",
        CacheSource::CacheFresh => "cache (fresh)",
        CacheSource::CacheStale => "cache (stale, refreshing)",
        CacheSource::Offline => "cache (offline)",
      };
      eprintln!("{} [{}]", key, source);
      println!("{}", serde_json::to_string_pretty(&result.data)?);
    }
    Command::Cache { action } => match action {
      CacheAction::Stats => {
        let store = ctx.cache.store();
        println!("Queries:        {}", ctx.cache.len());
        println!("Sync status:    {}", ctx.cache.sync_status());
        println!("Storage engine: {}", store.engine_name().await);
        println!("Stored records: {}", store.size().await);
        println!("Storage bytes:  {}", store.get_storage_usage_bytes().await);
        for key in ctx.cache.keys() {
          println!("  {}", key);
        }
      }
      CacheAction::Clear => {
        let n = ctx.cache.len();
        ctx.cache.clear().await;
        println!("Cleared {} queries", n);
      }
      CacheAction::Cleanup { max_age_hours } => {
        let report = ctx
          .cache
          .perform_cleanup(span_hours(max_age_hours))
          .await;
        println!(
          "Removed {} records ({} bytes in use{})",
          report.removed,
          report.usage_bytes,
          if report.aggressive {
            ", over quota threshold"
          } else {
            ""
          }
        );
      }
    },
    Command::Sync => {
      if ctx.cache.background_sync().await {
        println!("Sync finished: {}", ctx.cache.sync_status());
      } else {
        println!("Sync skipped: {}", ctx.cache.sync_status());
      }
    }
  }

  Ok(())
}

fn parse_key(raw: &str) -> Result<QueryKey> {
  let parts: Vec<Value> =
    serde_json::from_str(raw).map_err(|e| eyre!("Query key must be a JSON array: {}", e))?;
  Ok(QueryKey::new(parts))
}

use clap::{Parser, Subcommand};
use segment_cache::{
  CacheConfig, FeedMode, JsonCodec, ReconcileOutcome, RedisEntryStore, SegmentCache,
  SegmentCacheEvent, SharedListener,
};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Codec = JsonCodec<Value, Value>;

#[derive(Parser)]
#[command(name = "segcache", about = "Shared segment cache tool", version)]
struct Args {
  #[arg(long, env = "SEGCACHE_REDIS_HOST")]
  redis_host: Option<String>,
  #[arg(long, env = "SEGCACHE_REDIS_PORT")]
  redis_port: Option<u16>,
  #[arg(long, env = "SEGCACHE_REDIS_PASSWORD")]
  redis_password: Option<String>,
  #[arg(long)]
  database: Option<u8>,
  #[arg(long)]
  index_key: Option<String>,
  #[arg(long)]
  feed_mode: Option<FeedMode>,
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Log every created/deleted event until interrupted
  Watch,
  /// Print every indexed header
  Headers,
  /// Run one reconciliation pass and print the report
  Reconcile,
  /// Delete every indexed entry and the index
  Purge,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    CacheConfig::from_file(path)?
  } else {
    CacheConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(host) = args.redis_host {
    config.redis.host = host;
  }
  if let Some(port) = args.redis_port {
    config.redis.port = port;
  }
  if let Some(password) = args.redis_password {
    config.redis.password = Some(password);
  }
  if let Some(database) = args.database {
    config.redis.database = database;
  }
  if let Some(index_key) = args.index_key {
    config.index_key = index_key;
  }
  if let Some(mode) = args.feed_mode {
    config.feed.mode = mode;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let options = config.options()?;
  let store = Arc::new(RedisEntryStore::connect(&config.redis, &config.index_key).await?);
  store.test_connection().await?;
  tracing::info!("Connected to {}", config.redis.redacted_url());

  match args.command {
    Commands::Watch => {
      let cache = SegmentCache::start(store, Codec::new(), options).await?;
      let logger: SharedListener<Value> =
        Arc::new(|event: SegmentCacheEvent<Value>| -> anyhow::Result<()> {
          tracing::info!("{}: {}", event.event_type(), event.source());
          Ok(())
        });
      cache.add_listener(logger).await?;

      shutdown_signal().await;
      cache.tear_down().await?;
    }
    Commands::Headers => {
      let cache = SegmentCache::new_detached(store, Codec::new(), options);
      for header in cache.get_segment_headers().await? {
        println!("{}", serde_json::to_string(&header)?);
      }
    }
    Commands::Reconcile => {
      let cache = SegmentCache::new_detached(store, Codec::new(), options);
      match cache.reconcile_now().await? {
        ReconcileOutcome::Completed(report) => {
          println!(
            "scanned={} present={} pruned={}",
            report.scanned, report.present, report.pruned
          );
        }
        ReconcileOutcome::Skipped => println!("skipped: reconciliation already running"),
      }
    }
    Commands::Purge => {
      let cache = SegmentCache::new_detached(store, Codec::new(), options);
      let deleted = cache.purge().await?;
      println!("deleted={}", deleted);
    }
  }

  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("Failed to listen for Ctrl+C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        tracing::error!("Failed to install SIGTERM handler: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}

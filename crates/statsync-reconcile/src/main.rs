//! Statistics reconciler daemon.
//!
//! Subscribes to the registry change channel and keeps the Postgres
//! statistics store in line with it. Optionally runs a full resync at
//! startup and on a fixed interval.
//!
//! # Usage
//!
//! ```bash
//! # Run with settings from the environment (DATABASE_URL is required)
//! statsync-reconcile
//!
//! # Load a .env file first, expose metrics on another port
//! statsync-reconcile --dotenv .env.production --metrics-port 9191
//!
//! # Reconcile every sensor once and exit
//! statsync-reconcile --resync-only
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM for graceful shutdown:
//! 1. Stops accepting change events
//! 2. Waits for in-flight reconciliation actions
//! 3. Stops the periodic resync task
//! 4. Exits cleanly

use anyhow::{Context, Result};
use clap::Parser;
use statsync_core::metrics::{init_metrics, start_metrics_server};
use statsync_reconcile::{
    Config, EventListener, FeedItem, PostgresStatsStore, Reconciler, RedisChangeFeed,
    RedisKeyValueStore, StatsStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Buffered change events between the feed and the listener.
const FEED_BUFFER: usize = 1024;

/// Statistics reconciler daemon.
#[derive(Parser, Debug)]
#[command(name = "statsync-reconcile")]
#[command(about = "Keeps the sensor statistics store consistent with the live registry")]
#[command(version)]
struct Args {
    /// Load environment variables from this file before reading configuration
    #[arg(long)]
    dotenv: Option<PathBuf>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "STATSYNC_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Run a single full resync and exit
    #[arg(long)]
    resync_only: bool,

    /// Skip the full resync at startup
    #[arg(long)]
    no_resync_on_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.dotenv {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,statsync_reconcile=debug")),
        )
        .init();

    tracing::info!("statsync reconciler starting...");

    let config = Config::from_env()?;

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    // Connect stores
    let kv = RedisKeyValueStore::connect(&config.redis_url)
        .await
        .context("Failed to connect to the Redis registry")?;
    let stats = PostgresStatsStore::connect(&config.postgres())
        .await
        .context("Failed to connect to the Postgres statistics store")?;
    if !stats.health_check().await? {
        anyhow::bail!("Postgres health check failed");
    }

    let reconciler = Reconciler::new(Arc::new(kv), Arc::new(stats))
        .with_resync_concurrency(config.resync_concurrency);

    if args.resync_only {
        let report = reconciler.full_resync().await?;
        tracing::info!("Resync complete: {report}");
        return Ok(());
    }

    let listener = Arc::new(EventListener::new(reconciler.clone()));

    // Set up graceful shutdown
    let handler_listener = Arc::clone(&listener);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        handler_listener.shutdown();
    })
    .context("Failed to set Ctrl+C handler")?;

    // Subscribe before the startup resync so changes published meanwhile
    // queue in the channel instead of being dropped by Redis.
    let feed = RedisChangeFeed::new(&config.redis_url, config.channel.clone())?;
    let subscription = feed
        .subscribe()
        .await
        .context("Failed to subscribe to the change feed")?;
    let (sender, receiver) = mpsc::channel::<FeedItem>(FEED_BUFFER);
    let feed_listener = Arc::clone(&listener);
    let feed_task = tokio::spawn(async move {
        if let Err(e) = subscription.forward(sender).await {
            tracing::error!(error = %e, "Change feed stopped");
        }
        // Without a feed there is nothing left to listen to.
        feed_listener.shutdown();
    });

    if !args.no_resync_on_start {
        match reconciler.full_resync().await {
            Ok(report) => tracing::info!("Startup resync: {report}"),
            Err(e) => {
                tracing::error!(error = %e, "Startup resync failed, continuing with live feed")
            }
        }
    }

    let resync_task = config
        .resync_interval
        .map(|interval| tokio::spawn(periodic_resync(reconciler.clone(), interval)));

    tracing::info!("Configuration:");
    tracing::info!("  Channel: {}", config.channel);
    tracing::info!("  Pool size: {}", config.db_max_connections);
    tracing::info!(
        "  Periodic resync: {}",
        config
            .resync_interval
            .map(|d| format!("every {}s", d.as_secs()))
            .unwrap_or_else(|| "disabled".to_string())
    );

    // Run until shutdown
    let summary = listener.run(receiver).await;

    // Shutdown sequence
    tracing::info!("Shutting down...");
    feed_task.abort();
    if let Some(task) = resync_task {
        task.abort();
    }

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events received:      {}", summary.received);
    tracing::info!("Actions dispatched:   {}", summary.dispatched);
    tracing::info!("Events ignored:       {}", summary.ignored);
    tracing::info!("Malformed messages:   {}", summary.malformed);
    tracing::info!("Failed actions:       {}", summary.failed);

    Ok(())
}

/// Run a full resync every `interval`, skipping the immediate first tick.
async fn periodic_resync(reconciler: Reconciler, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = reconciler.full_resync().await {
            tracing::error!(error = %e, "Periodic resync failed");
        }
    }
}

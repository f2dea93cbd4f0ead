//! Order book tracker entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_tracker::api::{create_router, AppState};
use orderbook_tracker::config::Config;
use orderbook_tracker::feed::{NormalizedWsFeed, RestSnapshotSource};
use orderbook_tracker::metrics;
use orderbook_tracker::tracker::Tracker;
use orderbook_tracker::utils::{shutdown_signal, wait_for_shutdown};

/// Live order book tracker.
#[derive(Parser, Debug)]
#[command(name = "orderbook-tracker")]
#[command(about = "Reconciles snapshot and diff feeds into live order books")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track the configured pairs and serve the HTTP API (default).
    Run {
        /// HTTP server port, overrides PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check configuration validity.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("orderbook_tracker=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();

    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(),
        Some(Command::Run { port }) => cmd_run(port).await,
        None => cmd_run(None).await,
    }
}

/// Check configuration validity.
fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("ORDER BOOK TRACKER - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Trading Pairs: {}", config.pairs().join(", "));
    println!("  Feed Kind: {}", config.feed_kind);
    println!(
        "  Feed URL: {}",
        config.feed_ws_url.as_deref().unwrap_or("(none, snapshots only)")
    );
    println!(
        "  Snapshot URL: {}",
        config.snapshot_base_url.as_deref().unwrap_or("(missing)")
    );
    println!("  Queue Capacity: {}", config.message_queue_capacity);
    println!("  Orphan Buffer: {}", config.orphan_buffer_capacity);
    println!("  Past-Diffs Window: {}", config.past_diffs_window_size);
    println!(
        "  Snapshot Refresh: {}",
        match config.snapshot_refresh_interval_s {
            0 => "disabled".to_string(),
            s => format!("every {s}s"),
        }
    );
    println!("  Port: {}", config.port);
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Track books until Ctrl-C / SIGTERM.
async fn cmd_run(port_override: Option<u16>) -> anyhow::Result<()> {
    // Load configuration
    info!("Loading configuration...");
    let config = Config::load_validated().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let Some(snapshot_base_url) = config.snapshot_base_url.clone() else {
        return Err(anyhow::anyhow!("SNAPSHOT_BASE_URL is required to run"));
    };

    // Initialize metrics
    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };
    metrics::init_metrics();

    let pairs = config.pairs();
    info!(pairs = ?pairs, feed_kind = %config.feed_kind, "Configuration loaded successfully");

    let source = Arc::new(RestSnapshotSource::new(
        snapshot_base_url,
        config.http_timeout_ms,
    )?);
    let tracker = Arc::new(Tracker::new(config.tracker_config(), source, config.feed_kind));

    match &config.feed_ws_url {
        Some(url) => {
            let feed = Arc::new(NormalizedWsFeed::new(
                url.clone(),
                config.reconnect_backoff(),
                config.heartbeat_interval(),
            ));
            tracker.add_feed(feed.run_with_reconnect(pairs.clone(), config.message_queue_capacity));
        }
        None => warn!("FEED_WS_URL not set, books will only update from snapshots"),
    }

    tracker.start(pairs)?;

    // Start HTTP server
    let mut app_state = AppState::new(Arc::clone(&tracker));
    if let Some(handle) = prometheus {
        app_state = app_state.with_prometheus(handle);
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port_override.unwrap_or(config.port)));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    // Spawn HTTP server
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { wait_for_shutdown(&mut stop_rx).await })
            .await
    });

    shutdown_signal().await;

    stop_tx.send_replace(true);
    tracker.stop().await;
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    info!("Shutdown complete");
    Ok(())
}

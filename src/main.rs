//! Speedwatch - GPS speed limit monitor
//!
//! Headless binary: runs the permission gate, subscribes to the
//! configured location source, and evaluates every sample against the
//! selected limit. State shows up in logs and on the Prometheus
//! endpoint; the interactive dashboard lives in speedwatch-tui.
//!
//! Module structure:
//! - `domain/` - Core types (PositionSample, MonitorState, RenderFrame)
//! - `io/` - External interfaces (NMEA serial, replay, Prometheus)
//! - `services/` - Business logic (evaluator, permission gate, monitor)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use speedwatch::domain::{is_limit_option, MonitorCommand, PermissionStatus};
use speedwatch::infra::{Config, Metrics};
use speedwatch::io::build_source;
use speedwatch::services::{check_and_request, Monitor};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// GPS speed limit monitor
#[derive(Parser, Debug)]
#[command(name = "speedwatch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-sentence visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        git = %env!("GIT_HASH"),
        "speedwatch starting"
    );

    // Parse command line arguments using clap
    let args = Args::parse();

    // Load configuration from TOML file
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        unit = %config.unit_id(),
        source = %config.source_kind().as_str(),
        device = %config.source_device(),
        accuracy = %config.accuracy().as_str(),
        min_distance_m = %config.min_distance_m(),
        default_limit_kmh = %config.default_limit_kmh(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    if !is_limit_option(config.default_limit_kmh()) {
        warn!(
            limit_kmh = %config.default_limit_kmh(),
            "configured default limit is not one of the selector options"
        );
    }

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_unit = config.unit_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = speedwatch::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_unit,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Run the permission gate once at startup; the outcome is terminal
    // for this session
    let source = build_source(&config, metrics.clone());
    let (mut monitor, _frame_rx) = Monitor::new(&config, metrics.clone());

    let status = check_and_request(source.as_ref()).await;
    monitor.set_permission(status);

    let subscription = if status == PermissionStatus::Granted {
        match source.subscribe(config.subscribe_config()).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                error!(error = %e, "subscribe_failed");
                None
            }
        }
    } else {
        None
    };

    // Limit commands come from an operator surface; the headless binary
    // keeps the channel open but never sends
    let (_cmd_tx, cmd_rx) = mpsc::channel::<MonitorCommand>(8);

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run monitor - consumes samples and commands until shutdown
    monitor.run(subscription, cmd_rx, shutdown_rx).await;

    info!("speedwatch shutdown complete");
    Ok(())
}

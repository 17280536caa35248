//! PVSight energy telemetry agent.
//!
//! Tracks solar, grid and inverter counters on the property bus and uploads
//! a status snapshot to the metrics collector on a fixed interval.

use anyhow::{Context, Result};
use clap::Parser;
use pvsight_agent::bus::ZenohBus;
use pvsight_agent::config::AgentConfig;
use pvsight_agent::{Agent, PropertyBus};
use pvsight_common::{BusKeys, LoggingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const AGENT_NAME: &str = "pvsight";

/// Energy telemetry agent for a Victron installation.
#[derive(Parser, Debug)]
#[command(name = "pvsight-agent")]
#[command(about = "Uploads solar and consumption status from the property bus")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "pvsight.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = AgentConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    pvsight_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting pvsight-agent");
    info!("Loaded configuration from {:?}", args.config);

    // Connect to the property bus
    let session = pvsight_common::connect(&config.zenoh)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?;
    let session = Arc::new(session);

    let keys = BusKeys::new(&config.bus.key_root);
    let bus: Arc<dyn PropertyBus> = Arc::new(ZenohBus::new(
        session.clone(),
        keys.clone(),
        config.bus.query_timeout(),
    ));

    let agent = Agent::start(bus, &config)
        .await
        .context("Agent startup failed")?;

    // Publish agent status
    let status_key = keys.agent_status(AGENT_NAME);
    let status = serde_json::json!({
        "agent": AGENT_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": agent.topology().endpoint_names(),
        "timezone": agent.timezone().name(),
        "status": "running"
    });
    if let Err(e) = session.put(&status_key, status.to_string()).await {
        error!("Failed to publish agent status: {}", e);
    }

    let pipeline = agent.pipeline();
    let scheduler_task = tokio::spawn(agent.scheduler().run());

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    scheduler_task.abort();
    agent.shutdown();

    // Publish offline status
    let status = serde_json::json!({
        "agent": AGENT_NAME,
        "status": "offline"
    });
    let _ = session.put(&status_key, status.to_string()).await;

    let stats = pipeline.stats();
    info!(
        ticks = stats.ticks,
        uploads_ok = stats.uploads_ok,
        uploads_failed = stats.uploads_failed,
        ticks_skipped = stats.ticks_skipped,
        retries = stats.retries,
        weather_failures = stats.weather_failures,
        "Final statistics"
    );

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("Agent stopped");

    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

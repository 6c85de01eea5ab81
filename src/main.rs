//! LinkWatch - Network Connectivity Monitor
//!
//! Probes configured hosts with ICMP echo requests, records check results
//! and derived outage events in SQLite, and serves a read-only JSON API
//! for dashboards.

mod config;
mod db;
mod monitor;
mod outage;
mod probe;
mod web;

use config::Config;
use db::Store;
use monitor::Monitor;
use outage::OutageTracker;
use web::Server;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("linkwatch=info".parse()?),
        )
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "check".to_string());

    // Load configuration
    let cfg = Config::load()?;
    tracing::info!("Using database at {}", cfg.database_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.database_path)?);

    match mode.as_str() {
        // One cycle per invocation; cadence belongs to cron or a systemd
        // timer, not to this process.
        "check" => {
            let tracker = OutageTracker::new(store.clone());
            let monitor = Monitor::new(cfg, store, tracker);
            let summary = monitor.run_cycle().await?;
            tracing::info!(
                checks = summary.checks_recorded,
                hosts_down = summary.hosts_down,
                removed_closed = summary.outages_closed_for_removed,
                "check cycle complete"
            );
        }
        "serve" => {
            tracing::info!("Starting LinkWatch API on port {}...", cfg.http_port);
            let server = Server::new(&cfg, store);
            server.start().await?;
        }
        "cleanup" => {
            let cutoff = Utc::now() - ChronoDuration::days(cfg.retention_days);
            let removed = store.purge_before(cutoff)?;
            tracing::info!(
                removed,
                retention_days = cfg.retention_days,
                "purged old check results"
            );
        }
        other => {
            return Err(
                format!("unknown mode '{}', expected check, serve, or cleanup", other).into(),
            );
        }
    }

    Ok(())
}

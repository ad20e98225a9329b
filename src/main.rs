//! UpsWatch - UPS Monitoring Daemon
//!
//! Headless monitor: polls the configured devices on a timer and logs
//! status transitions until interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upswatch::config::EngineConfig;
use upswatch::db::{Device, SampleStore};
use upswatch::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("upswatch=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = EngineConfig::load();
    tracing::info!("Starting UpsWatch, polling every {:?}", cfg.poll_interval);
    tracing::info!("Using sample database at {}", cfg.db_path);

    // Initialize sample storage
    let store = Arc::new(SampleStore::new(&cfg.db_path)?);
    tracing::info!("Sample database initialized successfully");

    let scheduler = Scheduler::new(cfg, store);

    // Register devices from the JSON list the UI/installer maintains.
    if let Ok(path) = std::env::var("UPSWATCH_DEVICES_PATH") {
        let raw = std::fs::read_to_string(&path)?;
        let devices: Vec<Device> = serde_json::from_str(&raw)?;
        tracing::info!("Loaded {} device(s) from {}", devices.len(), path);
        for device in devices {
            if let Err(e) = scheduler.add_device(device).await {
                tracing::error!("Skipping device: {}", e);
            }
        }
    } else {
        tracing::warn!("UPSWATCH_DEVICES_PATH not set, starting with an empty registry");
    }

    // Log every completed poll so the daemon is useful on its own.
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.status.is_online {
                tracing::info!(
                    device = event.device_id,
                    charge = ?event.status.battery_charge_pct,
                    load = ?event.status.load_pct,
                    "device online"
                );
            } else {
                tracing::warn!(
                    device = event.device_id,
                    reason = event.status.last_failure.as_deref().unwrap_or("unknown"),
                    "device offline"
                );
            }
        }
    });

    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.stop().await;

    Ok(())
}

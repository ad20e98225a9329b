//! Configuration module for UpsWatch.
//!
//! Loads engine configuration from environment variables with sensible
//! defaults.

use std::env;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between poll cycles (default: 30 seconds)
    pub poll_interval: Duration,
    /// Hard timeout applied to each device poll (default: 5 seconds)
    pub poll_timeout: Duration,
    /// Maximum number of simultaneous outbound polls (default: 4)
    pub max_concurrent_polls: usize,
    /// Maximum number of registered devices (default: 16)
    pub max_devices: usize,
    /// Path to the SQLite sample database (default: "upswatch.db")
    pub db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(5),
            max_concurrent_polls: 4,
            max_devices: 16,
            db_path: "upswatch.db".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPSWATCH_POLL_INTERVAL_SECS`: seconds between poll cycles (default: 30)
    /// - `UPSWATCH_POLL_TIMEOUT_SECS`: per-poll timeout in seconds (default: 5)
    /// - `UPSWATCH_MAX_CONCURRENT_POLLS`: simultaneous poll cap (default: 4)
    /// - `UPSWATCH_MAX_DEVICES`: device registry capacity (default: 16)
    /// - `UPSWATCH_DB_PATH`: sample database path (default: "upswatch.db")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(secs) = env_u64("UPSWATCH_POLL_INTERVAL_SECS") {
            cfg.poll_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(secs) = env_u64("UPSWATCH_POLL_TIMEOUT_SECS") {
            cfg.poll_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(n) = env_u64("UPSWATCH_MAX_CONCURRENT_POLLS") {
            cfg.max_concurrent_polls = (n as usize).max(1);
        }

        if let Some(n) = env_u64("UPSWATCH_MAX_DEVICES") {
            cfg.max_devices = (n as usize).max(1);
        }

        if let Ok(db_path) = env::var("UPSWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

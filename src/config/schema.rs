use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::detector::DetectorConfig;
use crate::kernel::tracker::TrackerConfig;

/// Top-level settings loaded from `config.toml`.
///
/// Precedence (highest wins):
/// 1) Environment variables (prefix `ODO__`, `__` as nested separator)
/// 2) Config file (if present)
/// 3) Struct defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub tracking: TrackingSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub prod_url: String,
    /// Used while the persisted dev-mode flag is on.
    pub dev_url: String,
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            prod_url: "https://odo.ist".to_string(),
            dev_url: "http://localhost:8080".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub poll_interval_ms: u64,
    /// Quiet period after the last page mutation before a check runs.
    pub debounce_ms: u64,
    /// Extra checks after a debounced one, measured from the mutation.
    pub recheck_delays_ms: Vec<u64>,
    pub initial_check_delay_ms: u64,
    pub stale_after_secs: u64,
    pub min_listen_secs: f64,
    pub artist_retry_limit: u32,
    pub artist_retry_delay_ms: u64,
    pub position_poll_ms: u64,
    pub update_interval_ms: u64,
    pub min_update_gap_ms: u64,
    pub idle_reset_interval_secs: u64,
    pub pending_sync_delay_ms: u64,
    pub pending_sync_interval_secs: u64,
    pub history_limit: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            debounce_ms: 500,
            recheck_delays_ms: vec![1_500, 3_000],
            initial_check_delay_ms: 1_000,
            stale_after_secs: 300,
            min_listen_secs: 3.0,
            artist_retry_limit: 5,
            artist_retry_delay_ms: 2_000,
            position_poll_ms: 1_000,
            update_interval_ms: 10_000,
            min_update_gap_ms: 3_000,
            idle_reset_interval_secs: 3_600,
            pending_sync_delay_ms: 5_000,
            pending_sync_interval_secs: 600,
            history_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// State file. Defaults to `$XDG_DATA_HOME/odo/state.json`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub debug: bool,
}

impl Settings {
    pub fn server_url(&self, dev_mode: bool) -> &str {
        if dev_mode {
            &self.server.dev_url
        } else {
            &self.server.prod_url
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        let t = &self.tracking;
        TrackerConfig {
            stale_after: chrono::Duration::seconds(t.stale_after_secs as i64),
            min_listen_secs: t.min_listen_secs,
            artist_retry_limit: t.artist_retry_limit,
            history_cap: t.history_limit,
            min_update_gap: chrono::Duration::milliseconds(t.min_update_gap_ms as i64),
            ..TrackerConfig::default()
        }
    }
}

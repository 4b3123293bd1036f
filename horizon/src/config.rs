use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Lower bound for the snapshot buffer.
pub const MIN_SNAPSHOTS: usize = 8;
/// Upper bound for the snapshot buffer.
pub const MAX_SNAPSHOTS: usize = 2000;
/// Smallest flush interval accepted, in milliseconds.
pub const MIN_FLUSH_INTERVAL_MS: u64 = 5;

/// Configuration for the pipeline engine.
///
/// Every field has a sane default and every value is clamped by
/// [`EngineConfig::normalized`], so a config read from the environment can
/// never make the snapshot buffer unbounded or the flusher spin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Snapshots buffered before a forced flush; also the per-workspace
    /// retention cap of the in-memory store.
    pub max_snapshots: usize,
    /// Interval between background snapshot flushes, in milliseconds.
    pub flush_interval_ms: u64,
    /// Timeout applied to plugins that do not declare one, in milliseconds.
    pub default_plugin_timeout_ms: u64,
    /// Capacity of the in-process run event bus.
    pub event_capacity: usize,
    /// Plugin cap applied when a request does not carry one.
    pub default_max_plugins: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 240,
            flush_interval_ms: 25,
            default_plugin_timeout_ms: 30_000,
            event_capacity: 256,
            default_max_plugins: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Reads `HORIZON_MAX_SNAPSHOTS`, `HORIZON_FLUSH_INTERVAL_MS`,
    /// `HORIZON_PLUGIN_TIMEOUT_MS` and `HORIZON_EVENT_CAPACITY`. Unparsable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_snapshots: env::var("HORIZON_MAX_SNAPSHOTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_snapshots),
            flush_interval_ms: env::var("HORIZON_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.flush_interval_ms),
            default_plugin_timeout_ms: env::var("HORIZON_PLUGIN_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_plugin_timeout_ms),
            event_capacity: env::var("HORIZON_EVENT_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.event_capacity),
            default_max_plugins: defaults.default_max_plugins,
        }
        .normalized()
    }

    /// Clamp every field into its supported range.
    pub fn normalized(mut self) -> Self {
        self.max_snapshots = self.max_snapshots.clamp(MIN_SNAPSHOTS, MAX_SNAPSHOTS);
        self.flush_interval_ms = self.flush_interval_ms.max(MIN_FLUSH_INTERVAL_MS);
        self.default_plugin_timeout_ms = self.default_plugin_timeout_ms.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn default_plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.default_plugin_timeout_ms)
    }
}

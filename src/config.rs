//! Application configuration loaded from environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::feed::message::FeedKind;
use crate::feed::router::RouterConfig;
use crate::feed::source::BackoffConfig;
use crate::tracker::TrackerConfig;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Tracking ===
    /// Pairs to track, comma separated (e.g. "BTC-USDT,ETH-USDT").
    #[serde(default)]
    pub trading_pairs: Vec<String>,

    /// How the feed reports book changes: aggregate or per_order.
    #[serde(default)]
    pub feed_kind: FeedKind,

    // === Feed Adapters ===
    /// WebSocket URL of the normalized push feed.
    #[serde(default)]
    pub feed_ws_url: Option<String>,

    /// Base URL of the snapshot service.
    #[serde(default)]
    pub snapshot_base_url: Option<String>,

    // === Queues and Buffers ===
    /// Per-pair message queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub message_queue_capacity: usize,

    /// Queue fill fraction that logs a warning.
    #[serde(default = "default_high_water_mark")]
    pub queue_high_water_mark: f64,

    /// Messages held per unregistered pair.
    #[serde(default = "default_orphan_capacity")]
    pub orphan_buffer_capacity: usize,

    /// Diffs held per pair before its first snapshot.
    #[serde(default = "default_past_diffs_window")]
    pub past_diffs_window_size: usize,

    /// Trade broadcast channel capacity.
    #[serde(default = "default_trade_capacity")]
    pub trade_channel_capacity: usize,

    // === Timing ===
    /// Periodic resnapshot interval in seconds (0 = disabled).
    #[serde(default)]
    pub snapshot_refresh_interval_s: u64,

    /// Delay before restarting a failed reconciler.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Time allowed for tasks to stop.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Maximum feed reconnect backoff in seconds.
    #[serde(default = "default_max_reconnect_delay")]
    pub ws_max_reconnect_delay_s: u64,

    /// Expected feed heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub ws_heartbeat_interval_s: u64,

    /// Snapshot request timeout.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_ms: u64,

    // === Server Configuration ===
    /// HTTP server port for health/metrics endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Enable verbose logging.
    #[serde(default)]
    pub verbose: bool,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_high_water_mark() -> f64 {
    0.8
}

fn default_orphan_capacity() -> usize {
    256
}

fn default_past_diffs_window() -> usize {
    512
}

fn default_trade_capacity() -> usize {
    1024
}

fn default_restart_delay() -> u64 {
    500
}

fn default_shutdown_timeout() -> u64 {
    2000
}

fn default_max_reconnect_delay() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    2000
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Load from the environment and validate.
    pub fn load_validated() -> crate::Result<Self> {
        let config = Self::load()?;
        config.validate().map_err(AppError::InvalidConfig)?;
        Ok(config)
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.pairs().is_empty() {
            return Err("TRADING_PAIRS must list at least one pair".to_string());
        }

        for (name, value) in [
            ("MESSAGE_QUEUE_CAPACITY", self.message_queue_capacity),
            ("ORPHAN_BUFFER_CAPACITY", self.orphan_buffer_capacity),
            ("PAST_DIFFS_WINDOW_SIZE", self.past_diffs_window_size),
            ("TRADE_CHANNEL_CAPACITY", self.trade_channel_capacity),
        ] {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }

        if self.orphan_buffer_capacity > self.message_queue_capacity {
            return Err(
                "ORPHAN_BUFFER_CAPACITY must not exceed MESSAGE_QUEUE_CAPACITY".to_string(),
            );
        }

        if self.ws_heartbeat_interval_s == 0 {
            return Err("WS_HEARTBEAT_INTERVAL_S must be greater than 0".to_string());
        }

        if !(self.queue_high_water_mark > 0.0 && self.queue_high_water_mark <= 1.0) {
            return Err("QUEUE_HIGH_WATER_MARK must be in (0, 1]".to_string());
        }

        Ok(())
    }

    /// Trimmed, non-empty trading pairs.
    pub fn pairs(&self) -> Vec<String> {
        self.trading_pairs
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Backoff used for feed reconnects.
    pub fn reconnect_backoff(&self) -> BackoffConfig {
        BackoffConfig::with_max_delay(self.ws_max_reconnect_delay_s)
    }

    /// Feed heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.ws_heartbeat_interval_s)
    }

    /// Library-level tracker settings.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            message_queue_capacity: self.message_queue_capacity,
            router: RouterConfig {
                orphan_buffer_capacity: self.orphan_buffer_capacity,
                high_water_mark: self.queue_high_water_mark,
            },
            past_diffs_window_size: self.past_diffs_window_size,
            trade_channel_capacity: self.trade_channel_capacity,
            snapshot_refresh_interval: Duration::from_secs(self.snapshot_refresh_interval_s),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            snapshot_backoff: self.reconnect_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Config {
        envy::from_iter(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn defaults_apply() {
        let config = from_vars(&[("TRADING_PAIRS", "BTC-USDT")]);

        assert_eq!(config.message_queue_capacity, 1000);
        assert_eq!(config.orphan_buffer_capacity, 256);
        assert_eq!(config.past_diffs_window_size, 512);
        assert_eq!(config.feed_kind, FeedKind::AggregateLevels);
        assert_eq!(config.port, 8080);
        assert!(config.feed_ws_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_pair_list_and_feed_kind() {
        let config = from_vars(&[
            ("TRADING_PAIRS", "BTC-USDT, ETH-USDT,"),
            ("FEED_KIND", "per_order"),
            ("SNAPSHOT_REFRESH_INTERVAL_S", "60"),
        ]);

        assert_eq!(config.pairs(), vec!["BTC-USDT", "ETH-USDT"]);
        assert_eq!(config.feed_kind, FeedKind::PerOrder);

        let tracker = config.tracker_config();
        assert_eq!(tracker.snapshot_refresh_interval, Duration::from_secs(60));
        assert_eq!(tracker.router.orphan_buffer_capacity, 256);
    }

    #[test]
    fn aggregate_alias_is_accepted() {
        let config = from_vars(&[("FEED_KIND", "aggregate")]);
        assert_eq!(config.feed_kind, FeedKind::AggregateLevels);
    }

    #[test]
    fn validate_rejects_missing_pairs() {
        let config = from_vars(&[]);
        let err = config.validate().map_err(AppError::InvalidConfig).unwrap_err();
        assert!(err.to_string().starts_with("invalid configuration: TRADING_PAIRS"));
    }

    #[test]
    fn validate_rejects_bad_capacities() {
        let zero_queue = from_vars(&[
            ("TRADING_PAIRS", "BTC-USDT"),
            ("MESSAGE_QUEUE_CAPACITY", "0"),
        ]);
        assert!(zero_queue.validate().is_err());

        let orphan_too_big = from_vars(&[
            ("TRADING_PAIRS", "BTC-USDT"),
            ("MESSAGE_QUEUE_CAPACITY", "10"),
            ("ORPHAN_BUFFER_CAPACITY", "20"),
        ]);
        assert!(orphan_too_big.validate().is_err());

        let bad_mark = from_vars(&[
            ("TRADING_PAIRS", "BTC-USDT"),
            ("QUEUE_HIGH_WATER_MARK", "1.5"),
        ]);
        assert!(bad_mark.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_heartbeat() {
        let config = from_vars(&[
            ("TRADING_PAIRS", "BTC-USDT"),
            ("WS_HEARTBEAT_INTERVAL_S", "0"),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.starts_with("WS_HEARTBEAT_INTERVAL_S"));
    }
}

// Coordinator configuration.
//
// Loaded from an optional TOML file, then overridden by `TETHER_*`
// environment variables. Every duration is expressed in milliseconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Log output format for the binary's subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Every tunable of the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Explicit instance id; resolved from the environment when unset.
    pub instance_id: Option<String>,
    /// SQLite file backing the document store.
    pub database_path: PathBuf,
    /// Optional listen address for the HTTP status surface.
    pub status_listen_addr: Option<SocketAddr>,
    /// Log filter directive (e.g. `info`, `tether_daemon=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,

    // Lease
    pub lease_duration_ms: u64,
    pub lease_refresh_interval_ms: u64,
    pub lock_validate_interval_ms: u64,
    pub passive_retry_interval_ms: u64,

    // Reconnect
    pub backoff_table_ms: Vec<u64>,
    pub backoff_cap_ms: u64,
    pub backoff_jitter_ms: u64,
    pub storm_threshold: usize,
    pub storm_window_ms: u64,
    pub storm_cooldown_ms: u64,

    // Watchdogs
    pub keepalive_check_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub guard_check_interval_ms: u64,
    pub reconnect_loop_threshold: u32,
    pub reconnect_loop_window_ms: u64,
    pub disconnect_stuck_threshold_ms: u64,
    pub lag_check_interval_ms: u64,
    pub lag_sample_window: usize,
    pub lag_p95_threshold_ms: u64,

    // Outbox
    pub outbox_poll_interval_ms: u64,
    pub outbox_batch_size: usize,
    pub outbox_drain_batch_size: usize,
    /// Reduced-throughput mode: smaller batches per poll.
    pub drain_mode: bool,
    pub max_send_rate_per_sec: u32,
    pub outbox_backoff_base_ms: u64,
    pub outbox_backoff_cap_ms: u64,
    pub outbox_max_attempts: u32,
    pub outbox_ack_timeout_ms: u64,
    pub warm_up_delay_ms: u64,

    // Inbound + dependency health
    pub dedup_cache_capacity: usize,
    pub degraded_error_threshold: u32,
    pub store_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            database_path: PathBuf::from("tether.db"),
            status_listen_addr: None,
            log_filter: "info".into(),
            log_format: LogFormat::Pretty,
            lease_duration_ms: 90_000,
            lease_refresh_interval_ms: 30_000,
            lock_validate_interval_ms: 30_000,
            passive_retry_interval_ms: 30_000,
            backoff_table_ms: vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000],
            backoff_cap_ms: 60_000,
            backoff_jitter_ms: 250,
            storm_threshold: 5,
            storm_window_ms: 120_000,
            storm_cooldown_ms: 300_000,
            keepalive_check_interval_ms: 60_000,
            stale_threshold_ms: 300_000,
            guard_check_interval_ms: 60_000,
            reconnect_loop_threshold: 10,
            reconnect_loop_window_ms: 600_000,
            disconnect_stuck_threshold_ms: 600_000,
            lag_check_interval_ms: 10_000,
            lag_sample_window: 30,
            lag_p95_threshold_ms: 2_000,
            outbox_poll_interval_ms: 5_000,
            outbox_batch_size: 10,
            outbox_drain_batch_size: 5,
            drain_mode: false,
            max_send_rate_per_sec: 10,
            outbox_backoff_base_ms: 1_000,
            outbox_backoff_cap_ms: 60_000,
            outbox_max_attempts: 10,
            outbox_ack_timeout_ms: 300_000,
            warm_up_delay_ms: 5_000,
            dedup_cache_capacity: 10_000,
            degraded_error_threshold: 5,
            store_timeout_ms: 10_000,
        }
    }
}

impl CoordinatorConfig {
    /// Load from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a TOML file (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Apply environment overrides from the process environment.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `TETHER_INSTANCE_ID` | `instance_id` |
    /// | `TETHER_DATABASE_PATH` | `database_path` |
    /// | `TETHER_STATUS_ADDR` | `status_listen_addr` |
    /// | `TETHER_LOG_FILTER` | `log_filter` |
    /// | `TETHER_LOG_FORMAT` | `log_format` (`pretty` or `json`) |
    /// | `TETHER_LEASE_DURATION_MS` | `lease_duration_ms` |
    /// | `TETHER_MAX_SEND_RATE` | `max_send_rate_per_sec` |
    /// | `TETHER_WARM_UP_DELAY_MS` | `warm_up_delay_ms` |
    /// | `TETHER_DRAIN_MODE` | `drain_mode` (`1`/`true`) |
    pub fn apply_env(self) -> Self {
        self.apply_env_fn(|key| std::env::var(key))
    }

    /// Testable variant that accepts an environment lookup function.
    pub fn apply_env_fn<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        if let Ok(id) = env("TETHER_INSTANCE_ID") {
            if !id.trim().is_empty() {
                self.instance_id = Some(id.trim().to_string());
            }
        }
        if let Ok(path) = env("TETHER_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(addr) = env("TETHER_STATUS_ADDR").ok().and_then(|v| v.parse().ok()) {
            self.status_listen_addr = Some(addr);
        }
        if let Ok(filter) = env("TETHER_LOG_FILTER") {
            self.log_filter = filter;
        }
        match env("TETHER_LOG_FORMAT").ok().as_deref() {
            Some("json") => self.log_format = LogFormat::Json,
            Some("pretty") => self.log_format = LogFormat::Pretty,
            _ => {}
        }
        if let Some(ms) = env("TETHER_LEASE_DURATION_MS").ok().and_then(|v| v.parse().ok()) {
            self.lease_duration_ms = ms;
        }
        if let Some(rate) = env("TETHER_MAX_SEND_RATE").ok().and_then(|v| v.parse().ok()) {
            self.max_send_rate_per_sec = rate;
        }
        if let Some(ms) = env("TETHER_WARM_UP_DELAY_MS").ok().and_then(|v| v.parse().ok()) {
            self.warm_up_delay_ms = ms;
        }
        if let Ok(drain) = env("TETHER_DRAIN_MODE") {
            self.drain_mode = matches!(drain.as_str(), "1" | "true");
        }
        self
    }

    /// Resolve the instance id: explicit config, then `RAILWAY_DEPLOYMENT_ID`,
    /// then a random `instance_<16 hex>` id.
    pub fn resolve_instance_id<F>(&self, env: F) -> String
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        if let Some(id) = self.instance_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        if let Ok(id) = env("RAILWAY_DEPLOYMENT_ID") {
            if !id.is_empty() {
                return id;
            }
        }
        let mut hex = Uuid::new_v4().simple().to_string();
        hex.truncate(16);
        format!("instance_{hex}")
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("lease_duration_ms", self.lease_duration_ms),
            ("lease_refresh_interval_ms", self.lease_refresh_interval_ms),
            ("lock_validate_interval_ms", self.lock_validate_interval_ms),
            ("passive_retry_interval_ms", self.passive_retry_interval_ms),
            ("keepalive_check_interval_ms", self.keepalive_check_interval_ms),
            ("guard_check_interval_ms", self.guard_check_interval_ms),
            ("outbox_poll_interval_ms", self.outbox_poll_interval_ms),
            ("lag_check_interval_ms", self.lag_check_interval_ms),
            ("store_timeout_ms", self.store_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.backoff_table_ms.is_empty() {
            return Err(ConfigError::Invalid("backoff_table_ms must not be empty".into()));
        }
        if self.lease_refresh_interval_ms >= self.lease_duration_ms {
            return Err(ConfigError::Invalid(
                "lease_refresh_interval_ms must be shorter than lease_duration_ms".into(),
            ));
        }
        if self.max_send_rate_per_sec == 0 {
            return Err(ConfigError::Invalid("max_send_rate_per_sec must be at least 1".into()));
        }
        if self.dedup_cache_capacity == 0 {
            return Err(ConfigError::Invalid("dedup_cache_capacity must be at least 1".into()));
        }
        if self.outbox_batch_size == 0 || self.outbox_drain_batch_size == 0 {
            return Err(ConfigError::Invalid("outbox batch sizes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn lease_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lease_refresh_interval_ms)
    }

    pub fn lock_validate_interval(&self) -> Duration {
        Duration::from_millis(self.lock_validate_interval_ms)
    }

    pub fn passive_retry_interval(&self) -> Duration {
        Duration::from_millis(self.passive_retry_interval_ms)
    }

    pub fn keepalive_check_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_check_interval_ms)
    }

    pub fn guard_check_interval(&self) -> Duration {
        Duration::from_millis(self.guard_check_interval_ms)
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_interval_ms)
    }

    pub fn lag_check_interval(&self) -> Duration {
        Duration::from_millis(self.lag_check_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Outbox batch size for the current throughput mode.
    pub fn effective_batch_size(&self) -> usize {
        if self.drain_mode {
            self.outbox_drain_batch_size
        } else {
            self.outbox_batch_size
        }
    }

    /// Minimum spacing between two sends.
    pub fn min_send_interval_ms(&self) -> i64 {
        1_000 / i64::from(self.max_send_rate_per_sec.max(1))
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(std::io::Error),
    #[error("config parse error: {0}")]
    Parse(toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

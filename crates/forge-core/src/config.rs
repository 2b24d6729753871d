use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};

pub const DEFAULT_PORT: u16 = 3333;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024; // 64 KB hard cap per inbound frame
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_FLUSH_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

pub const DEFAULT_CADENCE_MS: u64 = 1_000;
pub const MIN_CADENCE_MS: u64 = 100;
pub const MAX_CADENCE_MS: u64 = 10_000;

/// Top-level config (forge.toml + FORGE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bounded per-connection outbox; a full outbox counts as a send failure.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            heartbeat_secs: HEARTBEAT_INTERVAL_SECS,
        }
    }
}

/// Batching pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum time a buffered event waits before its batch is flushed.
    #[serde(default = "default_flush_window_ms")]
    pub flush_window_ms: u64,
    /// Buffer size that forces an immediate flush.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_window_ms: DEFAULT_FLUSH_WINDOW_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl BatchConfig {
    pub fn flush_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.flush_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Closed records kept for history queries before the oldest is evicted.
    #[serde(default = "default_retention_cap")]
    pub retention_cap: usize,
    /// Per-connection event log length.
    #[serde(default = "default_event_log_cap")]
    pub event_log_cap: usize,
    /// Length of the registry-wide activity feed.
    #[serde(default = "default_activity_feed_cap")]
    pub activity_feed_cap: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention_cap: 100,
            event_log_cap: 50,
            activity_feed_cap: 100,
        }
    }
}

/// Poll cadence bounds for snapshot channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_cadence_ms")]
    pub default_ms: u64,
    #[serde(default = "default_min_cadence_ms")]
    pub min_ms: u64,
    #[serde(default = "default_max_cadence_ms")]
    pub max_ms: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            default_ms: DEFAULT_CADENCE_MS,
            min_ms: MIN_CADENCE_MS,
            max_ms: MAX_CADENCE_MS,
        }
    }
}

/// Client-side retry and synthetic-data settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retries driven by the controller's own timer. After this many the
    /// controller waits for an external connectivity signal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter fraction added on top of each backoff delay (0.1 = up to +10 %).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_synthetic_interval_ms")]
    pub synthetic_interval_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter: 0.1,
            connect_timeout_ms: 5_000,
            synthetic_interval_ms: 1_000,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_outbox_capacity() -> usize {
    DEFAULT_OUTBOX_CAPACITY
}
fn default_heartbeat_secs() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}
fn default_flush_window_ms() -> u64 {
    DEFAULT_FLUSH_WINDOW_MS
}
fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}
fn default_retention_cap() -> usize {
    100
}
fn default_event_log_cap() -> usize {
    50
}
fn default_activity_feed_cap() -> usize {
    100
}
fn default_cadence_ms() -> u64 {
    DEFAULT_CADENCE_MS
}
fn default_min_cadence_ms() -> u64 {
    MIN_CADENCE_MS
}
fn default_max_cadence_ms() -> u64 {
    MAX_CADENCE_MS
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_jitter() -> f64 {
    0.1
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_synthetic_interval_ms() -> u64 {
    1_000
}

impl ForgeConfig {
    /// Load config from a TOML file with FORGE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.forgeboard/forge.toml
    ///
    /// Nested keys use a double underscore, e.g. `FORGE_BATCH__MAX_BATCH_SIZE=50`.
    /// A missing file is not an error; defaults fill every section.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading config");

        let config: ForgeConfig = Figment::from(Serialized::defaults(ForgeConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FORGE_").split("__"))
            .extract()
            .map_err(|e| ForgeError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline and gateway cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.batch.max_batch_size == 0 {
            return Err(ForgeError::Config("batch.max_batch_size must be > 0".into()));
        }
        if self.batch.flush_window_ms == 0 {
            return Err(ForgeError::Config("batch.flush_window_ms must be > 0".into()));
        }
        if self.cadence.min_ms == 0 || self.cadence.min_ms > self.cadence.max_ms {
            return Err(ForgeError::Config(format!(
                "cadence bounds invalid: [{}, {}]",
                self.cadence.min_ms, self.cadence.max_ms
            )));
        }
        if !(self.cadence.min_ms..=self.cadence.max_ms).contains(&self.cadence.default_ms) {
            return Err(ForgeError::Config(format!(
                "cadence.default_ms {} outside [{}, {}]",
                self.cadence.default_ms, self.cadence.min_ms, self.cadence.max_ms
            )));
        }
        if self.gateway.outbox_capacity == 0 {
            return Err(ForgeError::Config("gateway.outbox_capacity must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.resilience.jitter) {
            return Err(ForgeError::Config("resilience.jitter must be within [0, 1]".into()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    if let Ok(path) = std::env::var("FORGE_CONFIG") {
        return path;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.forgeboard/forge.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ForgeConfig::default();
        assert_eq!(cfg.batch.flush_window_ms, 1000);
        assert_eq!(cfg.batch.max_batch_size, 100);
        assert_eq!(cfg.registry.retention_cap, 100);
        assert_eq!(cfg.cadence.min_ms, 100);
        assert_eq!(cfg.cadence.max_ms, 10_000);
        assert_eq!(cfg.resilience.max_delay_ms, 30_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ForgeConfig::load(Some("/nonexistent/forge.toml")).unwrap();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.batch.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let cfg: ForgeConfig = Figment::from(Serialized::defaults(ForgeConfig::default()))
            .merge(Toml::string("[batch]\nmax_batch_size = 25\n"))
            .extract()
            .unwrap();
        assert_eq!(cfg.batch.max_batch_size, 25);
        assert_eq!(cfg.batch.flush_window_ms, 1000);
        assert_eq!(cfg.gateway.bind, DEFAULT_BIND);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = ForgeConfig::default();
        cfg.batch.max_batch_size = 0;
        assert!(matches!(cfg.validate(), Err(ForgeError::Config(_))));
    }

    #[test]
    fn inverted_cadence_bounds_rejected() {
        let mut cfg = ForgeConfig::default();
        cfg.cadence.min_ms = 5_000;
        cfg.cadence.max_ms = 1_000;
        assert!(cfg.validate().is_err());
    }
}

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    #[serde(default = "default_keydb_endpoint")]
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for KeyDbConfig {
    fn default() -> Self {
        Self {
            endpoint: default_keydb_endpoint(),
            tls: false,
            auth_token_env: default_keydb_auth_env(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_keydb_endpoint() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseConfig {
    /// Prefix of every lease key: `<prefix>-<class>-<id>`.
    #[serde(default = "default_lease_prefix")]
    pub key_prefix: String,
    /// Pause between contended acquisition attempts, in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Attempts before the lease is declared stuck and force-acquired.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bus topic carrying timeout notifications.
    #[serde(default = "default_timeout_topic")]
    pub timeout_topic: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_lease_prefix(),
            retry_interval_ms: default_retry_interval_ms(),
            max_attempts: default_max_attempts(),
            timeout_topic: default_timeout_topic(),
        }
    }
}

impl LeaseConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_lease_prefix() -> String {
    "lease".to_string()
}

fn default_retry_interval_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_timeout_topic() -> String {
    "leasegate:lease-timeout".to_string()
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Pause before each recovery write-probe, in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// How often quarantined callers re-check the recovering flag.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Key written by the recovery probe.
    #[serde(default = "default_probe_key")]
    pub probe_key: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_key: default_probe_key(),
        }
    }
}

impl FailoverConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_probe_interval_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_probe_key() -> String {
    "leasegate:failover-probe".to_string()
}

// ---------------------------------------------------------------------------
// Message deduplication
// ---------------------------------------------------------------------------

/// What admission does when the store cannot record a delivery marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryFailureMode {
    /// Drop the message and report the store failure.
    #[default]
    FailClosed,
    /// Admit the message and risk processing it twice.
    FailOpen,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub delivery_failure_mode: DeliveryFailureMode,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_dedup_prefix(),
            delivery_failure_mode: DeliveryFailureMode::default(),
        }
    }
}

fn default_dedup_prefix() -> String {
    "leasegate".to_string()
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for `/healthz` and `/metrics` (e.g. `0.0.0.0:9090`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:9090".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.lease.max_attempts >= 1,
        "lease.max_attempts must be at least 1"
    );
    anyhow::ensure!(
        !config.lease.key_prefix.is_empty(),
        "lease.key_prefix must not be empty"
    );
    anyhow::ensure!(
        !config.lease.timeout_topic.is_empty(),
        "lease.timeout_topic must not be empty"
    );
    anyhow::ensure!(
        config.failover.poll_interval_ms > 0 && config.failover.probe_interval_ms > 0,
        "failover intervals must be non-zero"
    );
    anyhow::ensure!(config.keydb.pool_size > 0, "keydb.pool_size must be > 0");
    Ok(())
}

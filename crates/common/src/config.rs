use serde::{Deserialize, Serialize};

use crate::keys;

/// Top-level system configuration, deserialized from system.toml.
///
/// Every section is optional in the file; omitted sections take the
/// documented defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub ticket_store: TicketStoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
}

/// Ticket store endpoint configuration. The bearer token is read from the
/// environment, never from the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TicketStoreConfig {
    /// Base URL of the ticket service. Overridden by TICKET_STORE_URL.
    #[serde(default = "default_ticket_store_location")]
    pub location: String,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_ticket_store_token_env")]
    pub token_env: String,
}

fn default_ticket_store_location() -> String {
    "http://localhost:8090".to_string()
}

fn default_ticket_store_token_env() -> String {
    "TICKET_STORE_TOKEN".to_string()
}

impl Default for TicketStoreConfig {
    fn default() -> Self {
        Self {
            location: default_ticket_store_location(),
            token_env: default_ticket_store_token_env(),
        }
    }
}

/// Lock manager tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// Acquire attempts after the first before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff on conflict; doubles per retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Fixed backoff when the store signals throttling.
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    /// Per-task heartbeat cadence expected of lock holders.
    #[serde(default = "default_lock_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age past which a lock may be stolen under steal-stale.
    /// Lock records are stored with TTL = 2 × this.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    16_000
}
fn default_rate_limit_backoff_ms() -> u64 {
    60_000
}
fn default_lock_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_lock_timeout_ms() -> u64 {
    300_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            heartbeat_interval_ms: default_lock_heartbeat_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Heartbeat monitor tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Liveness publication cadence. Tunable down to 30 s for tests.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// TTL on the published heartbeat key.
    #[serde(default = "default_heartbeat_ttl_seconds")]
    pub heartbeat_ttl_seconds: u64,
    /// Owner heartbeat age past which a lock is swept as stale.
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: u64,
    /// Stale-lock sweep cadence.
    #[serde(default = "default_detection_interval_seconds")]
    pub detection_interval_seconds: u64,
    /// Full-cycle retries when a heartbeat fan-out destination fails.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between heartbeat cycle retries.
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

fn default_heartbeat_interval_seconds() -> u64 {
    300
}
fn default_heartbeat_ttl_seconds() -> u64 {
    600
}
fn default_stale_threshold_seconds() -> u64 {
    600
}
fn default_detection_interval_seconds() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_seconds() -> u64 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            heartbeat_ttl_seconds: default_heartbeat_ttl_seconds(),
            stale_threshold_seconds: default_stale_threshold_seconds(),
            detection_interval_seconds: default_detection_interval_seconds(),
            retry_attempts: default_retry_attempts(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

/// Worker registry tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// TTL on stored worker records.
    #[serde(default = "default_worker_ttl_seconds")]
    pub worker_ttl_seconds: u64,
    /// Heartbeat age up to which a worker classifies healthy.
    #[serde(default = "default_healthy_threshold_seconds")]
    pub healthy_threshold_seconds: u64,
    /// Heartbeat age up to which a worker classifies degraded; past it,
    /// unhealthy, and the sweep deregisters.
    #[serde(default = "default_degraded_threshold_seconds")]
    pub degraded_threshold_seconds: u64,
    /// Expired-worker sweep cadence.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

fn default_worker_ttl_seconds() -> u64 {
    900
}
fn default_healthy_threshold_seconds() -> u64 {
    600
}
fn default_degraded_threshold_seconds() -> u64 {
    900
}
fn default_cleanup_interval_seconds() -> u64 {
    300
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            worker_ttl_seconds: default_worker_ttl_seconds(),
            healthy_threshold_seconds: default_healthy_threshold_seconds(),
            degraded_threshold_seconds: default_degraded_threshold_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

/// Memory synchronizer tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Default TTL applied to writes that don't specify one.
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
    /// Maximum entry count of the read cache. 0 disables caching.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Pending-write buffer flush cadence.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// Cadence at which the synchronizer republishes its shared metrics
    /// roll-up under `coordination/metrics`.
    #[serde(default = "default_sync_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// Process-wide key namespace prefix.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_ttl_seconds() -> u64 {
    3_600
}
fn default_cache_size() -> usize {
    1_000
}
fn default_batch_interval_ms() -> u64 {
    100
}
fn default_sync_heartbeat_interval_seconds() -> u64 {
    5
}
fn default_namespace() -> String {
    keys::DEFAULT_NAMESPACE.to_string()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_ttl_seconds(),
            cache_size: default_cache_size(),
            batch_interval_ms: default_batch_interval_ms(),
            heartbeat_interval_seconds: default_sync_heartbeat_interval_seconds(),
            namespace: default_namespace(),
        }
    }
}

/// Load balancer tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Selection strategy: round-robin, least-loaded, capability-based,
    /// performance-based or adaptive.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Load fraction above which a worker counts as overloaded.
    #[serde(default = "default_load_threshold")]
    pub load_threshold: f64,
    /// Load fraction below which a worker counts as underutilized.
    #[serde(default = "default_underutilized_threshold")]
    pub underutilized_threshold: f64,
}

fn default_strategy() -> String {
    "adaptive".to_string()
}
fn default_load_threshold() -> f64 {
    0.8
}
fn default_underutilized_threshold() -> f64 {
    0.3
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            load_threshold: default_load_threshold(),
            underutilized_threshold: default_underutilized_threshold(),
        }
    }
}

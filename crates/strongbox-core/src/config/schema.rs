//! Configuration schema definitions.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Strongbox configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Envelope crypto settings.
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Versioned store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Secret rotation settings.
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Multi-tier cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Audit ledger settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Envelope crypto configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Hard ceiling of encryptions under one data key.
    #[serde(default = "default_max_ops")]
    pub max_ops_per_data_key: u64,

    /// Encryption count after which a data key is retired.
    #[serde(default = "default_rotate_after_ops")]
    pub rotate_after_ops: u64,

    /// Timeout for a single key-service call, in milliseconds.
    #[serde(default = "default_kms_timeout_ms")]
    pub kms_timeout_ms: u64,

    /// Retry budget for key-service calls.
    #[serde(default)]
    pub kms_retry: RetryPolicy,

    /// Path of the local master key file (file-based key service fallback).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key_file: Option<PathBuf>,
}

// Random 96-bit nonces: stay well below 2^32 messages per key.
fn default_max_ops() -> u64 {
    1 << 32
}

fn default_rotate_after_ops() -> u64 {
    (1u64 << 32) - (1 << 24)
}

fn default_kms_timeout_ms() -> u64 {
    2_000
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            max_ops_per_data_key: default_max_ops(),
            rotate_after_ops: default_rotate_after_ops(),
            kms_timeout_ms: default_kms_timeout_ms(),
            kms_retry: RetryPolicy::default(),
            master_key_file: None,
        }
    }
}

impl CryptoConfig {
    /// Key-service call timeout.
    pub fn kms_timeout(&self) -> Duration {
        Duration::from_millis(self.kms_timeout_ms)
    }
}

/// Versioned store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for the file backend. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Retention applied to namespaces without an explicit policy.
    #[serde(default)]
    pub default_retention: RetentionConfig,

    /// Retry budget for backend I/O.
    #[serde(default)]
    pub backend_retry: RetryPolicy,

    /// Capacity of the invalidation event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_retention: RetentionConfig::default(),
            backend_retry: RetryPolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Version retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Minimum number of versions always kept per key.
    #[serde(default = "default_min_versions")]
    pub min_versions: usize,

    /// Non-current versions older than this are eligible for removal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

fn default_min_versions() -> usize {
    10
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_versions: default_min_versions(),
            max_age_days: None,
        }
    }
}

/// Secret rotation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// How long the previous secret stays valid after activation, in seconds.
    #[serde(default = "default_grace_secs")]
    pub grace_period_secs: u64,

    /// Extra time the previous secret may stay valid while still in use.
    #[serde(default = "default_grace_extension_secs")]
    pub max_grace_extension_secs: u64,

    /// Timeout for the validation hook, in milliseconds.
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,

    /// Error rate (0.0-1.0) that triggers rollback while monitoring.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Automatic rotation interval, in seconds. No follow-up job when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// Scheduler tick interval, in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,

    /// Minimum generated secret length.
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Bytes of randomness per generated secret.
    #[serde(default = "default_generated_bytes")]
    pub generated_bytes: usize,

    /// The previous secret counts as in use if it was presented within this
    /// many seconds. Drives grace extension.
    #[serde(default = "default_usage_quiet_secs")]
    pub usage_quiet_secs: u64,

    /// Directory for persisted rotation jobs. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs_dir: Option<PathBuf>,
}

fn default_grace_secs() -> u64 {
    600
}

fn default_grace_extension_secs() -> u64 {
    3_600
}

fn default_validation_timeout_ms() -> u64 {
    5_000
}

fn default_error_rate_threshold() -> f64 {
    0.05
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_min_length() -> usize {
    24
}

fn default_generated_bytes() -> usize {
    32
}

fn default_usage_quiet_secs() -> u64 {
    60
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_secs(),
            max_grace_extension_secs: default_grace_extension_secs(),
            validation_timeout_ms: default_validation_timeout_ms(),
            error_rate_threshold: default_error_rate_threshold(),
            interval_secs: None,
            tick_interval_ms: default_tick_ms(),
            min_length: default_min_length(),
            generated_bytes: default_generated_bytes(),
            usage_quiet_secs: default_usage_quiet_secs(),
            jobs_dir: None,
        }
    }
}

impl RotationConfig {
    /// Grace period as a chrono duration.
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_period_secs as i64)
    }

    /// Maximum grace extension as a chrono duration.
    pub fn max_grace_extension(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_grace_extension_secs as i64)
    }

    /// Validation hook timeout.
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// Rotation interval, if automatic rotation is on.
    pub fn interval(&self) -> Option<chrono::Duration> {
        self.interval_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }

    /// Scheduler tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Window in which a presentation of the previous secret counts as use.
    pub fn usage_quiet_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.usage_quiet_secs as i64)
    }
}

/// Multi-tier cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum tier-1 entries.
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// Tier-1 time to live, in seconds.
    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,

    /// Tier-2 time to live, in seconds.
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,

    /// Upper bound on how long a `latest` entry may be served without
    /// re-checking the store, in milliseconds.
    #[serde(default = "default_max_propagation_ms")]
    pub max_propagation_ms: u64,

    /// Timeout for a tier-2 call, in milliseconds.
    #[serde(default = "default_l2_timeout_ms")]
    pub l2_timeout_ms: u64,
}

fn default_l1_capacity() -> usize {
    10_000
}

fn default_l1_ttl_secs() -> u64 {
    300
}

fn default_l2_ttl_secs() -> u64 {
    3_600
}

fn default_max_propagation_ms() -> u64 {
    5_000
}

fn default_l2_timeout_ms() -> u64 {
    250
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_ttl_secs: default_l2_ttl_secs(),
            max_propagation_ms: default_max_propagation_ms(),
            l2_timeout_ms: default_l2_timeout_ms(),
        }
    }
}

impl CacheConfig {
    /// Tier-1 TTL.
    pub fn l1_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.l1_ttl_secs as i64)
    }

    /// Tier-2 TTL.
    pub fn l2_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.l2_ttl_secs as i64)
    }

    /// Propagation bound.
    pub fn max_propagation(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.max_propagation_ms as i64)
    }

    /// Tier-2 call timeout.
    pub fn l2_timeout(&self) -> Duration {
        Duration::from_millis(self.l2_timeout_ms)
    }
}

/// Audit ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines ledger file. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,

    /// Timeout for a synchronous sink write, in milliseconds.
    #[serde(default = "default_audit_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Retry budget for sink writes.
    #[serde(default)]
    pub write_retry: RetryPolicy,

    /// Capacity of the buffered informational queue.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Consecutive buffered failures before an operator alert.
    #[serde(default = "default_alert_after")]
    pub alert_after_failures: u32,

    /// Record read events at all.
    #[serde(default = "default_true")]
    pub record_reads: bool,
}

fn default_audit_timeout_ms() -> u64 {
    1_000
}

fn default_buffer_capacity() -> usize {
    4_096
}

fn default_alert_after() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            write_timeout_ms: default_audit_timeout_ms(),
            write_retry: RetryPolicy::default(),
            buffer_capacity: default_buffer_capacity(),
            alert_after_failures: default_alert_after(),
            record_reads: true,
        }
    }
}

impl AuditConfig {
    /// Sink write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `strongbox=debug`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

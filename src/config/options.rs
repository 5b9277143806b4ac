//! Per-queue options, loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Durations are written as integer milliseconds (`*_ms`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::TransportKind;
use crate::error::{Error, Result};
use crate::names::validate_name;

/// How the Redis transport allocates message ids. The relational transport
/// always uses its own sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    Incrementing,
    Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueOptions {
    pub enable_priority: bool,
    pub enable_status_table: bool,
    pub enable_heartbeat: bool,
    pub enable_delayed_processing: bool,
    pub enable_message_expiration: bool,
    pub enable_routes: bool,
    /// Keep the dequeue transaction open until the message is committed.
    pub hold_transaction_until_commit: bool,
    pub id_strategy: IdStrategy,
    /// Routes this process consumes from, polled round-robin.
    pub routes: Vec<String>,
    pub heartbeat: HeartbeatOptions,
    pub delayed: SweepOptions,
    pub expiration: SweepOptions,
    pub error_purge: ErrorPurgeOptions,
    pub consumer: ConsumerOptions,
    pub retry: RetryOptions,
    pub transient_retry: TransientRetryOptions,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            enable_priority: false,
            enable_status_table: false,
            enable_heartbeat: true,
            enable_delayed_processing: true,
            enable_message_expiration: true,
            enable_routes: false,
            hold_transaction_until_commit: false,
            id_strategy: IdStrategy::Incrementing,
            routes: Vec::new(),
            heartbeat: HeartbeatOptions::default(),
            delayed: SweepOptions {
                interval_ms: 1_000,
                batch_limit: 50,
            },
            expiration: SweepOptions {
                interval_ms: 60_000,
                batch_limit: 50,
            },
            error_purge: ErrorPurgeOptions::default(),
            consumer: ConsumerOptions::default(),
            retry: RetryOptions::default(),
            transient_retry: TransientRetryOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatOptions {
    /// How often a consumer renews the lease of the message it is processing.
    pub interval_ms: u64,
    /// Leases not renewed within this window are returned to pending.
    pub window_ms: u64,
    /// How often the reset sweep runs.
    pub monitor_interval_ms: u64,
    pub batch_limit: usize,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            window_ms: 60_000,
            monitor_interval_ms: 10_000,
            batch_limit: 50,
        }
    }
}

impl HeartbeatOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepOptions {
    pub interval_ms: u64,
    pub batch_limit: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            batch_limit: 50,
        }
    }
}

impl SweepOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorPurgeOptions {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Error entries older than this are deleted.
    pub retention_ms: u64,
    pub batch_limit: usize,
}

impl Default for ErrorPurgeOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 3_600_000,
            retention_ms: 7 * 24 * 3_600_000,
            batch_limit: 50,
        }
    }
}

impl ErrorPurgeOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerOptions {
    /// Upper bound on one wait for a wake-up notification.
    pub wait_timeout_ms: u64,
    /// Idle wait when the transport has no notification channel.
    pub poll_interval_ms: u64,
    /// Number of concurrent handler tasks.
    pub workers: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5_000,
            poll_interval_ms: 1_000,
            workers: 1,
        }
    }
}

impl ConsumerOptions {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Delays applied to a failing message, one entry per retry. Once every
/// delay has been used the message goes to the error store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryRule {
    pub delays_ms: Vec<u64>,
}

impl RetryRule {
    pub fn max_retries(&self) -> usize {
        self.delays_ms.len()
    }
}

/// Application failure handling, keyed by exception type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOptions {
    /// Rule for exception types without their own entry.
    pub default: RetryRule,
    pub exceptions: HashMap<String, RetryRule>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            default: RetryRule {
                delays_ms: vec![1_000, 5_000, 30_000],
            },
            exceptions: HashMap::new(),
        }
    }
}

/// Retries of backend calls that failed with a transient error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransientRetryOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for TransientRetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl QueueOptions {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(format!("invalid queue options: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Reject combinations the chosen transport cannot honor.
    pub fn validate(&self, transport: TransportKind) -> Result<()> {
        if self.hold_transaction_until_commit && transport != TransportKind::Postgres {
            return Err(unsupported(transport, "hold_transaction_until_commit"));
        }
        if self.enable_priority && transport == TransportKind::Redis {
            return Err(unsupported(transport, "enable_priority"));
        }
        if self.id_strategy == IdStrategy::Uuid && transport == TransportKind::Postgres {
            return Err(unsupported(transport, "id_strategy = \"uuid\""));
        }
        if !self.routes.is_empty() && !self.enable_routes {
            return Err(Error::Config(
                "routes are listed but enable_routes is false".into(),
            ));
        }
        for route in &self.routes {
            validate_name(route)?;
        }

        if self.enable_heartbeat && !self.hold_transaction_until_commit {
            let hb = &self.heartbeat;
            if hb.interval_ms == 0 || hb.window_ms == 0 {
                return Err(Error::Config("heartbeat interval and window must be > 0".into()));
            }
            if hb.interval_ms >= hb.window_ms {
                return Err(Error::Config(format!(
                    "heartbeat interval ({} ms) must be shorter than the window ({} ms)",
                    hb.interval_ms, hb.window_ms
                )));
            }
        }

        let limits = [
            ("heartbeat.batch_limit", self.heartbeat.batch_limit),
            ("delayed.batch_limit", self.delayed.batch_limit),
            ("expiration.batch_limit", self.expiration.batch_limit),
            ("error_purge.batch_limit", self.error_purge.batch_limit),
            ("consumer.workers", self.consumer.workers),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be > 0")));
            }
        }
        if self.transient_retry.max_attempts == 0 {
            return Err(Error::Config("transient_retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

fn unsupported(transport: TransportKind, feature: &str) -> Error {
    Error::Unsupported {
        transport: transport.as_str(),
        feature: feature.to_string(),
    }
}

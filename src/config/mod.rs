//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Connection strings are wrapped in secrecy::SecretString to prevent log leaks.
//! Per-queue tuning lives in a TOML file, see [`QueueOptions`].

mod options;
pub mod secrets;

pub use options::{
    ConsumerOptions, ErrorPurgeOptions, HeartbeatOptions, IdStrategy, QueueOptions, RetryOptions,
    RetryRule, SweepOptions, TransientRetryOptions,
};

use std::path::PathBuf;

use crate::error::{Error, Result};
use secrecy::SecretString;

/// Which backend a process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Postgres,
    Redis,
    Memory,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Postgres => "postgres",
            TransportKind::Redis => "redis",
            TransportKind::Memory => "memory",
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(TransportKind::Postgres),
            "redis" => Ok(TransportKind::Redis),
            "memory" => Ok(TransportKind::Memory),
            other => Err(Error::Config(format!("unknown transport {other:?}"))),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Config {
    pub transport: TransportKind,
    pub database_url: Option<SecretString>,
    pub redis_url: Option<SecretString>,
    pub queue: String,
    pub options_path: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let transport: TransportKind = std::env::var("LEASEQ_TRANSPORT")
            .unwrap_or_else(|_| "postgres".to_string())
            .parse()?;

        let database_url = match transport {
            TransportKind::Postgres => Some(SecretString::from(required_var("DATABASE_URL")?)),
            _ => std::env::var("DATABASE_URL").ok().map(SecretString::from),
        };
        let redis_url = match transport {
            TransportKind::Redis => Some(SecretString::from(required_var("REDIS_URL")?)),
            _ => std::env::var("REDIS_URL").ok().map(SecretString::from),
        };

        let queue = required_var("LEASEQ_QUEUE")?;
        crate::names::validate_name(&queue)?;

        Ok(Self {
            transport,
            database_url,
            redis_url,
            queue,
            options_path: std::env::var("LEASEQ_OPTIONS").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Queue options from `LEASEQ_OPTIONS`, or defaults, validated against
    /// the selected transport.
    pub fn queue_options(&self) -> Result<QueueOptions> {
        let options = match &self.options_path {
            Some(path) => QueueOptions::from_file(path)?,
            None => QueueOptions::default(),
        };
        options.validate(self.transport)?;
        Ok(options)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

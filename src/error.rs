//! Error types for leaseq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job {job_name} already exists or already ran at this scheduled time")]
    JobAlreadyExists { job_name: String },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid message id {0:?}")]
    InvalidMessageId(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported by the {transport} transport: {feature}")]
    Unsupported {
        transport: &'static str,
        feature: String,
    },

    /// The backend returned something its atomic primitives should have made
    /// impossible. Never retried.
    #[error("queue invariant violated: {0}")]
    InvariantViolation(String),

    /// One route group of a batch send failed; carried by each of its
    /// positions. The other groups are unaffected.
    #[error("batch group failed: {message}")]
    BatchFailed { message: String, transient: bool },

    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Postgres SQLSTATE codes that are safe to retry as-is.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57P01", // admin_shutdown
    "08000", // connection_exception
    "08003", // connection_does_not_exist
    "08006", // connection_failure
];

impl Error {
    /// Whether the error is a transient backend condition (deadlock, timeout,
    /// dropped connection) that the retry policy may re-run.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Postgres(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code)),
                _ => false,
            },
            Error::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout() || e.is_cluster_error()
            }
            Error::Io(_) => true,
            Error::BatchFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Copy of this error for every position of a failed batch group.
    pub(crate) fn for_batch_group(&self) -> Self {
        Error::BatchFailed {
            message: self.to_string(),
            transient: self.is_transient(),
        }
    }

    pub(crate) fn unprocessed_batch_position() -> Self {
        Error::BatchFailed {
            message: "message not processed".into(),
            transient: false,
        }
    }

    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

//! Background maintenance loops.
//!
//! Every sweep has the same shape: sleep for its interval, then run one
//! batch after another until a batch affects no rows, then sleep again.
//! Cancellation is observed between batches, never inside one.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::policy::TransientRetry;
use crate::telemetry::metrics;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Return working messages with a stale heartbeat to pending.
    Heartbeat,
    /// Promote due delayed messages.
    Delayed,
    /// Delete expired unclaimed messages.
    Expiration,
    /// Delete error-store entries past their retention.
    Errors,
}

impl SweepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::Heartbeat => "heartbeat",
            SweepKind::Delayed => "delayed",
            SweepKind::Expiration => "expiration",
            SweepKind::Errors => "errors",
        }
    }
}

impl std::fmt::Display for SweepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

pub struct Sweeper<T: Transport> {
    transport: Arc<T>,
    kind: SweepKind,
    interval: Duration,
    batch_limit: usize,
    transient: TransientRetry,
}

impl<T: Transport> Sweeper<T> {
    /// A sweeper with the interval and batch limit from the transport's options.
    pub fn new(transport: Arc<T>, kind: SweepKind) -> Self {
        let options = transport.options();
        let (interval, batch_limit) = match kind {
            SweepKind::Heartbeat => (
                options.heartbeat.monitor_interval(),
                options.heartbeat.batch_limit,
            ),
            SweepKind::Delayed => (options.delayed.interval(), options.delayed.batch_limit),
            SweepKind::Expiration => (
                options.expiration.interval(),
                options.expiration.batch_limit,
            ),
            SweepKind::Errors => (
                options.error_purge.interval(),
                options.error_purge.batch_limit,
            ),
        };
        let transient = TransientRetry::from_options(&options.transient_retry);
        Self {
            transport,
            kind,
            interval,
            batch_limit,
            transient,
        }
    }

    pub fn kind(&self) -> SweepKind {
        self.kind
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn batch(&self) -> Result<u64> {
        let options = self.transport.options();
        let limit = self.batch_limit;
        let t = &self.transport;
        match self.kind {
            SweepKind::Heartbeat => {
                let window = options.heartbeat.window();
                self.transient
                    .run("reset_heartbeats", || t.reset_heartbeats(window, limit))
                    .await
            }
            SweepKind::Delayed => {
                self.transient
                    .run("promote_delayed", || t.promote_delayed(limit))
                    .await
            }
            SweepKind::Expiration => {
                self.transient
                    .run("purge_expired", || t.purge_expired(limit))
                    .await
            }
            SweepKind::Errors => {
                let retention = options.error_purge.retention();
                self.transient
                    .run("purge_errors", || t.purge_errors(retention, limit))
                    .await
            }
        }
    }

    /// Run batches until one affects no rows or `cancel` fires. Returns the
    /// total affected.
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut total = 0;
        loop {
            let affected = self.batch().await?;
            if affected > 0 {
                metrics::sweep_rows().add(
                    affected,
                    &[
                        KeyValue::new("queue", self.transport.names().queue().to_string()),
                        KeyValue::new("sweep", self.kind.as_str()),
                    ],
                );
            }
            total += affected;
            if affected == 0 || cancel.is_cancelled() {
                return Ok(total);
            }
        }
    }

    /// Sweep every interval until `cancel` fires. Errors are logged and the
    /// next round runs on schedule.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let queue = self.transport.names().queue();
        info!(
            queue,
            sweep = %self.kind,
            interval_ms = self.interval.as_millis() as u64,
            "sweeper started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.sweep(&cancel).await {
                Ok(0) => {}
                Ok(affected) => debug!(queue, sweep = %self.kind, affected, "sweep finished"),
                Err(e @ Error::InvariantViolation(_)) => {
                    error!(queue, sweep = %self.kind, error = %e, "sweeper stopping");
                    return Err(e);
                }
                Err(e) => error!(queue, sweep = %self.kind, error = %e, "sweep failed"),
            }
        }
        info!(queue, sweep = %self.kind, "sweeper stopped");
        Ok(())
    }
}

/// Every sweep the queue's options enable.
pub struct Maintenance<T: Transport> {
    sweepers: Vec<Arc<Sweeper<T>>>,
}

impl<T: Transport> Maintenance<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let options = transport.options();
        let mut kinds = Vec::new();
        // Held transactions keep the row locked; there is no lease to expire.
        if options.enable_heartbeat && !options.hold_transaction_until_commit {
            kinds.push(SweepKind::Heartbeat);
        }
        if options.enable_delayed_processing {
            kinds.push(SweepKind::Delayed);
        }
        if options.enable_message_expiration {
            kinds.push(SweepKind::Expiration);
        }
        if options.error_purge.enabled {
            kinds.push(SweepKind::Errors);
        }
        let sweepers = kinds
            .into_iter()
            .map(|kind| Arc::new(Sweeper::new(transport.clone(), kind)))
            .collect();
        Self { sweepers }
    }

    pub fn kinds(&self) -> Vec<SweepKind> {
        self.sweepers.iter().map(|s| s.kind()).collect()
    }

    /// One full sweep of every kind, in order. Used by tests and the
    /// operator binary.
    pub async fn sweep_all(&self) -> Result<Vec<(SweepKind, u64)>> {
        let cancel = CancellationToken::new();
        let mut affected = Vec::with_capacity(self.sweepers.len());
        for sweeper in &self.sweepers {
            affected.push((sweeper.kind(), sweeper.sweep(&cancel).await?));
        }
        Ok(affected)
    }

    /// Run every sweeper concurrently until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut set = JoinSet::new();
        for sweeper in &self.sweepers {
            let sweeper = Arc::clone(sweeper);
            let cancel = cancel.clone();
            set.spawn(async move { sweeper.run(cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| Error::Other(format!("sweeper panicked: {e}")));
            if let Err(e) = outcome.and_then(|r| r) {
                cancel.cancel();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

//! Lease renewal while a handler runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::Lease;
use crate::transport::Transport;

/// Background task renewing one message's lease every `interval`.
///
/// Stops on its own once a renewal reports the lease gone (the reset sweep
/// took the message back, possibly handing it to another consumer under a
/// new token). Dropping the ticker stops it.
pub struct HeartbeatTicker {
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatTicker {
    pub fn start<T: Transport>(transport: Arc<T>, lease: Lease, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(beat(transport, lease, interval, cancel.clone(), lost.clone()));
        Self {
            cancel,
            lost,
            task: Some(task),
        }
    }

    /// Whether a renewal found the message no longer leased to us.
    pub fn lease_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Stop renewing and wait for the task to finish.
    pub async fn stop(mut self) -> bool {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.lease_lost()
    }
}

impl Drop for HeartbeatTicker {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn beat<T: Transport>(
    transport: Arc<T>,
    lease: Lease,
    interval: Duration,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the dequeue already set the lease.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let id = &lease.id;
        match transport.heartbeat(&lease).await {
            Ok(true) => debug!(message_id = %id, "heartbeat renewed"),
            Ok(false) => {
                warn!(message_id = %id, "heartbeat found the lease gone, stopping");
                lost.store(true, Ordering::Release);
                return;
            }
            Err(e) => warn!(message_id = %id, error = %e, "heartbeat failed, will retry"),
        }
    }
}

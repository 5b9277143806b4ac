//! The receive loop: dequeue, run the handler, settle the message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::heartbeat::HeartbeatTicker;
use super::retry::{Decision, RetryTable};
use crate::error::{Error, Result};
use crate::model::{Failure, MessageState, ReceivedMessage, RemoveStatus, RequeueStatus};
use crate::policy::TransientRetry;
use crate::routes::RouteRotation;
use crate::telemetry::message::{record_outcome, record_state_transition, start_message_span};
use crate::telemetry::metrics;
use crate::transport::{
    Delivery, MessageHandle, ReceiveRequest, Received, Subscription, Transport,
};

/// User code run for each delivered message.
///
/// The handle gives access to the backend's per-message state; in held
/// transaction mode that is the open database transaction, so handler writes
/// commit or roll back together with the message.
#[async_trait]
pub trait MessageHandler<T: Transport>: Send + Sync + 'static {
    async fn handle(
        &self,
        message: &ReceivedMessage,
        handle: &mut T::Handle,
    ) -> std::result::Result<(), Failure>;
}

/// What one [`Consumer::process_next`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Committed,
    Requeued,
    Delayed(Duration),
    Errored,
    /// The message was already gone when we tried to settle it.
    Lost,
    Expired,
    Poisoned,
    /// Nothing was ready.
    Idle,
}

impl Processed {
    fn label(self) -> &'static str {
        match self {
            Processed::Committed => "committed",
            Processed::Requeued => "requeued",
            Processed::Delayed(_) => "delayed",
            Processed::Errored => "errored",
            Processed::Lost => "lost",
            Processed::Expired => "expired",
            Processed::Poisoned => "poisoned",
            Processed::Idle => "idle",
        }
    }
}

pub struct Consumer<T: Transport, H> {
    transport: Arc<T>,
    handler: Arc<H>,
    routes: RouteRotation,
    retry: RetryTable,
    transient: TransientRetry,
}

impl<T: Transport, H: MessageHandler<T>> Consumer<T, H> {
    /// Consumer over the routes configured in the transport's options.
    pub fn new(transport: Arc<T>, handler: Arc<H>) -> Self {
        let options = transport.options();
        let routes = RouteRotation::new(options.routes.clone());
        let retry = RetryTable::from_options(&options.retry);
        let transient = TransientRetry::from_options(&options.transient_retry);
        Self {
            transport,
            handler,
            routes,
            retry,
            transient,
        }
    }

    pub fn with_routes(mut self, routes: Vec<String>) -> Self {
        self.routes = RouteRotation::new(routes);
        self
    }

    pub fn with_retry_table(mut self, retry: RetryTable) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transient_retry(mut self, transient: TransientRetry) -> Self {
        self.transient = transient;
        self
    }

    fn queue(&self) -> &str {
        self.transport.names().queue()
    }

    fn request(&self) -> ReceiveRequest {
        if self.routes.is_empty() {
            ReceiveRequest::untagged()
        } else {
            ReceiveRequest::routes(self.routes.order())
        }
    }

    /// Receive and settle at most one message.
    pub async fn process_next(&self) -> Result<Processed> {
        let request = self.request();
        let received = self
            .transient
            .run("receive", || self.transport.receive(&request))
            .await?;

        let processed = match received {
            Received::Empty => return Ok(Processed::Idle),
            Received::Expired(id) => {
                debug!(queue = self.queue(), message_id = %id, "dropping expired message");
                self.transient
                    .run("remove", || self.transport.remove(&id))
                    .await?;
                Processed::Expired
            }
            Received::Poison { mut handle, reason } => {
                warn!(queue = self.queue(), %reason, "poison message, moving to error store");
                match self
                    .move_to_error(&mut handle, &Failure::poison(reason))
                    .await?
                {
                    RemoveStatus::Removed => Processed::Poisoned,
                    RemoveStatus::NotFound => Processed::Lost,
                }
            }
            Received::Message(delivery) => {
                self.record_received("message");
                self.process(delivery).await?
            }
        };

        if matches!(processed, Processed::Expired | Processed::Poisoned) {
            self.record_received(processed.label());
        }
        if !matches!(processed, Processed::Expired) {
            metrics::messages_finished().add(
                1,
                &[
                    KeyValue::new("queue", self.queue().to_string()),
                    KeyValue::new("outcome", processed.label()),
                ],
            );
        }
        Ok(processed)
    }

    fn record_received(&self, outcome: &'static str) {
        metrics::messages_received().add(
            1,
            &[
                KeyValue::new("queue", self.queue().to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    async fn process(&self, delivery: Delivery<T::Handle>) -> Result<Processed> {
        let Delivery {
            message,
            mut handle,
        } = delivery;
        let span = start_message_span(self.queue(), &message.id, &message.correlation_id);
        record_state_transition(&span, MessageState::Pending, MessageState::Working);
        let scope = span.clone();

        async move {
            let options = self.transport.options();
            let ticker = (options.enable_heartbeat && !options.hold_transaction_until_commit)
                .then(|| {
                    HeartbeatTicker::start(
                        self.transport.clone(),
                        handle.lease().clone(),
                        options.heartbeat.interval(),
                    )
                });

            let started = Instant::now();
            let result = self.handler.handle(&message, &mut handle).await;
            metrics::handler_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("queue", self.queue().to_string())],
            );

            let lease_lost = match ticker {
                Some(ticker) => ticker.stop().await,
                None => false,
            };
            if lease_lost {
                warn!(message_id = %message.id, "lease lost while the handler ran");
            }

            let processed = match result {
                Ok(()) => match self.commit(&mut handle).await? {
                    RemoveStatus::Removed => Processed::Committed,
                    RemoveStatus::NotFound => Processed::Lost,
                },
                Err(failure) => self.settle_failure(handle, &message, failure, &span).await?,
            };
            record_outcome(&span, processed.label());
            debug!(outcome = processed.label(), "message settled");
            Ok(processed)
        }
        .instrument(scope)
        .await
    }

    async fn settle_failure(
        &self,
        mut handle: T::Handle,
        message: &ReceivedMessage,
        failure: Failure,
        span: &Span,
    ) -> Result<Processed> {
        warn!(
            exception_type = %failure.exception_type,
            error = %failure.message,
            "handler failed"
        );
        let count = self
            .transient
            .run("record_failure", || {
                self.transport
                    .record_failure(&message.id, &failure.exception_type)
            })
            .await?;

        match self.retry.decide(&failure.exception_type, count) {
            Decision::Retry(delay) => {
                let delay = (!delay.is_zero()
                    && self.transport.options().enable_delayed_processing)
                    .then_some(delay);
                match self.rollback(&mut handle, delay).await? {
                    RequeueStatus::Requeued => match delay {
                        Some(d) => {
                            record_state_transition(span, MessageState::Working, MessageState::Delayed);
                            Ok(Processed::Delayed(d))
                        }
                        None => {
                            record_state_transition(span, MessageState::Working, MessageState::Pending);
                            Ok(Processed::Requeued)
                        }
                    },
                    RequeueStatus::NotFound => Ok(Processed::Lost),
                }
            }
            Decision::Error => {
                info!(
                    exception_type = %failure.exception_type,
                    retries = count.unwrap_or_default(),
                    "retries exhausted, moving to error store"
                );
                match self.move_to_error(&mut handle, &failure).await? {
                    RemoveStatus::Removed => {
                        record_state_transition(span, MessageState::Working, MessageState::Error);
                        Ok(Processed::Errored)
                    }
                    RemoveStatus::NotFound => Ok(Processed::Lost),
                }
            }
            Decision::NoAction => {
                debug!("message vanished before its failure was recorded");
                drop(handle);
                Ok(Processed::Lost)
            }
        }
    }

    // Settle calls lend the handle to each attempt, so they retry through
    // `TransientRetry::backoff` rather than `run`.

    async fn commit(&self, handle: &mut T::Handle) -> Result<RemoveStatus> {
        let mut attempt = 1;
        loop {
            let error = match self.transport.commit(handle).await {
                Ok(status) => return Ok(status),
                Err(e) => e,
            };
            if !self.transient.backoff("commit", attempt, &error).await {
                return Err(error);
            }
            attempt += 1;
        }
    }

    async fn rollback(
        &self,
        handle: &mut T::Handle,
        delay: Option<Duration>,
    ) -> Result<RequeueStatus> {
        let mut attempt = 1;
        loop {
            let error = match self.transport.rollback(handle, delay).await {
                Ok(status) => return Ok(status),
                Err(e) => e,
            };
            if !self.transient.backoff("rollback", attempt, &error).await {
                return Err(error);
            }
            attempt += 1;
        }
    }

    async fn move_to_error(
        &self,
        handle: &mut T::Handle,
        failure: &Failure,
    ) -> Result<RemoveStatus> {
        let mut attempt = 1;
        loop {
            let error = match self.transport.move_to_error(handle, failure).await {
                Ok(status) => return Ok(status),
                Err(e) => e,
            };
            if !self.transient.backoff("move_to_error", attempt, &error).await {
                return Err(error);
            }
            attempt += 1;
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Waits on the transport's notification subscription between empty
    /// receives, bounded by the wait timeout, and polls when no subscription
    /// is available. Backend errors are logged and retried after the poll
    /// interval; invariant violations stop the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut subscription = self.open_subscription().await;
        info!(queue = self.queue(), transport = self.transport.kind(), "consumer started");

        while !cancel.is_cancelled() {
            match self.process_next().await {
                Ok(Processed::Idle) => self.idle(&mut subscription, &cancel).await,
                Ok(_) => {}
                Err(e @ Error::InvariantViolation(_)) => {
                    error!(queue = self.queue(), error = %e, "consumer stopping");
                    return Err(e);
                }
                Err(e) => {
                    error!(queue = self.queue(), error = %e, "receive loop error");
                    self.pause(&cancel).await;
                }
            }
        }

        info!(queue = self.queue(), "consumer stopped");
        Ok(())
    }

    /// Run `consumer.workers` loops concurrently until `cancel` fires.
    pub async fn run_workers(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let workers = self.transport.options().consumer.workers.max(1);
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let consumer = Arc::clone(&self);
            let cancel = cancel.clone();
            set.spawn(async move { consumer.run(cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| Error::Other(format!("worker panicked: {e}")));
            if let Err(e) = outcome.and_then(|r| r) {
                cancel.cancel();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn open_subscription(&self) -> Option<T::Subscription> {
        match self.transport.subscribe().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(queue = self.queue(), error = %e, "no notification subscription, polling");
                None
            }
        }
    }

    async fn idle(&self, subscription: &mut Option<T::Subscription>, cancel: &CancellationToken) {
        let consumer = &self.transport.options().consumer;
        let Some(active) = subscription.as_mut() else {
            self.pause(cancel).await;
            *subscription = self.open_subscription().await;
            return;
        };
        let woke = tokio::select! {
            _ = cancel.cancelled() => return,
            woke = active.wait(consumer.wait_timeout()) => woke,
        };
        match woke {
            Ok(true) => debug!(queue = self.queue(), "woken by notification"),
            Ok(false) => {}
            Err(e) => {
                warn!(queue = self.queue(), error = %e, "subscription failed, polling");
                *subscription = None;
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        let poll = self.transport.options().consumer.poll_interval();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

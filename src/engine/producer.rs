//! Sending side.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{NewMessage, SentMessage};
use crate::policy::TransientRetry;
use crate::telemetry::metrics;
use crate::transport::Transport;

/// Sends messages through a transport, retrying transient backend errors.
///
/// A retried send may enqueue the message twice when the first attempt
/// committed before the connection dropped; consumers see at-least-once
/// delivery either way.
pub struct Producer<T: Transport> {
    transport: Arc<T>,
    transient: TransientRetry,
}

impl<T: Transport> Producer<T> {
    pub fn new(transport: Arc<T>) -> Self {
        let transient = TransientRetry::from_options(&transport.options().transient_retry);
        Self {
            transport,
            transient,
        }
    }

    pub fn with_transient_retry(mut self, transient: TransientRetry) -> Self {
        self.transient = transient;
        self
    }

    pub async fn send(&self, message: NewMessage) -> Result<SentMessage> {
        let result = self
            .transient
            .run("send", || self.transport.send(message.clone()))
            .await;
        self.record(&result);
        if let Ok(sent) = &result {
            debug!(
                queue = self.transport.names().queue(),
                message_id = %sent.id,
                correlation_id = %sent.correlation_id,
                "message sent"
            );
        }
        result
    }

    /// Send a batch. Each route group is one atomic unit; the returned
    /// results are in input order.
    ///
    /// Only positions whose group failed with a transient error are sent
    /// again, so groups that already committed are not duplicated.
    pub async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<Result<SentMessage>>> {
        let mut results: Vec<Option<Result<SentMessage>>> =
            (0..messages.len()).map(|_| None).collect();
        let mut positions: Vec<usize> = (0..messages.len()).collect();
        let mut attempt = 1;

        loop {
            let batch = positions.iter().map(|&i| messages[i].clone()).collect();
            let sent = match self.transport.send_batch(batch).await {
                Ok(sent) => sent,
                Err(e) => {
                    if !self.transient.backoff("send_batch", attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                    continue;
                }
            };

            let mut failed = Vec::new();
            for (&i, result) in positions.iter().zip(sent) {
                if matches!(&result, Err(e) if e.is_transient()) {
                    failed.push(i);
                }
                results[i] = Some(result);
            }
            let again = match failed.first().and_then(|&i| results[i].as_ref()) {
                Some(Err(e)) => self.transient.backoff("send_batch", attempt, e).await,
                _ => false,
            };
            if !again {
                break;
            }
            debug!(
                queue = self.transport.names().queue(),
                positions = failed.len(),
                "re-sending failed batch positions"
            );
            positions = failed;
            attempt += 1;
        }

        let results: Vec<Result<SentMessage>> = results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::unprocessed_batch_position())))
            .collect();
        for result in &results {
            self.record(result);
        }
        Ok(results)
    }

    fn record(&self, result: &Result<SentMessage>) {
        let label = match result {
            Ok(_) => "ok",
            Err(Error::JobAlreadyExists { .. }) => "duplicate_job",
            Err(e) => {
                warn!(queue = self.transport.names().queue(), error = %e, "send failed");
                "error"
            }
        };
        metrics::messages_sent().add(
            1,
            &[
                KeyValue::new("queue", self.transport.names().queue().to_string()),
                KeyValue::new("result", label),
            ],
        );
    }
}

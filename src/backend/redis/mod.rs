//! Redis transport.
//!
//! Every transition is one Lua script (see [`scripts`]). Keys carry the
//! `{queue}` hash tag so one queue lives in one cluster slot. Wake-ups are
//! published on the queue's notification channel.

mod scripts;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSub};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, epoch_millis, from_epoch_millis, to_delta};
use crate::config::{IdStrategy, QueueOptions, TransportKind};
use crate::error::{Error, Result};
use crate::model::{
    Failure, Lease, MessageId, MessageState, NewMessage, QueueCounts, ReceivedMessage,
    RemoveStatus, RequeueStatus, SentMessage,
};
use crate::names::{QueueNames, RedisKeys};
use crate::serializer::{HeaderSerializer, JsonHeaderSerializer};
use crate::transport::{
    Delivery, MessageHandle, ReceiveRequest, Received, Subscription, Transport, check_message,
    group_by_route,
};
use scripts::{DELAYED, ERROR, PENDING, SEND_STRIDE, Scripts, WORKING};

const KIND: &str = "redis";

/// Per-message metadata, stored as JSON in the meta hash.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    correlation_id: Uuid,
    route: Option<String>,
    enqueued_at_ms: i64,
    expire_at_ms: Option<i64>,
}

/// Error payload stored in the error hash.
#[derive(Debug, Serialize)]
struct StoredFailure<'a> {
    exception_type: &'a str,
    message: &'a str,
    failed_at_ms: i64,
}

/// Dequeue reply: id, outcome, body, headers, meta.
type DequeueReply = (String, String, Option<Vec<u8>>, Option<Vec<u8>>, Option<String>);

#[derive(Debug)]
pub struct RedisHandle {
    lease: Lease,
}

impl MessageHandle for RedisHandle {
    fn lease(&self) -> &Lease {
        &self.lease
    }
}

pub struct RedisSubscription {
    pubsub: PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let mut messages = self.pubsub.on_message();
        match tokio::time::timeout(timeout, messages.next()).await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Err(Error::Other("redis subscription closed".into())),
            Err(_) => Ok(false),
        }
    }
}

pub struct RedisTransport {
    client: redis::Client,
    conn: ConnectionManager,
    names: QueueNames,
    keys: RedisKeys,
    scripts: Scripts,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    serializer: Arc<dyn HeaderSerializer>,
}

impl RedisTransport {
    pub async fn connect(url: &str, queue: &str, options: QueueOptions) -> Result<Self> {
        options.validate(TransportKind::Redis)?;
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let names = QueueNames::new(queue)?;
        let keys = names.keys();
        Ok(Self {
            client,
            conn,
            names,
            keys,
            scripts: Scripts::new(),
            options,
            clock: Arc::new(SystemClock),
            serializer: Arc::new(JsonHeaderSerializer),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn HeaderSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    fn now_ms(&self) -> i64 {
        epoch_millis(self.clock.now())
    }

    fn pending_for(&self, route: Option<&str>) -> String {
        self.keys.pending_for(route)
    }

    fn tracking_prefix(&self) -> String {
        format!("{}:", self.keys.error_tracking)
    }

    fn route_prefix(&self) -> &str {
        &self.keys.pending_route_prefix
    }

    /// Send one route group in one script call.
    async fn send_group(
        &self,
        messages: &[&NewMessage],
        route: Option<&str>,
    ) -> Result<Vec<SentMessage>> {
        let now = self.clock.now();
        let k = &self.keys;
        let mut invocation = self.scripts.send.prepare_invoke();
        invocation
            .key(self.pending_for(route))
            .key(&k.values)
            .key(&k.headers)
            .key(&k.meta)
            .key(&k.delayed)
            .key(&k.expiration)
            .key(&k.status)
            .key(&k.id)
            .key(&k.job_names)
            .key(&k.job_id_names)
            .key(&k.job_event_times)
            .key(&k.route)
            .arg(messages.len())
            .arg(route.unwrap_or(""))
            .arg(&k.notification);

        let mut correlation_ids = Vec::with_capacity(messages.len());
        for message in messages {
            check_message(KIND, &self.options, message)?;
            let id = match self.options.id_strategy {
                IdStrategy::Incrementing => String::new(),
                IdStrategy::Uuid => Uuid::new_v4().to_string(),
            };
            let meta = serde_json::to_string(&StoredMeta {
                correlation_id: message.correlation_id,
                route: message.route.clone(),
                enqueued_at_ms: epoch_millis(now),
                expire_at_ms: message.expire_at.map(epoch_millis),
            })?;
            let due = message
                .delay
                .map(|d| epoch_millis(now + to_delta(d)))
                .unwrap_or(0);
            let expire = message.expire_at.map(epoch_millis).unwrap_or(0);
            let (job, job_at) = match &message.job {
                Some(job) => (job.name.as_str(), epoch_millis(job.scheduled_at)),
                None => ("", 0),
            };
            invocation
                .arg(id)
                .arg(&message.body)
                .arg(self.serializer.serialize(&message.headers)?)
                .arg(meta)
                .arg(due)
                .arg(expire)
                .arg(job)
                .arg(job_at);
            correlation_ids.push(message.correlation_id);
        }

        tracing::trace!(
            queue = self.names.queue(),
            messages = messages.len(),
            args = 3 + messages.len() * SEND_STRIDE,
            "invoking send script"
        );
        let reply: Vec<String> = invocation.invoke_async(&mut self.conn.clone()).await?;
        match reply.split_first() {
            Some((tag, ids)) if tag == "ok" && ids.len() == messages.len() => ids
                .iter()
                .zip(correlation_ids)
                .map(|(id, correlation_id)| {
                    Ok(SentMessage {
                        id: id.parse()?,
                        correlation_id,
                    })
                })
                .collect(),
            Some((tag, rest)) if tag == "job" => Err(Error::JobAlreadyExists {
                job_name: rest.first().cloned().unwrap_or_default(),
            }),
            _ => Err(Error::InvariantViolation(format!(
                "unexpected send reply {reply:?}"
            ))),
        }
    }

    async fn dequeue(
        &self,
        list: String,
        id: Option<&MessageId>,
        token: Uuid,
    ) -> Result<Option<DequeueReply>> {
        let k = &self.keys;
        let reply: Option<DequeueReply> = self
            .scripts
            .dequeue
            .key(list)
            .key(&k.working)
            .key(&k.values)
            .key(&k.headers)
            .key(&k.meta)
            .key(&k.expiration)
            .key(&k.status)
            .key(&k.route)
            .key(&k.leases)
            .arg(self.now_ms())
            .arg(id.map(|i| i.to_string()).unwrap_or_default())
            .arg(self.route_prefix())
            .arg(token.to_string())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(reply)
    }

    fn deliver(&self, reply: DequeueReply, token: Uuid) -> Result<Received<RedisHandle>> {
        let (raw_id, outcome, body, headers, meta) = reply;
        let id: MessageId = raw_id.parse()?;
        if outcome == "expired" {
            return Ok(Received::Expired(id));
        }
        let handle = RedisHandle {
            lease: Lease {
                id: id.clone(),
                token,
            },
        };
        let poison = |handle, reason: String| Ok(Received::Poison { handle, reason });

        let Some(body) = body else {
            return poison(handle, "body is missing".into());
        };
        let meta: StoredMeta = match meta.as_deref().map(serde_json::from_str) {
            Some(Ok(meta)) => meta,
            Some(Err(e)) => return poison(handle, format!("metadata: {e}")),
            None => return poison(handle, "metadata is missing".into()),
        };
        let headers = match self
            .serializer
            .deserialize(headers.as_deref().unwrap_or_default())
        {
            Ok(h) => h,
            Err(e) => return poison(handle, format!("headers: {e}")),
        };

        Ok(Received::Message(Delivery {
            message: ReceivedMessage {
                id,
                body,
                headers,
                correlation_id: meta.correlation_id,
                route: meta.route,
                priority: None,
                enqueued_at: from_epoch_millis(meta.enqueued_at_ms),
                expire_at: meta.expire_at_ms.map(from_epoch_millis),
            },
            handle,
        }))
    }

    async fn batch_sweep(
        &self,
        script: &redis::Script,
        keys: &[&str],
        args: Vec<String>,
    ) -> Result<u64> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let moved: i64 = invocation.invoke_async(&mut self.conn.clone()).await?;
        Ok(moved.max(0) as u64)
    }

    /// Run the remove script. With a lease, only the holder of that lease
    /// can delete the message.
    async fn delete(&self, id: &MessageId, lease: Option<&Lease>) -> Result<RemoveStatus> {
        let k = &self.keys;
        let done: i64 = self
            .scripts
            .remove
            .key(&k.pending)
            .key(&k.working)
            .key(&k.values)
            .key(&k.headers)
            .key(&k.meta)
            .key(&k.delayed)
            .key(&k.expiration)
            .key(&k.status)
            .key(&k.route)
            .key(&k.job_names)
            .key(&k.job_id_names)
            .key(&k.leases)
            .arg(id.to_string())
            .arg(self.route_prefix())
            .arg(self.tracking_prefix())
            .arg(lease.map(|l| l.token.to_string()).unwrap_or_default())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(if done == 1 {
            RemoveStatus::Removed
        } else {
            RemoveStatus::NotFound
        })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    type Handle = RedisHandle;
    type Subscription = RedisSubscription;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn names(&self) -> &QueueNames {
        &self.names
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn install(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        for (name, script) in self.scripts.all() {
            let hash = script.prepare_invoke().load_async(&mut conn).await?;
            tracing::debug!(script = name, %hash, "lua script loaded");
        }
        tracing::info!(queue = self.names.queue(), "redis queue installed");
        Ok(())
    }

    async fn send(&self, message: NewMessage) -> Result<SentMessage> {
        let mut sent = self.send_group(&[&message], message.route_name()).await?;
        sent.pop()
            .ok_or_else(|| Error::InvariantViolation("send returned no id".into()))
    }

    async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<Result<SentMessage>>> {
        let mut results: Vec<Option<Result<SentMessage>>> =
            (0..messages.len()).map(|_| None).collect();
        for (route, positions) in group_by_route(&messages) {
            let group: Vec<&NewMessage> = positions.iter().map(|&i| &messages[i]).collect();
            match self.send_group(&group, route.as_deref()).await {
                Ok(sent) => {
                    for (&i, s) in positions.iter().zip(sent) {
                        results[i] = Some(Ok(s));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        queue = self.names.queue(),
                        error = %e,
                        transient = e.is_transient(),
                        "batch group rejected"
                    );
                    for &i in &positions {
                        results[i] = Some(Err(e.for_batch_group()));
                    }
                }
            }
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::unprocessed_batch_position())))
            .collect())
    }

    async fn subscribe(&self) -> Result<RedisSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.keys.notification).await?;
        Ok(RedisSubscription { pubsub })
    }

    async fn receive(&self, request: &ReceiveRequest) -> Result<Received<RedisHandle>> {
        let token = Uuid::new_v4();
        if let Some(id) = &request.message_id {
            return match self.dequeue(self.pending_for(None), Some(id), token).await? {
                Some(reply) => self.deliver(reply, token),
                None => Ok(Received::Empty),
            };
        }
        let lists: Vec<String> = if request.routes.is_empty() {
            vec![self.pending_for(None)]
        } else {
            request
                .routes
                .iter()
                .map(|r| self.pending_for(Some(r)))
                .collect()
        };
        for list in lists {
            if let Some(reply) = self.dequeue(list, None, token).await? {
                return self.deliver(reply, token);
            }
        }
        Ok(Received::Empty)
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<bool> {
        let renewed: i64 = self
            .scripts
            .heartbeat
            .key(&self.keys.working)
            .key(&self.keys.leases)
            .arg(self.now_ms())
            .arg(lease.id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(renewed == 1)
    }

    async fn commit(&self, handle: &mut RedisHandle) -> Result<RemoveStatus> {
        self.delete(&handle.lease.id, Some(&handle.lease)).await
    }

    async fn rollback(
        &self,
        handle: &mut RedisHandle,
        delay: Option<Duration>,
    ) -> Result<RequeueStatus> {
        let due = delay
            .filter(|d| !d.is_zero())
            .map(|d| epoch_millis(self.clock.now() + to_delta(d)))
            .unwrap_or(0);
        let k = &self.keys;
        let done: i64 = self
            .scripts
            .rollback
            .key(&k.working)
            .key(&k.delayed)
            .key(&k.pending)
            .key(&k.route)
            .key(&k.status)
            .key(&k.leases)
            .arg(handle.lease.id.to_string())
            .arg(due)
            .arg(self.route_prefix())
            .arg(&k.notification)
            .arg(handle.lease.token.to_string())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(if done == 1 {
            RequeueStatus::Requeued
        } else {
            RequeueStatus::NotFound
        })
    }

    async fn record_failure(&self, id: &MessageId, exception_type: &str) -> Result<Option<u32>> {
        let count: Option<i64> = self
            .scripts
            .record_failure
            .key(&self.keys.status)
            .arg(id.to_string())
            .arg(exception_type)
            .arg(self.tracking_prefix())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(count.map(|c| c.max(0) as u32))
    }

    async fn move_to_error(
        &self,
        handle: &mut RedisHandle,
        failure: &Failure,
    ) -> Result<RemoveStatus> {
        let now = self.now_ms();
        let payload = serde_json::to_string(&StoredFailure {
            exception_type: &failure.exception_type,
            message: &failure.message,
            failed_at_ms: now,
        })?;
        let k = &self.keys;
        let done: i64 = self
            .scripts
            .move_to_error
            .key(&k.working)
            .key(&k.error)
            .key(&k.error_time)
            .key(&k.status)
            .key(&k.expiration)
            .key(&k.job_names)
            .key(&k.job_id_names)
            .key(&k.leases)
            .arg(handle.lease.id.to_string())
            .arg(payload)
            .arg(now)
            .arg(self.tracking_prefix())
            .arg(handle.lease.token.to_string())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(if done == 1 {
            RemoveStatus::Removed
        } else {
            RemoveStatus::NotFound
        })
    }

    async fn remove(&self, id: &MessageId) -> Result<RemoveStatus> {
        self.delete(id, None).await
    }

    async fn reset_heartbeats(&self, window: Duration, limit: usize) -> Result<u64> {
        let threshold = epoch_millis(self.clock.now() - to_delta(window));
        let k = &self.keys;
        self.batch_sweep(
            &self.scripts.reset_heartbeats,
            &[&k.working, &k.pending, &k.route, &k.status, &k.leases],
            vec![
                threshold.to_string(),
                limit.to_string(),
                self.route_prefix().to_string(),
                k.notification.clone(),
            ],
        )
        .await
    }

    async fn promote_delayed(&self, limit: usize) -> Result<u64> {
        let k = &self.keys;
        self.batch_sweep(
            &self.scripts.promote_delayed,
            &[&k.delayed, &k.pending, &k.route, &k.status],
            vec![
                self.now_ms().to_string(),
                limit.to_string(),
                self.route_prefix().to_string(),
                k.notification.clone(),
            ],
        )
        .await
    }

    async fn purge_expired(&self, limit: usize) -> Result<u64> {
        let k = &self.keys;
        self.batch_sweep(
            &self.scripts.purge_expired,
            &[
                &k.expiration,
                &k.delayed,
                &k.pending,
                &k.route,
                &k.status,
                &k.values,
                &k.headers,
                &k.meta,
                &k.job_names,
                &k.job_id_names,
            ],
            vec![
                self.now_ms().to_string(),
                limit.to_string(),
                self.route_prefix().to_string(),
                self.tracking_prefix(),
            ],
        )
        .await
    }

    async fn purge_errors(&self, retention: Duration, limit: usize) -> Result<u64> {
        let threshold = epoch_millis(self.clock.now() - to_delta(retention));
        let k = &self.keys;
        self.batch_sweep(
            &self.scripts.purge_errors,
            &[
                &k.error_time,
                &k.error,
                &k.values,
                &k.headers,
                &k.meta,
                &k.status,
                &k.route,
            ],
            vec![threshold.to_string(), limit.to_string()],
        )
        .await
    }

    async fn state_of(&self, id: &MessageId) -> Result<Option<MessageState>> {
        let code: Option<String> = self
            .conn
            .clone()
            .hget(&self.keys.status, id.to_string())
            .await?;
        Ok(match code.as_deref() {
            None => None,
            Some(PENDING) => Some(MessageState::Pending),
            Some(WORKING) => Some(MessageState::Working),
            Some(ERROR) => Some(MessageState::Error),
            Some(DELAYED) => Some(MessageState::Delayed),
            Some(other) => {
                return Err(Error::InvariantViolation(format!(
                    "unknown status {other:?} for message {id}"
                )));
            }
        })
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let counts: Vec<u64> = self
            .scripts
            .counts
            .key(&self.keys.status)
            .invoke_async(&mut self.conn.clone())
            .await?;
        match counts.as_slice() {
            [pending, working, error, delayed] => Ok(QueueCounts {
                pending: *pending,
                working: *working,
                error: *error,
                delayed: *delayed,
            }),
            other => Err(Error::InvariantViolation(format!(
                "unexpected counts reply {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_meta_is_plain_json() {
        let meta = StoredMeta {
            correlation_id: Uuid::nil(),
            route: Some("eu".into()),
            enqueued_at_ms: 1_700_000_000_000,
            expire_at_ms: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: StoredMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.route.as_deref(), Some("eu"));
        assert_eq!(back.enqueued_at_ms, 1_700_000_000_000);
    }
}

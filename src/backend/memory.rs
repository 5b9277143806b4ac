//! In-process transport.
//!
//! Same collections as the Redis layout (per-route pending lists, a working
//! set with lease times, a delayed set, an error store), guarded by one
//! mutex. Each operation is a single critical section, which gives it the
//! atomicity a Lua script has on the server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, to_delta};
use crate::config::{IdStrategy, QueueOptions, TransportKind};
use crate::error::{Error, Result};
use crate::model::{
    Failure, Lease, MessageId, MessageState, NewMessage, QueueCounts, ReceivedMessage,
    RemoveStatus, RequeueStatus, SentMessage,
};
use crate::names::QueueNames;
use crate::serializer::{HeaderSerializer, JsonHeaderSerializer};
use crate::transport::{
    Delivery, MessageHandle, ReceiveRequest, Received, Subscription, Transport, check_message,
    group_by_route,
};

const KIND: &str = "memory";

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    headers: Vec<u8>,
    correlation_id: Uuid,
    route: Option<String>,
    priority: Option<i16>,
    enqueued_at: DateTime<Utc>,
    expire_at: Option<DateTime<Utc>>,
    job_name: Option<String>,
    state: MessageState,
    /// Lease time while working.
    heartbeat: Option<DateTime<Utc>>,
    lease: Option<Uuid>,
    /// Visibility time while delayed.
    due_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ErrorEntry {
    body: Vec<u8>,
    failure: Failure,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    messages: HashMap<MessageId, Stored>,
    pending: HashMap<Option<String>, VecDeque<MessageId>>,
    errors: HashMap<MessageId, ErrorEntry>,
    tracking: HashMap<(MessageId, String), u32>,
    active_jobs: HashMap<String, MessageId>,
    job_times: HashMap<String, DateTime<Utc>>,
}

impl State {
    fn allocate_id(&mut self, strategy: IdStrategy) -> MessageId {
        match strategy {
            IdStrategy::Incrementing => {
                self.next_id += 1;
                MessageId::Sequence(self.next_id)
            }
            IdStrategy::Uuid => MessageId::Uuid(Uuid::new_v4()),
        }
    }

    fn admit(&self, message: &NewMessage) -> Result<()> {
        if let Some(job) = &message.job {
            let ran_at_same_time = self.job_times.get(&job.name) == Some(&job.scheduled_at);
            if self.active_jobs.contains_key(&job.name) || ran_at_same_time {
                return Err(Error::JobAlreadyExists {
                    job_name: job.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Insert an admitted message. Returns whether it went straight to pending.
    fn insert(
        &mut self,
        message: NewMessage,
        headers: Vec<u8>,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> bool {
        let due_at = message.delay.map(|d| now + to_delta(d));
        let state = if due_at.is_some() {
            MessageState::Delayed
        } else {
            MessageState::Pending
        };
        if let Some(job) = &message.job {
            self.active_jobs.insert(job.name.clone(), id.clone());
            self.job_times.insert(job.name.clone(), job.scheduled_at);
        }
        if state == MessageState::Pending {
            self.pending
                .entry(message.route.clone())
                .or_default()
                .push_back(id.clone());
        }
        self.messages.insert(
            id,
            Stored {
                body: message.body,
                headers,
                correlation_id: message.correlation_id,
                route: message.route,
                priority: message.priority,
                enqueued_at: now,
                expire_at: message.expire_at,
                job_name: message.job.map(|j| j.name),
                state,
                heartbeat: None,
                lease: None,
                due_at,
            },
        );
        state == MessageState::Pending
    }

    fn pop_pending(&mut self, route: Option<&str>, by_priority: bool) -> Option<MessageId> {
        let list = self.pending.get_mut(&route.map(str::to_string))?;
        if !by_priority {
            return list.pop_front();
        }
        let messages = &self.messages;
        let rank = |id: &MessageId| messages.get(id).and_then(|m| m.priority).unwrap_or(0);
        let mut best: Option<(usize, i16)> = None;
        for (i, id) in list.iter().enumerate() {
            let p = rank(id);
            if best.is_none_or(|(_, b)| p > b) {
                best = Some((i, p));
            }
        }
        list.remove(best?.0)
    }

    fn take_pending(&mut self, id: &MessageId) -> Option<MessageId> {
        let route = match self.messages.get(id) {
            Some(m) if m.state == MessageState::Pending => m.route.clone(),
            _ => return None,
        };
        let list = self.pending.get_mut(&route)?;
        let pos = list.iter().position(|p| p == id)?;
        list.remove(pos)
    }

    /// Put a message back at the head of its route's pending list.
    fn requeue(&mut self, id: &MessageId) {
        if let Some(m) = self.messages.get_mut(id) {
            m.state = MessageState::Pending;
            m.heartbeat = None;
            m.lease = None;
            m.due_at = None;
            self.pending
                .entry(m.route.clone())
                .or_default()
                .push_front(id.clone());
        }
    }

    /// The message `lease` was issued for, if it is still working under it.
    fn leased(&mut self, lease: &Lease) -> Option<&mut Stored> {
        self.messages
            .get_mut(&lease.id)
            .filter(|m| m.state == MessageState::Working && m.lease == Some(lease.token))
    }

    /// Drop a message from every index.
    fn delete(&mut self, id: &MessageId) -> Option<Stored> {
        let stored = self.messages.remove(id)?;
        if stored.state == MessageState::Pending {
            if let Some(list) = self.pending.get_mut(&stored.route) {
                list.retain(|p| p != id);
            }
        }
        self.tracking.retain(|(tracked, _), _| tracked != id);
        if let Some(job) = &stored.job_name {
            if self.active_jobs.get(job) == Some(id) {
                self.active_jobs.remove(job);
            }
        }
        Some(stored)
    }

    /// Ids in `state` whose timestamp (picked by `at`) is before `cutoff`,
    /// oldest first, at most `limit`.
    fn due(
        &self,
        state: MessageState,
        cutoff: DateTime<Utc>,
        limit: usize,
        at: impl Fn(&Stored) -> Option<DateTime<Utc>>,
        inclusive: bool,
    ) -> Vec<MessageId> {
        let mut found: Vec<(DateTime<Utc>, MessageId)> = self
            .messages
            .iter()
            .filter(|(_, m)| m.state == state)
            .filter_map(|(id, m)| at(m).map(|t| (t, id.clone())))
            .filter(|(t, _)| if inclusive { *t <= cutoff } else { *t < cutoff })
            .collect();
        found.sort();
        found.into_iter().take(limit).map(|(_, id)| id).collect()
    }
}

/// Handle for a message leased from the in-memory transport.
#[derive(Debug)]
pub struct MemoryHandle {
    lease: Lease,
}

impl MessageHandle for MemoryHandle {
    fn lease(&self) -> &Lease {
        &self.lease
    }
}

pub struct MemorySubscription {
    rx: broadcast::Receiver<()>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Ok(())) | Ok(Err(RecvError::Lagged(_))) => Ok(true),
            Ok(Err(RecvError::Closed)) | Err(_) => Ok(false),
        }
    }
}

pub struct MemoryTransport {
    names: QueueNames,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    serializer: Arc<dyn HeaderSerializer>,
    state: Mutex<State>,
    notify: broadcast::Sender<()>,
}

impl MemoryTransport {
    pub fn new(queue: &str, options: QueueOptions) -> Result<Self> {
        options.validate(TransportKind::Memory)?;
        let (notify, _) = broadcast::channel(64);
        Ok(Self {
            names: QueueNames::new(queue)?,
            options,
            clock: Arc::new(SystemClock),
            serializer: Arc::new(JsonHeaderSerializer),
            state: Mutex::new(State::default()),
            notify,
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

    /// Body and failure of a message in the error store.
    pub fn error_record(&self, id: &MessageId) -> Option<(Vec<u8>, Failure)> {
        self.state()
            .errors
            .get(id)
            .map(|e| (e.body.clone(), e.failure.clone()))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wake(&self) {
        // No receivers is fine.
        let _ = self.notify.send(());
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Handle = MemoryHandle;
    type Subscription = MemorySubscription;

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
        Ok(())
    }

    async fn send(&self, message: NewMessage) -> Result<SentMessage> {
        check_message(KIND, &self.options, &message)?;
        let headers = self.serializer.serialize(&message.headers)?;
        let correlation_id = message.correlation_id;
        let now = self.clock.now();

        let (id, immediate) = {
            let mut state = self.state();
            state.admit(&message)?;
            let id = state.allocate_id(self.options.id_strategy);
            let immediate = state.insert(message, headers, id.clone(), now);
            (id, immediate)
        };
        if immediate {
            self.wake();
        }
        Ok(SentMessage { id, correlation_id })
    }

    async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<Result<SentMessage>>> {
        let now = self.clock.now();
        let groups = group_by_route(&messages);
        let mut slots: Vec<Option<NewMessage>> = messages.into_iter().map(Some).collect();
        let mut results: Vec<Option<Result<SentMessage>>> = (0..slots.len()).map(|_| None).collect();
        let mut any_immediate = false;

        for (_, positions) in groups {
            let group: Vec<(usize, NewMessage)> = positions
                .iter()
                .filter_map(|&i| slots[i].take().map(|m| (i, m)))
                .collect();

            let prepared: Result<Vec<(usize, NewMessage, Vec<u8>)>> = group
                .into_iter()
                .map(|(i, m)| {
                    check_message(KIND, &self.options, &m)?;
                    let headers = self.serializer.serialize(&m.headers)?;
                    Ok((i, m, headers))
                })
                .collect();

            let outcome = prepared.and_then(|prepared| {
                let mut state = self.state();
                let mut jobs = HashSet::new();
                for (_, m, _) in &prepared {
                    state.admit(m)?;
                    if let Some(job) = &m.job {
                        if !jobs.insert(job.name.clone()) {
                            return Err(Error::JobAlreadyExists {
                                job_name: job.name.clone(),
                            });
                        }
                    }
                }
                let mut sent = Vec::with_capacity(prepared.len());
                for (i, m, headers) in prepared {
                    let correlation_id = m.correlation_id;
                    let id = state.allocate_id(self.options.id_strategy);
                    any_immediate |= state.insert(m, headers, id.clone(), now);
                    sent.push((i, SentMessage { id, correlation_id }));
                }
                Ok(sent)
            });

            match outcome {
                Ok(sent) => {
                    for (i, s) in sent {
                        results[i] = Some(Ok(s));
                    }
                }
                Err(e) => {
                    tracing::warn!(queue = self.names.queue(), error = %e, "batch group rejected");
                    for &i in &positions {
                        results[i] = Some(Err(e.for_batch_group()));
                    }
                }
            }
        }

        if any_immediate {
            self.wake();
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::unprocessed_batch_position())))
            .collect())
    }

    async fn subscribe(&self) -> Result<MemorySubscription> {
        Ok(MemorySubscription {
            rx: self.notify.subscribe(),
        })
    }

    async fn receive(&self, request: &ReceiveRequest) -> Result<Received<MemoryHandle>> {
        let now = self.clock.now();
        let leased = {
            let mut state = self.state();
            let id = match &request.message_id {
                Some(id) => state.take_pending(id),
                None if request.routes.is_empty() => {
                    state.pop_pending(None, self.options.enable_priority)
                }
                None => request
                    .routes
                    .iter()
                    .find_map(|r| state.pop_pending(Some(r), self.options.enable_priority)),
            };
            let Some(id) = id else {
                return Ok(Received::Empty);
            };
            let stored = state.messages.get_mut(&id).ok_or_else(|| {
                Error::InvariantViolation(format!("pending id {id} has no message"))
            })?;
            let lease = Lease::new(id);
            stored.state = MessageState::Working;
            stored.heartbeat = Some(now);
            stored.lease = Some(lease.token);
            (lease, stored.clone())
        };

        let (lease, stored) = leased;
        let id = lease.id.clone();
        if stored.expire_at.is_some_and(|at| at <= now) {
            return Ok(Received::Expired(id));
        }
        let handle = MemoryHandle { lease };
        let headers = match self.serializer.deserialize(&stored.headers) {
            Ok(h) => h,
            Err(e) => {
                return Ok(Received::Poison {
                    handle,
                    reason: format!("headers: {e}"),
                });
            }
        };
        Ok(Received::Message(Delivery {
            message: ReceivedMessage {
                id,
                body: stored.body,
                headers,
                correlation_id: stored.correlation_id,
                route: stored.route,
                priority: stored.priority,
                enqueued_at: stored.enqueued_at,
                expire_at: stored.expire_at,
            },
            handle,
        }))
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state();
        match state.leased(lease) {
            Some(m) => {
                m.heartbeat = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit(&self, handle: &mut MemoryHandle) -> Result<RemoveStatus> {
        let mut state = self.state();
        if state.leased(&handle.lease).is_none() {
            return Ok(RemoveStatus::NotFound);
        }
        Ok(match state.delete(&handle.lease.id) {
            Some(_) => RemoveStatus::Removed,
            None => RemoveStatus::NotFound,
        })
    }

    async fn rollback(
        &self,
        handle: &mut MemoryHandle,
        delay: Option<Duration>,
    ) -> Result<RequeueStatus> {
        let now = self.clock.now();
        let immediate = {
            let mut state = self.state();
            let Some(m) = state.leased(&handle.lease) else {
                return Ok(RequeueStatus::NotFound);
            };
            match delay {
                Some(d) if !d.is_zero() => {
                    m.state = MessageState::Delayed;
                    m.heartbeat = None;
                    m.lease = None;
                    m.due_at = Some(now + to_delta(d));
                    false
                }
                _ => {
                    state.requeue(&handle.lease.id);
                    true
                }
            }
        };
        if immediate {
            self.wake();
        }
        Ok(RequeueStatus::Requeued)
    }

    async fn record_failure(&self, id: &MessageId, exception_type: &str) -> Result<Option<u32>> {
        let mut state = self.state();
        if !state.messages.contains_key(id) {
            return Ok(None);
        }
        let count = state
            .tracking
            .entry((id.clone(), exception_type.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(Some(*count))
    }

    async fn move_to_error(
        &self,
        handle: &mut MemoryHandle,
        failure: &Failure,
    ) -> Result<RemoveStatus> {
        let now = self.clock.now();
        let mut state = self.state();
        if state.leased(&handle.lease).is_none() {
            return Ok(RemoveStatus::NotFound);
        }
        let Some(message) = state.delete(&handle.lease.id) else {
            return Ok(RemoveStatus::NotFound);
        };
        state.errors.insert(
            handle.lease.id.clone(),
            ErrorEntry {
                body: message.body,
                failure: failure.clone(),
                at: now,
            },
        );
        Ok(RemoveStatus::Removed)
    }

    async fn remove(&self, id: &MessageId) -> Result<RemoveStatus> {
        Ok(match self.state().delete(id) {
            Some(_) => RemoveStatus::Removed,
            None => RemoveStatus::NotFound,
        })
    }

    async fn reset_heartbeats(&self, window: Duration, limit: usize) -> Result<u64> {
        let cutoff = self.clock.now() - to_delta(window);
        let count = {
            let mut state = self.state();
            let stale = state.due(MessageState::Working, cutoff, limit, |m| m.heartbeat, false);
            for id in &stale {
                state.requeue(id);
            }
            stale.len() as u64
        };
        if count > 0 {
            self.wake();
        }
        Ok(count)
    }

    async fn promote_delayed(&self, limit: usize) -> Result<u64> {
        let now = self.clock.now();
        let count = {
            let mut guard = self.state();
            let state = &mut *guard;
            let due = state.due(MessageState::Delayed, now, limit, |m| m.due_at, true);
            for id in &due {
                if let Some(m) = state.messages.get_mut(id) {
                    m.state = MessageState::Pending;
                    m.due_at = None;
                    let route = m.route.clone();
                    state.pending.entry(route).or_default().push_back(id.clone());
                }
            }
            due.len() as u64
        };
        if count > 0 {
            self.wake();
        }
        Ok(count)
    }

    async fn purge_expired(&self, limit: usize) -> Result<u64> {
        let now = self.clock.now();
        let mut state = self.state();
        let mut expired: Vec<(DateTime<Utc>, MessageId)> = state
            .messages
            .iter()
            .filter(|(_, m)| matches!(m.state, MessageState::Pending | MessageState::Delayed))
            .filter_map(|(id, m)| m.expire_at.filter(|at| *at <= now).map(|at| (at, id.clone())))
            .collect();
        expired.sort();
        expired.truncate(limit);
        for (_, id) in &expired {
            state.delete(id);
        }
        Ok(expired.len() as u64)
    }

    async fn purge_errors(&self, retention: Duration, limit: usize) -> Result<u64> {
        let cutoff = self.clock.now() - to_delta(retention);
        let mut state = self.state();
        let mut old: Vec<(DateTime<Utc>, MessageId)> = state
            .errors
            .iter()
            .filter(|(_, e)| e.at < cutoff)
            .map(|(id, e)| (e.at, id.clone()))
            .collect();
        old.sort();
        old.truncate(limit);
        for (_, id) in &old {
            state.errors.remove(id);
        }
        Ok(old.len() as u64)
    }

    async fn state_of(&self, id: &MessageId) -> Result<Option<MessageState>> {
        let state = self.state();
        if let Some(m) = state.messages.get(id) {
            return Ok(Some(m.state));
        }
        Ok(state.errors.contains_key(id).then_some(MessageState::Error))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state();
        let mut counts = QueueCounts {
            error: state.errors.len() as u64,
            ..Default::default()
        };
        for m in state.messages.values() {
            match m.state {
                MessageState::Pending => counts.pending += 1,
                MessageState::Working => counts.working += 1,
                MessageState::Delayed => counts.delayed += 1,
                MessageState::Error => counts.error += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn transport(options: QueueOptions) -> (MemoryTransport, ManualClock) {
        let clock = ManualClock::starting_now();
        let t = MemoryTransport::new("unit", options)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (t, clock)
    }

    #[tokio::test]
    async fn priority_beats_insertion_order() {
        let (t, _) = transport(QueueOptions {
            enable_priority: true,
            ..Default::default()
        });
        t.send(NewMessage::new("low").priority(1)).await.unwrap();
        t.send(NewMessage::new("high").priority(9)).await.unwrap();
        t.send(NewMessage::new("none")).await.unwrap();

        let mut bodies = Vec::new();
        while let Received::Message(d) = t.receive(&ReceiveRequest::untagged()).await.unwrap() {
            bodies.push(String::from_utf8(d.message.body).unwrap());
        }
        assert_eq!(bodies, ["high", "low", "none"]);
    }

    #[tokio::test]
    async fn rollback_puts_message_at_the_head() {
        let (t, _) = transport(QueueOptions::default());
        let first = t.send(NewMessage::new("1")).await.unwrap();
        t.send(NewMessage::new("2")).await.unwrap();

        let Received::Message(mut d) = t.receive(&ReceiveRequest::untagged()).await.unwrap()
        else {
            panic!("expected a message");
        };
        assert_eq!(d.message.id, first.id);
        assert_eq!(t.rollback(&mut d.handle, None).await.unwrap(), RequeueStatus::Requeued);
        assert_eq!(t.rollback(&mut d.handle, None).await.unwrap(), RequeueStatus::NotFound);

        let Received::Message(again) = t.receive(&ReceiveRequest::untagged()).await.unwrap()
        else {
            panic!("expected a message");
        };
        assert_eq!(again.message.id, first.id);
    }

    #[tokio::test]
    async fn uuid_ids_when_configured() {
        let (t, _) = transport(QueueOptions {
            id_strategy: IdStrategy::Uuid,
            ..Default::default()
        });
        let sent = t.send(NewMessage::new("x")).await.unwrap();
        assert!(matches!(sent.id, MessageId::Uuid(_)));
    }

    #[tokio::test]
    async fn record_failure_counts_per_exception_type() {
        let (t, _) = transport(QueueOptions::default());
        let sent = t.send(NewMessage::new("x")).await.unwrap();
        assert_eq!(t.record_failure(&sent.id, "Timeout").await.unwrap(), Some(1));
        assert_eq!(t.record_failure(&sent.id, "Timeout").await.unwrap(), Some(2));
        assert_eq!(t.record_failure(&sent.id, "Parse").await.unwrap(), Some(1));
        t.remove(&sent.id).await.unwrap();
        assert_eq!(t.record_failure(&sent.id, "Timeout").await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_purge_respects_retention() {
        let (t, clock) = transport(QueueOptions::default());
        let sent = t.send(NewMessage::new("x")).await.unwrap();
        let Received::Message(mut d) = t.receive(&ReceiveRequest::untagged()).await.unwrap()
        else {
            panic!("expected a message");
        };
        t.move_to_error(&mut d.handle, &Failure::new("Boom", "bad"))
            .await
            .unwrap();
        assert_eq!(t.state_of(&sent.id).await.unwrap(), Some(MessageState::Error));

        let retention = Duration::from_secs(3600);
        assert_eq!(t.purge_errors(retention, 10).await.unwrap(), 0);
        clock.advance(retention + Duration::from_secs(1));
        assert_eq!(t.purge_errors(retention, 10).await.unwrap(), 1);
        assert_eq!(t.state_of(&sent.id).await.unwrap(), None);
    }
}

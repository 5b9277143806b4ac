//! The transport seam.
//!
//! A transport turns a passive store into a competing-consumers queue. Every
//! lifecycle transition is one atomic backend operation (a Lua script, a SQL
//! statement with row locking, or one critical section for the in-memory
//! transport); nothing here does client-side check-then-act.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::QueueOptions;
use crate::error::{Error, Result};
use crate::model::{
    Failure, Lease, MessageId, MessageState, NewMessage, QueueCounts, ReceivedMessage,
    RemoveStatus, RequeueStatus, SentMessage,
};
use crate::names::{QueueNames, validate_name};

/// Owns whatever the transport needs to finish one message: at minimum its
/// lease, and in held-transaction mode the open database transaction.
pub trait MessageHandle: Send {
    fn lease(&self) -> &Lease;

    fn id(&self) -> &MessageId {
        &self.lease().id
    }
}

/// Wake-on-enqueue channel.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for a notification or `timeout`, whichever comes first.
    /// Returns `true` when woken by a notification.
    async fn wait(&mut self, timeout: Duration) -> Result<bool>;
}

/// What a receive call should look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Point-to-point receive of one specific message. Routes are ignored.
    pub message_id: Option<MessageId>,
    /// Routes to try, in order. Empty means untagged messages only.
    pub routes: Vec<String>,
}

impl ReceiveRequest {
    pub fn untagged() -> Self {
        Self::default()
    }

    pub fn routes(routes: Vec<String>) -> Self {
        Self {
            message_id: None,
            routes,
        }
    }

    pub fn message(id: MessageId) -> Self {
        Self {
            message_id: Some(id),
            routes: Vec::new(),
        }
    }
}

/// A leased message plus the handle needed to finish it.
#[derive(Debug)]
pub struct Delivery<H> {
    pub message: ReceivedMessage,
    pub handle: H,
}

/// Outcome of one dequeue attempt.
#[derive(Debug)]
pub enum Received<H> {
    Message(Delivery<H>),
    /// The popped message had expired. It is leased but never delivered;
    /// the caller removes it and tries again.
    Expired(MessageId),
    /// The message is leased but its payload could not be rebuilt.
    Poison { handle: H, reason: String },
    Empty,
}

impl<H> Received<H> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Received::Empty)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Handle: MessageHandle + 'static;
    type Subscription: Subscription + 'static;

    /// Short backend name for logs and errors.
    fn kind(&self) -> &'static str;

    fn names(&self) -> &QueueNames;

    fn options(&self) -> &QueueOptions;

    /// Create storage (tables, indices) or load scripts. Idempotent.
    async fn install(&self) -> Result<()>;

    async fn send(&self, message: NewMessage) -> Result<SentMessage>;

    /// Enqueue many messages, one atomic unit per route group. Results come
    /// back in input order.
    ///
    /// A group that fails leaves the groups before it committed. Its
    /// positions carry the group's error; when that error is transient the
    /// positions can be re-sent on their own.
    async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<Result<SentMessage>>>;

    async fn subscribe(&self) -> Result<Self::Subscription>;

    async fn receive(&self, request: &ReceiveRequest) -> Result<Received<Self::Handle>>;

    /// Renew a lease. `false` once the message is no longer working under
    /// this lease's token.
    async fn heartbeat(&self, lease: &Lease) -> Result<bool>;

    /// Delete the message if `handle` still owns its lease.
    ///
    /// Settle calls borrow the handle so a transient failure can be retried.
    /// Once one has taken effect, further settle calls on the same handle
    /// report `NotFound`.
    async fn commit(&self, handle: &mut Self::Handle) -> Result<RemoveStatus>;

    /// Return a working message to pending, or to delayed when `delay` is set.
    async fn rollback(
        &self,
        handle: &mut Self::Handle,
        delay: Option<Duration>,
    ) -> Result<RequeueStatus>;

    /// Bump the retry count for `(id, exception_type)`. `None` when the
    /// message no longer exists.
    async fn record_failure(&self, id: &MessageId, exception_type: &str) -> Result<Option<u32>>;

    async fn move_to_error(
        &self,
        handle: &mut Self::Handle,
        failure: &Failure,
    ) -> Result<RemoveStatus>;

    /// Delete a message in any active state, regardless of lease.
    async fn remove(&self, id: &MessageId) -> Result<RemoveStatus>;

    /// Return up to `limit` working messages whose lease is older than
    /// `window` to pending.
    async fn reset_heartbeats(&self, window: Duration, limit: usize) -> Result<u64>;

    async fn promote_delayed(&self, limit: usize) -> Result<u64>;

    /// Delete up to `limit` unclaimed messages whose expiration has passed.
    async fn purge_expired(&self, limit: usize) -> Result<u64>;

    async fn purge_errors(&self, retention: Duration, limit: usize) -> Result<u64>;

    async fn state_of(&self, id: &MessageId) -> Result<Option<MessageState>>;

    async fn counts(&self) -> Result<QueueCounts>;
}

/// Reject a message that uses a feature the queue has switched off.
pub(crate) fn check_message(
    kind: &'static str,
    options: &QueueOptions,
    message: &NewMessage,
) -> Result<()> {
    let off = |feature: &str| Error::Unsupported {
        transport: kind,
        feature: format!("{feature} is disabled for this queue"),
    };
    if let Some(route) = &message.route {
        if !options.enable_routes {
            return Err(off("routing"));
        }
        validate_name(route)?;
    }
    if message.priority.is_some() && !options.enable_priority {
        return Err(off("priority"));
    }
    if message.delay.is_some() && !options.enable_delayed_processing {
        return Err(off("delayed processing"));
    }
    if message.expire_at.is_some() && !options.enable_message_expiration {
        return Err(off("message expiration"));
    }
    if message.job.as_ref().is_some_and(|job| job.name.is_empty()) {
        return Err(Error::Other("job name must not be empty".into()));
    }
    Ok(())
}

/// Group batch positions by route, keeping first-seen route order.
pub(crate) fn group_by_route(messages: &[NewMessage]) -> Vec<(Option<String>, Vec<usize>)> {
    let mut groups: Vec<(Option<String>, Vec<usize>)> = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        match groups.iter_mut().find(|(route, _)| *route == message.route) {
            Some((_, positions)) => positions.push(i),
            None => groups.push((message.route.clone(), vec![i])),
        }
    }
    groups
}

//! Core data model.
//!
//! A message is a unit of work: an opaque body, a header map, and the
//! metadata the transports need to route, delay, expire and deduplicate it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Message Id
// ---------------------------------------------------------------------------

/// Backend-native message identifier.
///
/// Relational transports hand out sequence values; the Redis transport hands
/// out either an incrementing counter or a random UUID, depending on the
/// configured [`IdStrategy`](crate::config::IdStrategy).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Sequence(i64),
    Uuid(Uuid),
}

impl MessageId {
    /// The sequence value, for transports that only understand integer ids.
    pub fn as_sequence(&self) -> Result<i64> {
        match self {
            MessageId::Sequence(n) => Ok(*n),
            MessageId::Uuid(u) => Err(Error::InvalidMessageId(u.to_string())),
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Sequence(n) => write!(f, "{n}"),
            MessageId::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl std::str::FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(MessageId::Sequence(n));
        }
        Uuid::parse_str(s)
            .map(MessageId::Uuid)
            .map_err(|_| Error::InvalidMessageId(s.to_string()))
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        MessageId::Sequence(n)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a message.
///
/// Redis encodes this implicitly by which collection holds the id; the
/// relational transport stores it in the metadata `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Visible and eligible for dequeue.
    Pending,
    /// Leased to a consumer.
    Working,
    /// Scheduled for future promotion to pending.
    Delayed,
    /// Routed to the error store. Terminal for the active queue.
    Error,
}

impl MessageState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: MessageState) -> bool {
        use MessageState as S;
        matches!(
            (self, to),
            (S::Pending, S::Working)
                | (S::Pending, S::Delayed)
                | (S::Delayed, S::Pending)
                | (S::Working, S::Pending)    // rollback or lease expiry
                | (S::Working, S::Delayed)    // rollback with backoff
                | (S::Working, S::Error) // retries exhausted or poison
        )
    }

    /// Is this a terminal state for the active queue?
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Error)
    }

    /// Integer encoding used by the relational `status` column.
    pub fn as_status_code(self) -> i16 {
        match self {
            MessageState::Pending => 0,
            MessageState::Working => 1,
            MessageState::Error => 2,
            MessageState::Delayed => 3,
        }
    }

    pub fn from_status_code(code: i16) -> Result<Self> {
        match code {
            0 => Ok(MessageState::Pending),
            1 => Ok(MessageState::Working),
            2 => Ok(MessageState::Error),
            3 => Ok(MessageState::Delayed),
            other => Err(Error::InvariantViolation(format!(
                "unknown status code {other}"
            ))),
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageState::Pending => "pending",
            MessageState::Working => "working",
            MessageState::Delayed => "delayed",
            MessageState::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageState::Pending),
            "working" => Ok(MessageState::Working),
            "delayed" => Ok(MessageState::Delayed),
            "error" => Ok(MessageState::Error),
            other => Err(Error::InvariantViolation(format!("unknown state {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Message headers. Persisted as opaque bytes by the configured
/// [`HeaderSerializer`](crate::serializer::HeaderSerializer).
pub type Headers = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Job schedule
// ---------------------------------------------------------------------------

/// Tags a message as one run of a named scheduled job, for at-most-once
/// scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a message to enqueue.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub(crate) body: Vec<u8>,
    pub(crate) headers: Headers,
    pub(crate) correlation_id: Uuid,
    pub(crate) route: Option<String>,
    pub(crate) priority: Option<i16>,
    pub(crate) delay: Option<Duration>,
    pub(crate) expire_at: Option<DateTime<Utc>>,
    pub(crate) job: Option<JobSchedule>,
}

impl NewMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
            correlation_id: Uuid::new_v4(),
            route: None,
            priority: None,
            delay: None,
            expire_at: None,
            job: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Deliver no earlier than `delay` from now. A zero delay is ignored.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = (!delay.is_zero()).then_some(delay);
        self
    }

    pub fn expire_at(mut self, at: DateTime<Utc>) -> Self {
        self.expire_at = Some(at);
        self
    }

    pub fn job(mut self, name: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        self.job = Some(JobSchedule {
            name: name.into(),
            scheduled_at,
        });
        self
    }

    pub fn route_name(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn is_delayed(&self) -> bool {
        self.delay.is_some()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Identity of an enqueued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: MessageId,
    pub correlation_id: Uuid,
}

/// A message leased to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Uuid,
    pub route: Option<String>,
    pub priority: Option<i16>,
    pub enqueued_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// One receive's claim on a working message.
///
/// The token is minted at dequeue and stored with the lease. Heartbeat and
/// settle calls must present it, so a handle whose lease was reclaimed and
/// handed to another consumer can no longer touch the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: MessageId,
    pub token: Uuid,
}

impl Lease {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            token: Uuid::new_v4(),
        }
    }
}

/// Result of commit, remove and move-to-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    Removed,
    NotFound,
}

/// Result of rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueStatus {
    Requeued,
    NotFound,
}

/// Processing failure reported by a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    /// Key into the retry table, typically the error's type name.
    pub exception_type: String,
    pub message: String,
}

impl Failure {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    /// Failure recorded for a message whose payload could not be rebuilt.
    pub fn poison(reason: impl Into<String>) -> Self {
        Self::new("PoisonMessage", reason)
    }
}

/// Message counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub delayed: u64,
    pub working: u64,
    pub error: u64,
}

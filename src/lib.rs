//! # leaseq
//!
//! Lease-based, at-least-once message queuing over Postgres and Redis.
//!
//! A consumer dequeues a message by atomically moving it to `working` and
//! stamping a lease. It then commits (delete), rolls back (requeue, possibly
//! delayed) or moves the message to the error store. Background sweeps
//! return messages with stale leases, promote due delayed messages and purge
//! expired ones.
//!
//! Backends implement [`transport::Transport`]; the worker side lives in
//! [`engine`].

pub mod backend;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod names;
pub mod policy;
pub mod routes;
pub mod serializer;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Result};
pub use model::{MessageId, MessageState, NewMessage, ReceivedMessage};
pub use transport::Transport;

//! Worker side: consumers, lease renewal, retry decisions and maintenance.

pub mod consumer;
pub mod heartbeat;
pub mod producer;
pub mod retry;
pub mod sweeper;

pub use consumer::{Consumer, MessageHandler, Processed};
pub use heartbeat::HeartbeatTicker;
pub use producer::Producer;
pub use retry::{Decision, RetryTable};
pub use sweeper::{Maintenance, SweepKind, Sweeper};

//! Concrete transports.

pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::{MemoryHandle, MemoryTransport};
pub use postgres::{PgHandle, PostgresTransport};
pub use redis::{RedisHandle, RedisTransport};

//! Per-message connection ownership.

use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::{PgConnection, Postgres, Transaction};

/// Owns the database transaction of one message in held-transaction mode.
///
/// In lease mode it holds nothing and every operation goes through the pool.
/// The transaction is handed out for release at most once; dropping an
/// unreleased holder rolls the transaction back.
pub struct ConnectionHolder {
    tx: Option<Transaction<'static, Postgres>>,
    released: AtomicBool,
}

impl ConnectionHolder {
    pub(super) fn detached() -> Self {
        Self {
            tx: None,
            released: AtomicBool::new(false),
        }
    }

    pub(super) fn held(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx: Some(tx),
            released: AtomicBool::new(false),
        }
    }

    pub fn is_held(&self) -> bool {
        self.tx.is_some()
    }

    /// The open transaction's connection, for the consumer's own writes.
    pub fn connection(&mut self) -> Option<&mut PgConnection> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        self.tx.as_deref_mut()
    }

    /// First call takes the transaction; later calls get `None`.
    pub(super) fn release(&mut self) -> Option<Transaction<'static, Postgres>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.tx.take()
    }
}

impl Drop for ConnectionHolder {
    fn drop(&mut self) {
        if let Some(tx) = self.release() {
            tracing::debug!("message handle dropped with an open transaction, rolling back");
            // sqlx queues the ROLLBACK on drop.
            drop(tx);
        }
    }
}

impl std::fmt::Debug for ConnectionHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHolder")
            .field("held", &self.tx.is_some())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

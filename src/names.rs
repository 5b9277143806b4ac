//! Physical resource names derived from a logical queue name.
//!
//! Queue and route names are restricted to ASCII letters and digits (starting
//! with a letter), so joining them with `_` or `:` separators keeps the
//! mapping injective: the queue name is everything before the first separator.

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 48;

/// Validate a queue or route name.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(Error::invalid_name(name, "must not be empty")),
        Some(c) if !c.is_ascii_alphabetic() => {
            return Err(Error::invalid_name(name, "must start with an ASCII letter"));
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::invalid_name(name, "only ASCII letters and digits are allowed"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_name(
            name,
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

/// All physical names for one logical queue. Computed once per transport.
#[derive(Debug, Clone)]
pub struct QueueNames {
    queue: String,
}

impl QueueNames {
    pub fn new(queue: &str) -> Result<Self> {
        validate_name(queue)?;
        Ok(Self {
            queue: queue.to_string(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Table names for the relational transport. Case is preserved, so SQL
    /// must always quote them.
    pub fn tables(&self) -> TableNames {
        let t = |suffix: &str| format!("{}_{suffix}", self.queue);
        TableNames {
            queue: t("queue"),
            metadata: t("metadata"),
            status: t("status"),
            error_tracking: t("error_tracking"),
            errors: t("errors"),
            jobs: t("jobs"),
            notification: t("notify"),
        }
    }

    /// Key names for the Redis transport. Every key carries the `{queue}`
    /// hash tag so one queue lives in one cluster slot.
    pub fn keys(&self) -> RedisKeys {
        let k = |suffix: &str| format!("{{{}}}:{suffix}", self.queue);
        RedisKeys {
            pending: k("pending"),
            pending_route_prefix: k("pending:"),
            working: k("working"),
            leases: k("leases"),
            values: k("values"),
            headers: k("headers"),
            meta: k("meta"),
            delayed: k("delayed"),
            expiration: k("expiration"),
            error: k("error"),
            error_time: k("errortime"),
            error_tracking: k("errortracking"),
            status: k("status"),
            id: k("id"),
            route: k("route"),
            job_names: k("jobnames"),
            job_id_names: k("jobidnames"),
            job_event_times: k("jobeventtimes"),
            notification: k("notify"),
        }
    }
}

/// Relational table names for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Body and headers, keyed by the sequence id.
    pub queue: String,
    /// Status, lease, timing and routing columns.
    pub metadata: String,
    /// Optional externally queryable status table.
    pub status: String,
    pub error_tracking: String,
    pub errors: String,
    /// Last scheduled time per job name.
    pub jobs: String,
    /// `LISTEN`/`NOTIFY` channel.
    pub notification: String,
}

impl TableNames {
    pub fn all_tables(&self) -> [&str; 6] {
        [
            &self.queue,
            &self.metadata,
            &self.status,
            &self.error_tracking,
            &self.errors,
            &self.jobs,
        ]
    }
}

/// Redis key names for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    /// Pending list for untagged messages.
    pub pending: String,
    /// Prefix of the per-route pending lists; append the route name.
    pub pending_route_prefix: String,
    pub working: String,
    /// Lease token per working id.
    pub leases: String,
    pub values: String,
    pub headers: String,
    pub meta: String,
    pub delayed: String,
    pub expiration: String,
    pub error: String,
    pub error_time: String,
    pub error_tracking: String,
    pub status: String,
    pub id: String,
    pub route: String,
    pub job_names: String,
    pub job_id_names: String,
    pub job_event_times: String,
    pub notification: String,
}

impl RedisKeys {
    /// The pending list a message with `route` lives in.
    pub fn pending_for(&self, route: Option<&str>) -> String {
        match route {
            Some(r) => format!("{}{r}", self.pending_route_prefix),
            None => self.pending.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn rejects_names_that_could_collide() {
        assert!(QueueNames::new("orders").is_ok());
        assert!(QueueNames::new("orders2").is_ok());
        assert!(QueueNames::new("").is_err());
        assert!(QueueNames::new("2orders").is_err());
        assert!(QueueNames::new("orders_queue").is_err());
        assert!(QueueNames::new("orders:x").is_err());
        assert!(QueueNames::new("{orders}").is_err());
        assert!(QueueNames::new(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = QueueNames::new("orders").unwrap();
        let b = QueueNames::new("orders").unwrap();
        assert_eq!(a.tables(), b.tables());
        assert_eq!(a.keys(), b.keys());
    }

    #[test]
    fn distinct_queues_never_share_a_table() {
        let queues = ["a", "A", "ab", "aQueue", "queue", "aMetadata", "orders"];
        let mut seen = HashSet::new();
        for q in queues {
            let names = QueueNames::new(q).unwrap();
            for table in names.tables().all_tables() {
                assert!(seen.insert(table.to_string()), "collision on {table}");
            }
        }
    }

    #[test]
    fn redis_keys_share_one_hash_tag() {
        let keys = QueueNames::new("orders").unwrap().keys();
        for key in [&keys.pending, &keys.working, &keys.leases, &keys.notification] {
            assert!(key.starts_with("{orders}:"), "{key}");
        }
        assert_eq!(keys.pending_for(Some("eu")), "{orders}:pending:eu");
        assert_eq!(keys.pending_for(None), "{orders}:pending");
    }
}

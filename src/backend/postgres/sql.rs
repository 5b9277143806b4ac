//! Statement text for one queue.
//!
//! Built once when the transport is constructed and immutable afterwards.
//! sqlx caches the prepared form per connection, keyed by this text.

use crate::config::QueueOptions;
use crate::model::MessageState;
use crate::names::TableNames;

/// Savepoint taken right after a held dequeue. Rolling back to it discards
/// the consumer's writes but keeps the row lock on the message.
pub(super) const DEQUEUED_SAVEPOINT: &str = "leaseq_dequeued";

/// Quote an identifier. Queue names are letters and digits only, so there is
/// nothing to escape.
pub(super) fn ident(name: &str) -> String {
    format!("\"{name}\"")
}

fn code(state: MessageState) -> i16 {
    state.as_status_code()
}

/// The three shapes of dequeue: any untagged message, a message on one
/// route, or one specific message.
#[derive(Debug, Clone)]
pub(super) struct DequeueStatements {
    pub untagged: String,
    pub routed: String,
    pub by_id: String,
}

#[derive(Debug, Clone)]
pub(super) struct Statements {
    pub insert_body: String,
    pub insert_meta: String,
    pub upsert_job: String,
    pub notify: String,
    pub dequeue: DequeueStatements,
    pub heartbeat: String,
    pub delete: String,
    /// Lease mode: delete only while the caller's lease token is current.
    pub delete_leased: String,
    pub requeue: String,
    pub requeue_delayed: String,
    /// Held mode: delay a message whose status was never changed.
    pub delay_unclaimed: String,
    pub record_failure: String,
    pub move_to_error: String,
    pub reset_heartbeats: String,
    pub promote_delayed: String,
    pub purge_expired: String,
    pub purge_errors: String,
    pub status_of: String,
    pub in_errors: String,
    pub count_active: String,
    pub count_errors: String,
}

impl Statements {
    pub fn new(t: &TableNames, options: &QueueOptions) -> Self {
        let q = ident(&t.queue);
        let m = ident(&t.metadata);
        let tracking = ident(&t.error_tracking);
        let errors = ident(&t.errors);
        let jobs = ident(&t.jobs);

        let pending = code(MessageState::Pending);
        let working = code(MessageState::Working);
        let delayed = code(MessageState::Delayed);

        let order = if options.enable_priority {
            "COALESCE(m.priority, 0) DESC, m.queue_id"
        } else {
            "m.queue_id"
        };

        let dequeue = if options.hold_transaction_until_commit {
            held_dequeue(&q, &m, order, pending)
        } else {
            leasing_dequeue(&q, &m, order, pending, working)
        };

        Self {
            insert_body: format!(
                "INSERT INTO {q} (body, headers) VALUES ($1, $2) RETURNING queue_id"
            ),
            insert_meta: format!(
                "INSERT INTO {m} (queue_id, status, correlation_id, route, priority, queued_at,
                                  queue_process_time, expiration_time, job_name)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ),
            upsert_job: format!(
                "INSERT INTO {jobs} AS j (job_name, job_scheduled_time, job_event_time)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (job_name) DO UPDATE
                   SET job_scheduled_time = EXCLUDED.job_scheduled_time,
                       job_event_time = EXCLUDED.job_event_time
                   WHERE j.job_scheduled_time <> EXCLUDED.job_scheduled_time
                 RETURNING job_name"
            ),
            notify: "SELECT pg_notify($1, $2)".to_string(),
            dequeue,
            heartbeat: format!(
                "UPDATE {m} SET heartbeat = $2
                 WHERE queue_id = $1 AND status = {working} AND lease_token = $3"
            ),
            // Cascades to metadata and error tracking.
            delete: format!("DELETE FROM {q} WHERE queue_id = $1"),
            delete_leased: format!(
                "WITH owned AS (
                    SELECT queue_id FROM {m}
                    WHERE queue_id = $1 AND status = {working} AND lease_token = $2
                    FOR UPDATE
                 )
                 DELETE FROM {q} WHERE queue_id IN (SELECT queue_id FROM owned)"
            ),
            requeue: format!(
                "UPDATE {m} SET status = {pending}, heartbeat = NULL, lease_token = NULL
                 WHERE queue_id = $1 AND status = {working} AND lease_token = $2
                 RETURNING route"
            ),
            requeue_delayed: format!(
                "UPDATE {m} SET status = {delayed}, heartbeat = NULL, lease_token = NULL,
                                queue_process_time = $2
                 WHERE queue_id = $1 AND status = {working} AND lease_token = $3"
            ),
            delay_unclaimed: format!(
                "UPDATE {m} SET status = {delayed}, queue_process_time = $2
                 WHERE queue_id = $1 AND status = {pending}"
            ),
            record_failure: format!(
                "INSERT INTO {tracking} AS t (queue_id, exception_type, retry_count)
                 SELECT $1, $2, 1 WHERE EXISTS (SELECT 1 FROM {q} WHERE queue_id = $1)
                 ON CONFLICT (queue_id, exception_type)
                   DO UPDATE SET retry_count = t.retry_count + 1
                 RETURNING retry_count"
            ),
            // $5 is the status the caller expects the message to be in and $6
            // its lease token (NULL in held mode). A sweep that got there
            // first makes the CTE empty.
            move_to_error: format!(
                "WITH target AS (
                    SELECT queue_id FROM {m}
                    WHERE queue_id = $1 AND status = $5 AND lease_token IS NOT DISTINCT FROM $6
                    FOR UPDATE
                 ), copied AS (
                    INSERT INTO {errors} (queue_id, body, headers, correlation_id, route, priority,
                                          queued_at, exception_type, exception_message,
                                          last_exception_time)
                    SELECT q.queue_id, q.body, q.headers, m.correlation_id, m.route, m.priority,
                           m.queued_at, $2, $3, $4
                    FROM target
                    JOIN {m} AS m ON m.queue_id = target.queue_id
                    JOIN {q} AS q ON q.queue_id = target.queue_id
                    RETURNING queue_id
                 )
                 DELETE FROM {q} WHERE queue_id IN (SELECT queue_id FROM copied)"
            ),
            reset_heartbeats: format!(
                "WITH stale AS (
                    SELECT queue_id FROM {m}
                    WHERE status = {working} AND heartbeat < $1
                    ORDER BY heartbeat
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                 )
                 UPDATE {m} AS m SET status = {pending}, heartbeat = NULL, lease_token = NULL
                 FROM stale
                 WHERE m.queue_id = stale.queue_id
                   AND m.status = {working} AND m.heartbeat < $1"
            ),
            promote_delayed: format!(
                "WITH due AS (
                    SELECT queue_id FROM {m}
                    WHERE status = {delayed} AND queue_process_time <= $1
                    ORDER BY queue_process_time
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                 )
                 UPDATE {m} AS m SET status = {pending}
                 FROM due
                 WHERE m.queue_id = due.queue_id AND m.status = {delayed}"
            ),
            purge_expired: format!(
                "WITH expired AS (
                    SELECT queue_id FROM {m}
                    WHERE status IN ({pending}, {delayed}) AND expiration_time <= $1
                    ORDER BY expiration_time
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                 )
                 DELETE FROM {q} AS q USING expired WHERE q.queue_id = expired.queue_id"
            ),
            purge_errors: format!(
                "DELETE FROM {errors} WHERE queue_id IN (
                    SELECT queue_id FROM {errors}
                    WHERE last_exception_time < $1
                    ORDER BY last_exception_time
                    LIMIT $2
                 )"
            ),
            status_of: format!("SELECT status FROM {m} WHERE queue_id = $1"),
            in_errors: format!("SELECT EXISTS (SELECT 1 FROM {errors} WHERE queue_id = $1)"),
            count_active: format!("SELECT status, COUNT(*) FROM {m} GROUP BY status"),
            count_errors: format!("SELECT COUNT(*) FROM {errors}"),
        }
    }
}

const DEQUEUED_COLUMNS: &str = "m.queue_id, m.correlation_id, m.route, m.priority, m.queued_at, \
                                m.expiration_time, q.body, q.headers";

/// Lease mode: flip the row to working in the same statement that picks it.
/// `$1` is the lease time, `$2` the lease token, `$3` the route or id.
fn leasing_dequeue(q: &str, m: &str, order: &str, pending: i16, working: i16) -> DequeueStatements {
    let build = |filter: &str| {
        format!(
            "WITH next AS (
                SELECT m.queue_id FROM {m} AS m
                WHERE m.status = {pending} AND {filter}
                ORDER BY {order}
                LIMIT 1
                FOR UPDATE SKIP LOCKED
             )
             UPDATE {m} AS m SET status = {working}, heartbeat = $1, lease_token = $2
             FROM next, {q} AS q
             WHERE m.queue_id = next.queue_id AND q.queue_id = next.queue_id
             RETURNING {DEQUEUED_COLUMNS}"
        )
    };
    DequeueStatements {
        untagged: build("m.route IS NULL"),
        routed: build("m.route = $3"),
        by_id: build("m.queue_id = $3"),
    }
}

/// Held mode: lock the row in the caller's transaction and leave it pending.
/// `FOR NO KEY UPDATE` still admits the foreign-key share lock that error
/// tracking inserts take from other connections. `$1` is the route or id.
fn held_dequeue(q: &str, m: &str, order: &str, pending: i16) -> DequeueStatements {
    let build = |filter: &str| {
        format!(
            "SELECT {DEQUEUED_COLUMNS}
             FROM {m} AS m JOIN {q} AS q ON q.queue_id = m.queue_id
             WHERE m.status = {pending} AND {filter}
             ORDER BY {order}
             LIMIT 1
             FOR NO KEY UPDATE OF m SKIP LOCKED"
        )
    };
    DequeueStatements {
        untagged: build("m.route IS NULL"),
        routed: build("m.route = $1"),
        by_id: build("m.queue_id = $1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::QueueNames;

    fn statements(options: &QueueOptions) -> Statements {
        Statements::new(&QueueNames::new("Orders").unwrap().tables(), options)
    }

    #[test]
    fn identifiers_are_quoted() {
        let sql = statements(&QueueOptions::default());
        assert!(sql.delete.contains("\"Orders_queue\""));
        assert!(sql.heartbeat.contains("\"Orders_metadata\""));
    }

    #[test]
    fn dequeue_skips_locked_rows() {
        let lease = statements(&QueueOptions::default());
        assert!(lease.dequeue.untagged.contains("FOR UPDATE SKIP LOCKED"));
        assert!(lease.dequeue.untagged.contains("route IS NULL"));
        assert!(lease.dequeue.routed.contains("m.route = $3"));
        assert!(lease.dequeue.routed.contains("lease_token = $2"));

        let held = statements(&QueueOptions {
            hold_transaction_until_commit: true,
            ..Default::default()
        });
        assert!(held.dequeue.by_id.contains("FOR NO KEY UPDATE OF m SKIP LOCKED"));
        assert!(!held.dequeue.by_id.contains("UPDATE \"Orders_metadata\" AS m SET"));
    }

    #[test]
    fn lease_mode_writes_check_the_token() {
        let sql = statements(&QueueOptions::default());
        assert!(sql.heartbeat.contains("lease_token = $3"));
        assert!(sql.delete_leased.contains("lease_token = $2"));
        assert!(sql.requeue_delayed.contains("lease_token = $3"));
        assert!(sql.move_to_error.contains("lease_token IS NOT DISTINCT FROM $6"));
    }

    #[test]
    fn priority_changes_dequeue_order() {
        let sql = statements(&QueueOptions {
            enable_priority: true,
            ..Default::default()
        });
        assert!(sql.dequeue.untagged.contains("COALESCE(m.priority, 0) DESC"));
    }

    #[test]
    fn sweeps_are_compare_and_set() {
        let sql = statements(&QueueOptions::default());
        assert!(sql.reset_heartbeats.contains("AND m.status = 1 AND m.heartbeat < $1"));
        assert!(sql.requeue.contains("status = 1 AND lease_token = $2"));
        assert!(sql.reset_heartbeats.contains("lease_token = NULL"));
        assert!(sql.purge_expired.contains("status IN (0, 3)"));
    }
}

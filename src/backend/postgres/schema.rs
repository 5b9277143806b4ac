//! Table layout for one queue.

use super::sql::ident;
use crate::config::QueueOptions;
use crate::model::MessageState;
use crate::names::TableNames;

/// DDL, in execution order. Every statement is idempotent.
pub(super) fn install_statements(t: &TableNames, options: &QueueOptions) -> Vec<String> {
    let q = ident(&t.queue);
    let m = ident(&t.metadata);
    let tracking = ident(&t.error_tracking);
    let errors = ident(&t.errors);
    let jobs = ident(&t.jobs);
    let index = |suffix: &str| ident(&format!("{}_{suffix}", t.metadata));

    let mut ddl = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {q} (
                queue_id BIGSERIAL PRIMARY KEY,
                body BYTEA NOT NULL,
                headers BYTEA NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {m} (
                queue_id BIGINT PRIMARY KEY REFERENCES {q} (queue_id) ON DELETE CASCADE,
                status SMALLINT NOT NULL,
                correlation_id UUID NOT NULL,
                route TEXT NULL,
                priority SMALLINT NULL,
                queued_at TIMESTAMPTZ NOT NULL,
                queue_process_time TIMESTAMPTZ NOT NULL,
                heartbeat TIMESTAMPTZ NULL,
                lease_token UUID NULL,
                expiration_time TIMESTAMPTZ NULL,
                job_name TEXT NULL UNIQUE
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {m} (status, route, queue_id)",
            index("dequeue")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {m} (status, heartbeat)",
            index("heartbeat")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {m} (status, queue_process_time)",
            index("process_time")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {m} (expiration_time) WHERE expiration_time IS NOT NULL",
            index("expiration")
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {tracking} (
                error_tracking_id BIGSERIAL PRIMARY KEY,
                queue_id BIGINT NOT NULL REFERENCES {q} (queue_id) ON DELETE CASCADE,
                exception_type TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                UNIQUE (queue_id, exception_type)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {errors} (
                queue_id BIGINT PRIMARY KEY,
                body BYTEA NOT NULL,
                headers BYTEA NOT NULL,
                correlation_id UUID NOT NULL,
                route TEXT NULL,
                priority SMALLINT NULL,
                queued_at TIMESTAMPTZ NOT NULL,
                exception_type TEXT NOT NULL,
                exception_message TEXT NOT NULL,
                last_exception_time TIMESTAMPTZ NOT NULL
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {errors} (last_exception_time)",
            ident(&format!("{}_time", t.errors))
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {jobs} (
                job_name TEXT PRIMARY KEY,
                job_scheduled_time TIMESTAMPTZ NOT NULL,
                job_event_time TIMESTAMPTZ NOT NULL
            )"
        ),
    ];

    if options.enable_priority {
        ddl.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {m} (status, route, priority DESC, queue_id)",
            index("priority")
        ));
    }

    if options.enable_status_table {
        // A view, so it can never disagree with the tables it reads.
        let error = MessageState::Error.as_status_code();
        ddl.push(format!(
            "CREATE OR REPLACE VIEW {} AS
                SELECT queue_id, status, correlation_id, route, queued_at FROM {m}
                UNION ALL
                SELECT queue_id, {error}::SMALLINT, correlation_id, route, queued_at FROM {errors}",
            ident(&t.status)
        ));
    }

    ddl
}

//! Postgres transport.
//!
//! Lease mode picks and flips a row to working in one
//! `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)` statement, so
//! concurrent consumers never block on or double-claim a row. Held mode keeps
//! the dequeue transaction open until the message is finished and deletes the
//! row inside it. Wake-ups go through `pg_notify` / `LISTEN`.

mod holder;
mod schema;
mod sql;

pub use holder::ConnectionHolder;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, to_delta};
use crate::config::{QueueOptions, TransportKind};
use crate::error::{Error, Result};
use crate::model::{
    Failure, Lease, MessageId, MessageState, NewMessage, QueueCounts, ReceivedMessage,
    RemoveStatus, RequeueStatus, SentMessage,
};
use crate::names::{QueueNames, TableNames};
use crate::serializer::{HeaderSerializer, JsonHeaderSerializer};
use crate::transport::{
    Delivery, MessageHandle, ReceiveRequest, Received, Subscription, Transport, check_message,
    group_by_route,
};
use sql::{DEQUEUED_SAVEPOINT, Statements};

const KIND: &str = "postgres";

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Handle for a message leased from Postgres.
///
/// In held mode the lease token is never written; the open transaction is
/// what the handle owns, and it is gone once released.
#[derive(Debug)]
pub struct PgHandle {
    lease: Lease,
    queue_id: i64,
    holder: ConnectionHolder,
}

impl PgHandle {
    /// The held transaction's connection. `None` in lease mode.
    pub fn connection(&mut self) -> Option<&mut PgConnection> {
        self.holder.connection()
    }
}

impl MessageHandle for PgHandle {
    fn lease(&self) -> &Lease {
        &self.lease
    }
}

pub struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.listener.recv()).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(false),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DequeuedRow {
    queue_id: i64,
    correlation_id: Uuid,
    route: Option<String>,
    priority: Option<i16>,
    queued_at: DateTime<Utc>,
    expiration_time: Option<DateTime<Utc>>,
    body: Vec<u8>,
    headers: Vec<u8>,
}

enum Target<'a> {
    Untagged,
    Route(&'a str),
    Id(i64),
}

pub struct PostgresTransport {
    pool: PgPool,
    names: QueueNames,
    tables: TableNames,
    sql: Statements,
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    serializer: Arc<dyn HeaderSerializer>,
}

impl PostgresTransport {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, queue: &str, options: QueueOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Self::with_pool(pool, queue, options)
    }

    pub fn with_pool(pool: PgPool, queue: &str, options: QueueOptions) -> Result<Self> {
        options.validate(TransportKind::Postgres)?;
        let names = QueueNames::new(queue)?;
        let tables = names.tables();
        let sql = Statements::new(&tables, &options);
        Ok(Self {
            pool,
            names,
            tables,
            sql,
            options,
            clock: Arc::new(SystemClock),
            serializer: Arc::new(JsonHeaderSerializer),
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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn held(&self) -> bool {
        self.options.hold_transaction_until_commit
    }

    async fn notify(&self, conn: &mut PgConnection, route: Option<&str>) -> Result<()> {
        sqlx::query(&self.sql.notify)
            .bind(&self.tables.notification)
            .bind(route.unwrap_or(""))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Insert one message. Returns whether it went straight to pending.
    async fn insert(
        &self,
        conn: &mut PgConnection,
        message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<(SentMessage, bool)> {
        let headers = self.serializer.serialize(&message.headers)?;
        let (queue_id,): (i64,) = sqlx::query_as(&self.sql.insert_body)
            .bind(&message.body)
            .bind(&headers)
            .fetch_one(&mut *conn)
            .await?;

        let (state, process_time) = match message.delay {
            Some(d) => (MessageState::Delayed, now + to_delta(d)),
            None => (MessageState::Pending, now),
        };
        let job_name = message.job.as_ref().map(|j| j.name.as_str());

        sqlx::query(&self.sql.insert_meta)
            .bind(queue_id)
            .bind(state.as_status_code())
            .bind(message.correlation_id)
            .bind(message.route.as_deref())
            .bind(message.priority)
            .bind(now)
            .bind(process_time)
            .bind(message.expire_at)
            .bind(job_name)
            .execute(&mut *conn)
            .await
            .map_err(|e| match job_name {
                Some(job) if has_code(&e, UNIQUE_VIOLATION) => Error::JobAlreadyExists {
                    job_name: job.to_string(),
                },
                _ => e.into(),
            })?;

        if let Some(job) = &message.job {
            let upserted: Option<(String,)> = sqlx::query_as(&self.sql.upsert_job)
                .bind(&job.name)
                .bind(job.scheduled_at)
                .bind(now)
                .fetch_optional(&mut *conn)
                .await?;
            if upserted.is_none() {
                return Err(Error::JobAlreadyExists {
                    job_name: job.name.clone(),
                });
            }
        }

        Ok((
            SentMessage {
                id: MessageId::Sequence(queue_id),
                correlation_id: message.correlation_id,
            },
            state == MessageState::Pending,
        ))
    }

    /// Send one route group in a single transaction.
    async fn send_group(
        &self,
        messages: &[&NewMessage],
        route: Option<&str>,
    ) -> Result<Vec<SentMessage>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut sent = Vec::with_capacity(messages.len());
        let mut immediate = false;
        for message in messages {
            check_message(KIND, &self.options, message)?;
            let (s, pending) = self.insert(&mut *tx, message, now).await?;
            immediate |= pending;
            sent.push(s);
        }
        if immediate {
            self.notify(&mut *tx, route).await?;
        }
        tx.commit().await?;
        Ok(sent)
    }

    async fn fetch_dequeued(
        &self,
        conn: &mut PgConnection,
        target: &Target<'_>,
        now: DateTime<Utc>,
        token: Uuid,
    ) -> Result<Option<DequeuedRow>> {
        let statements = &self.sql.dequeue;
        let sql = match target {
            Target::Untagged => &statements.untagged,
            Target::Route(_) => &statements.routed,
            Target::Id(_) => &statements.by_id,
        };
        let mut query = sqlx::query_as::<_, DequeuedRow>(sql);
        if !self.held() {
            query = query.bind(now).bind(token);
        }
        query = match *target {
            Target::Untagged => query,
            Target::Route(route) => query.bind(route),
            Target::Id(id) => query.bind(id),
        };
        Ok(query.fetch_optional(conn).await?)
    }

    fn deliver(
        &self,
        row: DequeuedRow,
        token: Uuid,
        holder: ConnectionHolder,
    ) -> Received<PgHandle> {
        let id = MessageId::Sequence(row.queue_id);
        let handle = PgHandle {
            lease: Lease {
                id: id.clone(),
                token,
            },
            queue_id: row.queue_id,
            holder,
        };
        let headers = match self.serializer.deserialize(&row.headers) {
            Ok(h) => h,
            Err(e) => {
                return Received::Poison {
                    handle,
                    reason: format!("headers: {e}"),
                };
            }
        };
        Received::Message(Delivery {
            message: ReceivedMessage {
                id,
                body: row.body,
                headers,
                correlation_id: row.correlation_id,
                route: row.route,
                priority: row.priority,
                enqueued_at: row.queued_at,
                expire_at: row.expiration_time,
            },
            handle,
        })
    }

    async fn receive_leased(
        &self,
        targets: &[Target<'_>],
        now: DateTime<Utc>,
    ) -> Result<Received<PgHandle>> {
        let mut conn = self.pool.acquire().await?;
        let token = Uuid::new_v4();
        for target in targets {
            let Some(row) = self.fetch_dequeued(&mut conn, target, now, token).await? else {
                continue;
            };
            if row.expiration_time.is_some_and(|at| at <= now) {
                return Ok(Received::Expired(MessageId::Sequence(row.queue_id)));
            }
            return Ok(self.deliver(row, token, ConnectionHolder::detached()));
        }
        Ok(Received::Empty)
    }

    async fn receive_held(
        &self,
        targets: &[Target<'_>],
        now: DateTime<Utc>,
    ) -> Result<Received<PgHandle>> {
        let token = Uuid::new_v4();
        for target in targets {
            let mut tx = self.pool.begin().await?;
            let Some(row) = self.fetch_dequeued(&mut *tx, target, now, token).await? else {
                tx.rollback().await?;
                continue;
            };
            if row.expiration_time.is_some_and(|at| at <= now) {
                // Nobody else can touch the locked row, so clean it up here.
                sqlx::query(&self.sql.delete)
                    .bind(row.queue_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(Received::Expired(MessageId::Sequence(row.queue_id)));
            }
            sqlx::query(&format!("SAVEPOINT {DEQUEUED_SAVEPOINT}"))
                .execute(&mut *tx)
                .await?;
            return Ok(self.deliver(row, token, ConnectionHolder::held(tx)));
        }
        Ok(Received::Empty)
    }

    async fn rollback_to_dequeue(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {DEQUEUED_SAVEPOINT}"))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn move_to_error_with(
        &self,
        conn: &mut PgConnection,
        queue_id: i64,
        failure: &Failure,
        expected: MessageState,
        token: Option<Uuid>,
    ) -> Result<RemoveStatus> {
        let done = sqlx::query(&self.sql.move_to_error)
            .bind(queue_id)
            .bind(&failure.exception_type)
            .bind(&failure.message)
            .bind(self.clock.now())
            .bind(expected.as_status_code())
            .bind(token)
            .execute(conn)
            .await?;
        Ok(removed(done.rows_affected()))
    }

    /// Run a sweep statement bound to `(threshold, limit)`, notifying
    /// listeners in the same transaction when rows moved to pending.
    async fn sweep(
        &self,
        sql: &str,
        threshold: DateTime<Utc>,
        limit: usize,
        wakes: bool,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(sql)
            .bind(threshold)
            .bind(limit as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if wakes && rows > 0 {
            self.notify(&mut *tx, None).await?;
        }
        tx.commit().await?;
        Ok(rows)
    }
}

#[async_trait]
impl Transport for PostgresTransport {
    type Handle = PgHandle;
    type Subscription = PgSubscription;

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
        let mut tx = self.pool.begin().await?;
        // Concurrent installs of the same queue would race on the catalog.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(self.names.queue())
            .execute(&mut *tx)
            .await?;
        for statement in schema::install_statements(&self.tables, &self.options) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::info!(queue = self.names.queue(), "postgres queue installed");
        Ok(())
    }

    async fn send(&self, message: NewMessage) -> Result<SentMessage> {
        let mut sent = self.send_group(&[&message], message.route_name()).await?;
        sent.pop()
            .ok_or_else(|| Error::InvariantViolation("send returned no id".into()))
    }

    async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<Result<SentMessage>>> {
        let mut results: Vec<Option<Result<SentMessage>>> =
            (0..messages.len()).map(|_| None).collect();
        for (route, positions) in group_by_route(&messages) {
            let group: Vec<&NewMessage> = positions.iter().map(|&i| &messages[i]).collect();
            match self.send_group(&group, route.as_deref()).await {
                Ok(sent) => {
                    for (&i, s) in positions.iter().zip(sent) {
                        results[i] = Some(Ok(s));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        queue = self.names.queue(),
                        error = %e,
                        transient = e.is_transient(),
                        "batch group rejected"
                    );
                    for &i in &positions {
                        results[i] = Some(Err(e.for_batch_group()));
                    }
                }
            }
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::unprocessed_batch_position())))
            .collect())
    }

    async fn subscribe(&self) -> Result<PgSubscription> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.tables.notification).await?;
        Ok(PgSubscription { listener })
    }

    async fn receive(&self, request: &ReceiveRequest) -> Result<Received<PgHandle>> {
        let now = self.clock.now();
        let targets: Vec<Target<'_>> = match &request.message_id {
            Some(id) => vec![Target::Id(id.as_sequence()?)],
            None if request.routes.is_empty() => vec![Target::Untagged],
            None => request.routes.iter().map(|r| Target::Route(r.as_str())).collect(),
        };
        if self.held() {
            self.receive_held(&targets, now).await
        } else {
            self.receive_leased(&targets, now).await
        }
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<bool> {
        if self.held() {
            // The open transaction is the lease.
            return Ok(true);
        }
        let done = sqlx::query(&self.sql.heartbeat)
            .bind(lease.id.as_sequence()?)
            .bind(self.clock.now())
            .bind(lease.token)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn commit(&self, handle: &mut PgHandle) -> Result<RemoveStatus> {
        if !self.held() {
            let done = sqlx::query(&self.sql.delete_leased)
                .bind(handle.queue_id)
                .bind(handle.lease.token)
                .execute(&self.pool)
                .await?;
            return Ok(removed(done.rows_affected()));
        }
        let Some(mut tx) = handle.holder.release() else {
            return Ok(RemoveStatus::NotFound);
        };
        let done = sqlx::query(&self.sql.delete)
            .bind(handle.queue_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed(done.rows_affected()))
    }

    async fn rollback(
        &self,
        handle: &mut PgHandle,
        delay: Option<Duration>,
    ) -> Result<RequeueStatus> {
        let queue_id = handle.queue_id;
        let due = delay
            .filter(|d| !d.is_zero())
            .map(|d| self.clock.now() + to_delta(d));

        if self.held() {
            let Some(mut tx) = handle.holder.release() else {
                return Ok(RequeueStatus::NotFound);
            };
            return match due {
                None => {
                    tx.rollback().await?;
                    let mut conn = self.pool.acquire().await?;
                    self.notify(&mut conn, None).await?;
                    Ok(RequeueStatus::Requeued)
                }
                Some(due) => {
                    self.rollback_to_dequeue(&mut *tx).await?;
                    let done = sqlx::query(&self.sql.delay_unclaimed)
                        .bind(queue_id)
                        .bind(due)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(requeued(done.rows_affected()))
                }
            };
        }

        let token = handle.lease.token;
        match due {
            None => {
                let mut tx = self.pool.begin().await?;
                let route: Option<(Option<String>,)> = sqlx::query_as(&self.sql.requeue)
                    .bind(queue_id)
                    .bind(token)
                    .fetch_optional(&mut *tx)
                    .await?;
                let Some((route,)) = route else {
                    return Ok(RequeueStatus::NotFound);
                };
                self.notify(&mut *tx, route.as_deref()).await?;
                tx.commit().await?;
                Ok(RequeueStatus::Requeued)
            }
            Some(due) => {
                let done = sqlx::query(&self.sql.requeue_delayed)
                    .bind(queue_id)
                    .bind(due)
                    .bind(token)
                    .execute(&self.pool)
                    .await?;
                Ok(requeued(done.rows_affected()))
            }
        }
    }

    async fn record_failure(&self, id: &MessageId, exception_type: &str) -> Result<Option<u32>> {
        let result: std::result::Result<Option<(i32,)>, sqlx::Error> =
            sqlx::query_as(&self.sql.record_failure)
                .bind(id.as_sequence()?)
                .bind(exception_type)
                .fetch_optional(&self.pool)
                .await;
        match result {
            Ok(row) => Ok(row.map(|(count,)| count.max(0) as u32)),
            // Deleted between the existence check and the insert.
            Err(e) if has_code(&e, FOREIGN_KEY_VIOLATION) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn move_to_error(
        &self,
        handle: &mut PgHandle,
        failure: &Failure,
    ) -> Result<RemoveStatus> {
        let queue_id = handle.queue_id;
        if !self.held() {
            let mut conn = self.pool.acquire().await?;
            return self
                .move_to_error_with(
                    &mut conn,
                    queue_id,
                    failure,
                    MessageState::Working,
                    Some(handle.lease.token),
                )
                .await;
        }
        let Some(mut tx) = handle.holder.release() else {
            return Ok(RemoveStatus::NotFound);
        };
        self.rollback_to_dequeue(&mut *tx).await?;
        let status = self
            .move_to_error_with(&mut *tx, queue_id, failure, MessageState::Pending, None)
            .await?;
        tx.commit().await?;
        Ok(status)
    }

    async fn remove(&self, id: &MessageId) -> Result<RemoveStatus> {
        let done = sqlx::query(&self.sql.delete)
            .bind(id.as_sequence()?)
            .execute(&self.pool)
            .await?;
        Ok(removed(done.rows_affected()))
    }

    async fn reset_heartbeats(&self, window: Duration, limit: usize) -> Result<u64> {
        let threshold = self.clock.now() - to_delta(window);
        self.sweep(&self.sql.reset_heartbeats, threshold, limit, true)
            .await
    }

    async fn promote_delayed(&self, limit: usize) -> Result<u64> {
        self.sweep(&self.sql.promote_delayed, self.clock.now(), limit, true)
            .await
    }

    async fn purge_expired(&self, limit: usize) -> Result<u64> {
        self.sweep(&self.sql.purge_expired, self.clock.now(), limit, false)
            .await
    }

    async fn purge_errors(&self, retention: Duration, limit: usize) -> Result<u64> {
        let threshold = self.clock.now() - to_delta(retention);
        self.sweep(&self.sql.purge_errors, threshold, limit, false)
            .await
    }

    async fn state_of(&self, id: &MessageId) -> Result<Option<MessageState>> {
        let queue_id = id.as_sequence()?;
        let status: Option<(i16,)> = sqlx::query_as(&self.sql.status_of)
            .bind(queue_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some((code,)) = status {
            return MessageState::from_status_code(code).map(Some);
        }
        let (in_errors,): (bool,) = sqlx::query_as(&self.sql.in_errors)
            .bind(queue_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(in_errors.then_some(MessageState::Error))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows: Vec<(i16, i64)> = sqlx::query_as(&self.sql.count_active)
            .fetch_all(&self.pool)
            .await?;
        let (errors,): (i64,) = sqlx::query_as(&self.sql.count_errors)
            .fetch_one(&self.pool)
            .await?;
        let mut counts = QueueCounts {
            error: errors as u64,
            ..Default::default()
        };
        for (code, n) in rows {
            let n = n as u64;
            match MessageState::from_status_code(code)? {
                MessageState::Pending => counts.pending += n,
                MessageState::Working => counts.working += n,
                MessageState::Delayed => counts.delayed += n,
                MessageState::Error => counts.error += n,
            }
        }
        Ok(counts)
    }
}

fn has_code(e: &sqlx::Error, code: &str) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(code),
        _ => false,
    }
}

fn removed(rows: u64) -> RemoveStatus {
    if rows > 0 {
        RemoveStatus::Removed
    } else {
        RemoveStatus::NotFound
    }
}

fn requeued(rows: u64) -> RequeueStatus {
    if rows > 0 {
        RequeueStatus::Requeued
    } else {
        RequeueStatus::NotFound
    }
}

//! Postgres-backed job repository.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE job_events (
//!     tenant_id   TEXT        NOT NULL,
//!     job_id      TEXT        NOT NULL,
//!     sequence    BIGINT      NOT NULL CHECK (sequence > 0),
//!     queue_id    TEXT        NOT NULL,
//!     state       TEXT        NOT NULL,
//!     prev_state  TEXT,
//!     occurred_at TIMESTAMPTZ NOT NULL,
//!     payload     JSONB,
//!     recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (tenant_id, job_id, sequence)
//! );
//!
//! CREATE TABLE queue_signals (
//!     id          BIGSERIAL   PRIMARY KEY,
//!     queue_id    TEXT        NOT NULL,
//!     state       TEXT        NOT NULL,
//!     occurred_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! The primary key is the idempotency key: a redelivered event hits
//! `ON CONFLICT DO NOTHING` and is reported as a duplicate.
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | PoolClosed, PoolTimedOut, Io | `Unavailable` |
//! | Database with a transient SQLSTATE (08xxx, 40001, 40P01, 53xxx, 57P0x) | `Unavailable` |
//! | Other database errors, decode errors, other | `Storage` |
//!
//! The tracker retries `Unavailable` and skips events that fail with `Storage`.
//!
//! ## Runtime
//!
//! The async methods can be used directly. The synchronous [`JobRepository`]
//! impl runs them on the runtime handle given at construction, so it must be
//! called from a thread that is not itself driving that runtime (the tracker
//! runs on its own thread).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use dmq_core::{JobId, QueueId, TenantId};
use dmq_events::{AppendOutcome, JobEvent, JobKey, JobRecord, JobState, QueueSignal};

use super::query::{JobFilter, JobQuery, JobQueryResult, JobSummary, Pagination};
use super::{JobRepository, RepositoryError};
use crate::config::{DmqConfig, ENV_DATABASE_URL};

const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
    handle: tokio::runtime::Handle,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool, handle: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Repository on the configured database. Connections are opened on
    /// first use, so this succeeds while the database is still down.
    pub fn from_config(
        config: &DmqConfig,
        handle: tokio::runtime::Handle,
    ) -> Result<Self, RepositoryError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| RepositoryError::Storage(format!("{ENV_DATABASE_URL} is not set")))?;

        let pool = {
            let _runtime = handle.enter();
            PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .connect_lazy(url)
                .map_err(|e| map_sqlx_error("connect", e))?
        };
        Ok(Self::new(pool, handle))
    }

    #[instrument(skip(self), err)]
    pub async fn check_connection(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }

    /// Load all events of a job in sequence order.
    #[instrument(
        skip(self),
        fields(tenant_id = %key.tenant_id, job_id = %key.job_id, event_count = tracing::field::Empty),
        err
    )]
    pub async fn load_events(&self, key: &JobKey) -> Result<Vec<JobEvent>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, job_id, sequence, queue_id, state, prev_state, occurred_at, payload
            FROM job_events
            WHERE tenant_id = $1 AND job_id = $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(key.tenant_id.as_str())
        .bind(key.job_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_events", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(JobEventRow::from_row(&row)?.into_event()?);
        }

        Span::current().record("event_count", events.len());
        Ok(events)
    }

    #[instrument(
        skip(self, event),
        fields(
            tenant_id = %event.tenant_id,
            job_id = %event.job_id,
            sequence = event.sequence,
            state = %event.state
        ),
        err
    )]
    pub async fn insert_event(&self, event: &JobEvent) -> Result<AppendOutcome, RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_events (
                tenant_id, job_id, sequence, queue_id, state, prev_state, occurred_at, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, job_id, sequence) DO NOTHING
            "#,
        )
        .bind(event.tenant_id.as_str())
        .bind(event.job_id.as_str())
        .bind(event.sequence as i64)
        .bind(event.queue_id.as_str())
        .bind(event.state.as_str())
        .bind(event.prev_state.map(JobState::as_str))
        .bind(event.timestamp)
        .bind(&event.payload)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;

        if result.rows_affected() == 0 {
            Ok(AppendOutcome::Duplicate)
        } else {
            Ok(AppendOutcome::Appended)
        }
    }

    #[instrument(skip(self), fields(queue_id = %signal.queue_id, state = %signal.state), err)]
    pub async fn insert_signal(&self, signal: &QueueSignal) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO queue_signals (queue_id, state, occurred_at) VALUES ($1, $2, $3)")
            .bind(signal.queue_id.as_str())
            .bind(signal.state.as_str())
            .bind(signal.timestamp)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_signal", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue_id = %queue_id), err)]
    pub async fn load_signals(&self, queue_id: &QueueId) -> Result<Vec<QueueSignal>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT queue_id, state, occurred_at FROM queue_signals WHERE queue_id = $1 ORDER BY id ASC",
        )
        .bind(queue_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_signals", e))?;

        let mut signals = Vec::with_capacity(rows.len());
        for row in rows {
            let queue_id: String = row.try_get("queue_id").map_err(decode_error)?;
            let state: String = row.try_get("state").map_err(decode_error)?;
            let timestamp: DateTime<Utc> = row.try_get("occurred_at").map_err(decode_error)?;
            signals.push(QueueSignal {
                queue_id: QueueId::new(queue_id).map_err(|e| RepositoryError::Storage(e.to_string()))?,
                state: parse_state(&state)?,
                timestamp,
            });
        }
        Ok(signals)
    }
}

impl JobRepository for PostgresJobRepository {
    fn ping(&self) -> Result<(), RepositoryError> {
        self.handle.block_on(self.check_connection())
    }

    fn find_job_by_id(&self, key: &JobKey) -> Result<Option<JobRecord>, RepositoryError> {
        let events = self.handle.block_on(self.load_events(key))?;
        Ok(JobRecord::from_events(events)?)
    }

    fn append_event(&self, event: JobEvent) -> Result<AppendOutcome, RepositoryError> {
        self.handle.block_on(self.insert_event(&event))
    }

    fn record_queue_signal(&self, signal: QueueSignal) -> Result<(), RepositoryError> {
        self.handle.block_on(self.insert_signal(&signal))
    }

    fn queue_signals(&self, queue_id: &QueueId) -> Result<Vec<QueueSignal>, RepositoryError> {
        self.handle.block_on(self.load_signals(queue_id))
    }
}

#[async_trait::async_trait]
impl JobQuery for PostgresJobRepository {
    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<JobQueryResult, RepositoryError> {
        let queue_param: Option<&str> = filter.queue_id.as_ref().map(QueueId::as_str);
        let state_param: Option<&str> = filter.state.map(JobState::as_str);

        // Latest event per job, plus its event count.
        const JOBS: &str = r#"
            WITH latest AS (
                SELECT DISTINCT ON (job_id)
                    job_id, tenant_id, queue_id, state, sequence, occurred_at
                FROM job_events
                WHERE tenant_id = $1
                ORDER BY job_id, sequence DESC
            ),
            counts AS (
                SELECT job_id, COUNT(*) AS event_count
                FROM job_events
                WHERE tenant_id = $1
                GROUP BY job_id
            )
            SELECT l.job_id, l.tenant_id, l.queue_id, l.state, l.sequence, l.occurred_at, c.event_count
            FROM latest l
            JOIN counts c USING (job_id)
            WHERE ($2::text IS NULL OR l.queue_id = $2)
                AND ($3::text IS NULL OR l.state = $3)
                AND ($4::timestamptz IS NULL OR l.occurred_at >= $4)
        "#;

        let count_row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM ({JOBS}) jobs"))
            .bind(tenant_id.as_str())
            .bind(queue_param)
            .bind(state_param)
            .bind(filter.updated_after)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = count_row.try_get("total").map_err(decode_error)?;

        let rows = sqlx::query(&format!(
            "{JOBS} ORDER BY l.occurred_at DESC, l.job_id ASC LIMIT $5 OFFSET $6"
        ))
        .bind(tenant_id.as_str())
        .bind(queue_param)
        .bind(state_param)
        .bind(filter.updated_after)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job_id: String = row.try_get("job_id").map_err(decode_error)?;
            let tenant: String = row.try_get("tenant_id").map_err(decode_error)?;
            let queue_id: String = row.try_get("queue_id").map_err(decode_error)?;
            let state: String = row.try_get("state").map_err(decode_error)?;
            let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
            let updated_at: DateTime<Utc> = row.try_get("occurred_at").map_err(decode_error)?;
            let event_count: i64 = row.try_get("event_count").map_err(decode_error)?;

            jobs.push(JobSummary {
                job_id: parse_id(job_id)?,
                tenant_id: parse_id(tenant)?,
                queue_id: parse_id(queue_id)?,
                state: parse_state(&state)?,
                event_count: event_count as u64,
                last_sequence: sequence as u64,
                updated_at,
            });
        }

        let has_more = total > i64::from(pagination.offset) + i64::from(pagination.limit);

        Ok(JobQueryResult {
            jobs,
            total: total as u64,
            pagination,
            has_more,
        })
    }
}

// SQLx row types

#[derive(Debug)]
struct JobEventRow {
    tenant_id: String,
    job_id: String,
    sequence: i64,
    queue_id: String,
    state: String,
    prev_state: Option<String>,
    occurred_at: DateTime<Utc>,
    payload: Option<serde_json::Value>,
}

impl JobEventRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, RepositoryError> {
        Ok(Self {
            tenant_id: row.try_get("tenant_id").map_err(decode_error)?,
            job_id: row.try_get("job_id").map_err(decode_error)?,
            sequence: row.try_get("sequence").map_err(decode_error)?,
            queue_id: row.try_get("queue_id").map_err(decode_error)?,
            state: row.try_get("state").map_err(decode_error)?,
            prev_state: row.try_get("prev_state").map_err(decode_error)?,
            occurred_at: row.try_get("occurred_at").map_err(decode_error)?,
            payload: row.try_get("payload").map_err(decode_error)?,
        })
    }

    fn into_event(self) -> Result<JobEvent, RepositoryError> {
        Ok(JobEvent {
            job_id: parse_id::<JobId>(self.job_id)?,
            tenant_id: parse_id::<TenantId>(self.tenant_id)?,
            queue_id: parse_id::<QueueId>(self.queue_id)?,
            sequence: self.sequence as u64,
            state: parse_state(&self.state)?,
            timestamp: self.occurred_at,
            prev_state: self.prev_state.as_deref().map(parse_state).transpose()?,
            payload: self.payload,
        })
    }
}

fn parse_id<T>(value: String) -> Result<T, RepositoryError>
where
    T: TryFrom<String>,
    T::Error: std::fmt::Display,
{
    T::try_from(value).map_err(|e| RepositoryError::Storage(format!("invalid stored id: {e}")))
}

fn parse_state(value: &str) -> Result<JobState, RepositoryError> {
    value.parse().map_err(RepositoryError::Storage)
}

fn decode_error(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to RepositoryError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::PoolClosed => {
            RepositoryError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            RepositoryError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => RepositoryError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            let message = format!("database error in {operation}: {}", db_err.message());
            match db_err.code() {
                Some(code) if is_transient_sqlstate(&code) => RepositoryError::Unavailable(message),
                _ => RepositoryError::Storage(message),
            }
        }
        other => RepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Connection loss, serialization conflicts, resource exhaustion and
/// server shutdown go away on their own.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P0")
        || code == "40001"
        || code == "40P01"
}

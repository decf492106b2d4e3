//! Job Lifecycle Tracker.
//!
//! Consumes the lifecycle-event stream of a queue and materializes one
//! ordered, append-only [`JobRecord`] per `(tenant, job)`.
//!
//! ## Components
//!
//! - `JobRepository`: storage boundary (in-memory or Postgres)
//! - `JobLifecycleTracker`: typed dispatch of lifecycle events into the
//!   repository, and the subscriber loop that feeds it
//! - `JobQuery`: async, tenant-scoped inspection API

pub mod in_memory;
pub mod lifecycle_tracker;
pub mod postgres;
pub mod query;

use std::sync::Arc;

use dmq_core::QueueId;
use dmq_events::{AppendOutcome, JobEvent, JobKey, JobRecord, QueueSignal, RecordError};

pub use in_memory::InMemoryJobRepository;
pub use lifecycle_tracker::{
    JobLifecycleTracker, TrackedEvent, TrackerConfig, TrackerError, TrackerHandle, TrackerStats,
};
pub use postgres::PostgresJobRepository;
pub use query::{JobFilter, JobQuery, JobQueryResult, JobSummary, Pagination};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// The store cannot be reached right now; retrying may help.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("job store error: {0}")]
    Storage(String),
}

impl RepositoryError {
    /// Only an unreachable store is worth retrying; anything else fails the
    /// same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

/// Storage used by the tracker.
pub trait JobRepository: Send + Sync {
    /// Succeeds when the store is reachable.
    fn ping(&self) -> Result<(), RepositoryError>;

    fn find_job_by_id(&self, key: &JobKey) -> Result<Option<JobRecord>, RepositoryError>;

    /// Append an event, idempotent on `(tenant_id, job_id, sequence)`.
    fn append_event(&self, event: JobEvent) -> Result<AppendOutcome, RepositoryError>;

    fn record_queue_signal(&self, signal: QueueSignal) -> Result<(), RepositoryError>;

    /// Signals recorded for a queue, oldest first.
    fn queue_signals(&self, queue_id: &QueueId) -> Result<Vec<QueueSignal>, RepositoryError>;
}

impl<R> JobRepository for Arc<R>
where
    R: JobRepository + ?Sized,
{
    fn ping(&self) -> Result<(), RepositoryError> {
        (**self).ping()
    }

    fn find_job_by_id(&self, key: &JobKey) -> Result<Option<JobRecord>, RepositoryError> {
        (**self).find_job_by_id(key)
    }

    fn append_event(&self, event: JobEvent) -> Result<AppendOutcome, RepositoryError> {
        (**self).append_event(event)
    }

    fn record_queue_signal(&self, signal: QueueSignal) -> Result<(), RepositoryError> {
        (**self).record_queue_signal(signal)
    }

    fn queue_signals(&self, queue_id: &QueueId) -> Result<Vec<QueueSignal>, RepositoryError> {
        (**self).queue_signals(queue_id)
    }
}

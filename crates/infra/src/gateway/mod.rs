//! Queue gateway: the boundary between the core and the broker.
//!
//! Sending, leasing, rescheduling and acknowledging jobs all go through
//! [`QueueGateway`]. The core never touches broker internals directly.
//!
//! ## Components
//!
//! - `QueueGateway`: one gateway per queue
//! - `InMemoryBroker`: broker for tests/dev that emits lifecycle events on
//!   every transition

pub mod in_memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use dmq_core::{JobId, LeaseToken, QueueId, TenantId};
use dmq_events::Envelope;

pub use in_memory::InMemoryBroker;

/// Options accepted by [`QueueGateway::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Reusing a job id is the broker's de-duplication point.
    pub job_id: JobId,
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub name: String,
    /// `true` when a job with this id already existed and nothing was added.
    pub deduplicated: bool,
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedJob {
    pub job_id: JobId,
    pub name: String,
    pub tenant_id: TenantId,
    pub queue_id: QueueId,
    pub envelope: Envelope<JsonValue>,
    /// How many times this job has been leased, including this lease.
    pub attempts: u32,
}

/// A lease on a job: the job plus the token that proves ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub job: LeasedJob,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

/// Broker-side status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// Inspection view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub name: String,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    pub attempts: u32,
    pub due_at: Option<DateTime<Utc>>,
    /// Last value written through [`QueueGateway::update_progress`].
    pub progress: Option<JsonValue>,
    pub return_value: Option<JsonValue>,
    pub failed_reason: Option<String>,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("job not found: {0}")]
    UnknownJob(JobId),
    /// The presented token is not the job's current lease token.
    #[error("lease token does not match the current lease of job {0}")]
    LeaseMismatch(JobId),
    /// The token matches but its lease ran out; the job is about to be
    /// reported as stalled.
    #[error("lease on job {0} has expired")]
    LeaseExpired(JobId),
    #[error("job {job_id} is {status:?}, not active")]
    NotActive { job_id: JobId, status: JobStatus },
    #[error("failed to publish lifecycle event: {0}")]
    Publish(String),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Broker operations for a single queue.
pub trait QueueGateway: Send + Sync {
    fn queue_id(&self) -> &QueueId;

    /// Succeeds once the broker accepts commands.
    fn ping(&self) -> Result<(), GatewayError>;

    fn enqueue(
        &self,
        name: &str,
        payload: Envelope<JsonValue>,
        options: EnqueueOptions,
    ) -> Result<JobHandle, GatewayError>;

    /// Lease the next ready job, if any. Returns `None` while paused.
    fn lease(&self) -> Result<Option<Lease>, GatewayError>;

    /// Reschedule a leased job; it is not leased again before `due_at`.
    fn move_to_delayed(
        &self,
        job_id: &JobId,
        due_at: DateTime<Utc>,
        token: &LeaseToken,
    ) -> Result<(), GatewayError>;

    fn complete(
        &self,
        job_id: &JobId,
        return_value: JsonValue,
        token: &LeaseToken,
    ) -> Result<(), GatewayError>;

    fn fail(&self, job_id: &JobId, error: &str, token: &LeaseToken) -> Result<(), GatewayError>;

    /// Heartbeat: push the lease expiry forward. Fails once the lease has
    /// expired.
    fn extend_lease(&self, job_id: &JobId, token: &LeaseToken) -> Result<DateTime<Utc>, GatewayError>;

    /// Observability-only side channel; has no effect on state.
    fn update_progress(&self, job_id: &JobId, progress: JsonValue) -> Result<(), GatewayError>;

    /// Stop granting leases. In-flight work is not cancelled.
    fn pause(&self) -> Result<(), GatewayError>;

    fn resume(&self) -> Result<(), GatewayError>;

    fn is_paused(&self) -> Result<bool, GatewayError>;

    fn job(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, GatewayError>;

    fn delayed_count(&self) -> Result<usize, GatewayError> {
        Ok(self.counts()?.delayed)
    }

    fn counts(&self) -> Result<JobCounts, GatewayError>;
}

impl<G> QueueGateway for Arc<G>
where
    G: QueueGateway + ?Sized,
{
    fn queue_id(&self) -> &QueueId {
        (**self).queue_id()
    }

    fn ping(&self) -> Result<(), GatewayError> {
        (**self).ping()
    }

    fn enqueue(
        &self,
        name: &str,
        payload: Envelope<JsonValue>,
        options: EnqueueOptions,
    ) -> Result<JobHandle, GatewayError> {
        (**self).enqueue(name, payload, options)
    }

    fn lease(&self) -> Result<Option<Lease>, GatewayError> {
        (**self).lease()
    }

    fn move_to_delayed(
        &self,
        job_id: &JobId,
        due_at: DateTime<Utc>,
        token: &LeaseToken,
    ) -> Result<(), GatewayError> {
        (**self).move_to_delayed(job_id, due_at, token)
    }

    fn complete(
        &self,
        job_id: &JobId,
        return_value: JsonValue,
        token: &LeaseToken,
    ) -> Result<(), GatewayError> {
        (**self).complete(job_id, return_value, token)
    }

    fn fail(&self, job_id: &JobId, error: &str, token: &LeaseToken) -> Result<(), GatewayError> {
        (**self).fail(job_id, error, token)
    }

    fn extend_lease(&self, job_id: &JobId, token: &LeaseToken) -> Result<DateTime<Utc>, GatewayError> {
        (**self).extend_lease(job_id, token)
    }

    fn update_progress(&self, job_id: &JobId, progress: JsonValue) -> Result<(), GatewayError> {
        (**self).update_progress(job_id, progress)
    }

    fn pause(&self) -> Result<(), GatewayError> {
        (**self).pause()
    }

    fn resume(&self) -> Result<(), GatewayError> {
        (**self).resume()
    }

    fn is_paused(&self) -> Result<bool, GatewayError> {
        (**self).is_paused()
    }

    fn job(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, GatewayError> {
        (**self).job(job_id)
    }

    fn delayed_count(&self) -> Result<usize, GatewayError> {
        (**self).delayed_count()
    }

    fn counts(&self) -> Result<JobCounts, GatewayError> {
        (**self).counts()
    }
}

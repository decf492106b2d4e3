//! Job lifecycle events.
//!
//! Every state transition a job goes through is emitted by the broker as a
//! [`LifecycleEvent`]. Consumers (the tracker, monitoring listeners) receive
//! them as a tagged union and dispatch on the variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use dmq_core::{JobId, QueueId, TenantId};

/// State a job (or, for `paused`/`resumed`, a queue) is in after a transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Added,
    Active,
    Delayed,
    Completed,
    Failed,
    Stalled,
    Paused,
    Resumed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Added => "added",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
            JobState::Paused => "paused",
            JobState::Resumed => "resumed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "added" => JobState::Added,
            "active" => JobState::Active,
            "delayed" => JobState::Delayed,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "stalled" => JobState::Stalled,
            "paused" => JobState::Paused,
            "resumed" => JobState::Resumed,
            other => return Err(format!("unknown job state `{other}`")),
        })
    }
}

/// Identity and position of a job transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub queue_id: QueueId,
    /// Per-job position, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// A transition emitted by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Added {
        job: JobRef,
        name: String,
    },
    Active {
        job: JobRef,
        #[serde(rename = "prevState", default, skip_serializing_if = "Option::is_none")]
        prev_state: Option<JobState>,
    },
    Delayed {
        job: JobRef,
        due_at: DateTime<Utc>,
    },
    Completed {
        job: JobRef,
        #[serde(rename = "returnvalue")]
        return_value: JsonValue,
        #[serde(rename = "prevState", default, skip_serializing_if = "Option::is_none")]
        prev_state: Option<JobState>,
    },
    Failed {
        job: JobRef,
        error: String,
        #[serde(rename = "prevState", default, skip_serializing_if = "Option::is_none")]
        prev_state: Option<JobState>,
    },
    Stalled {
        job: JobRef,
    },
    Paused {
        queue_id: QueueId,
        timestamp: DateTime<Utc>,
    },
    Resumed {
        queue_id: QueueId,
        timestamp: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn state(&self) -> JobState {
        match self {
            LifecycleEvent::Added { .. } => JobState::Added,
            LifecycleEvent::Active { .. } => JobState::Active,
            LifecycleEvent::Delayed { .. } => JobState::Delayed,
            LifecycleEvent::Completed { .. } => JobState::Completed,
            LifecycleEvent::Failed { .. } => JobState::Failed,
            LifecycleEvent::Stalled { .. } => JobState::Stalled,
            LifecycleEvent::Paused { .. } => JobState::Paused,
            LifecycleEvent::Resumed { .. } => JobState::Resumed,
        }
    }

    /// The job this event belongs to; `None` for queue-level signals.
    pub fn job(&self) -> Option<&JobRef> {
        match self {
            LifecycleEvent::Added { job, .. }
            | LifecycleEvent::Active { job, .. }
            | LifecycleEvent::Delayed { job, .. }
            | LifecycleEvent::Completed { job, .. }
            | LifecycleEvent::Failed { job, .. }
            | LifecycleEvent::Stalled { job } => Some(job),
            LifecycleEvent::Paused { .. } | LifecycleEvent::Resumed { .. } => None,
        }
    }

    pub fn queue_id(&self) -> &QueueId {
        match self {
            LifecycleEvent::Paused { queue_id, .. } | LifecycleEvent::Resumed { queue_id, .. } => {
                queue_id
            }
            LifecycleEvent::Added { job, .. }
            | LifecycleEvent::Active { job, .. }
            | LifecycleEvent::Delayed { job, .. }
            | LifecycleEvent::Completed { job, .. }
            | LifecycleEvent::Failed { job, .. }
            | LifecycleEvent::Stalled { job } => &job.queue_id,
        }
    }
}

/// Key of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub tenant_id: TenantId,
    pub job_id: JobId,
}

impl JobKey {
    pub fn new(tenant_id: TenantId, job_id: JobId) -> Self {
        Self { tenant_id, job_id }
    }
}

/// A single recorded state transition of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub queue_id: QueueId,
    pub sequence: u64,
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl JobEvent {
    pub fn new(job: &JobRef, state: JobState) -> Self {
        Self {
            job_id: job.job_id.clone(),
            tenant_id: job.tenant_id.clone(),
            queue_id: job.queue_id.clone(),
            sequence: job.sequence,
            state,
            timestamp: job.timestamp,
            prev_state: None,
            payload: None,
        }
    }

    pub fn with_prev_state(mut self, prev_state: Option<JobState>) -> Self {
        self.prev_state = prev_state;
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.tenant_id.clone(), self.job_id.clone())
    }
}

/// A queue-level `paused`/`resumed` signal.
///
/// Delivery is best-effort: absence of a signal says nothing about the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSignal {
    pub queue_id: QueueId,
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
}

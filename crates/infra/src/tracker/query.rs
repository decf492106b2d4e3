//! Job query interface for inspection and debugging.
//!
//! Read-only, tenant-scoped and paginated by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dmq_core::{JobId, QueueId, TenantId};
use dmq_events::{JobRecord, JobState};

use super::RepositoryError;

/// Pagination parameters for job queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of jobs to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for job queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub queue_id: Option<QueueId>,
    /// Current (derived) state of the job.
    pub state: Option<JobState>,
    /// Jobs whose last event happened at or after this time.
    pub updated_after: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobSummary) -> bool {
        self.queue_id.as_ref().is_none_or(|q| *q == job.queue_id)
            && self.state.is_none_or(|s| s == job.state)
            && self.updated_after.is_none_or(|t| job.updated_at >= t)
    }
}

/// One row of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub queue_id: QueueId,
    pub state: JobState,
    pub event_count: u64,
    pub last_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

impl JobSummary {
    /// Summary of a record. `None` only for an empty record.
    pub fn of(record: &JobRecord) -> Option<Self> {
        let last = record.events().last()?;
        Some(Self {
            job_id: record.job_id().clone(),
            tenant_id: record.tenant_id().clone(),
            queue_id: last.queue_id.clone(),
            state: record.state(),
            event_count: record.len() as u64,
            last_sequence: last.sequence,
            updated_at: last.timestamp,
        })
    }
}

/// Paginated job query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueryResult {
    pub jobs: Vec<JobSummary>,
    /// Total number of jobs matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Async query interface for job inspection.
///
/// Results are ordered by `updated_at` (descending), then `job_id`.
#[async_trait::async_trait]
pub trait JobQuery: Send + Sync {
    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<JobQueryResult, RepositoryError>;
}

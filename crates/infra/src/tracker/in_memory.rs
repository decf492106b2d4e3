//! In-memory job repository for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dmq_core::{QueueId, TenantId};
use dmq_events::{AppendOutcome, JobEvent, JobKey, JobRecord, QueueSignal};

use super::query::{JobFilter, JobQuery, JobQueryResult, JobSummary, Pagination};
use super::{JobRepository, RepositoryError};

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    records: RwLock<HashMap<JobKey, JobRecord>>,
    signals: RwLock<Vec<QueueSignal>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> RepositoryError {
        RepositoryError::Unavailable("in-memory job store poisoned".to_string())
    }
}

impl JobRepository for InMemoryJobRepository {
    fn ping(&self) -> Result<(), RepositoryError> {
        self.records.read().map(|_| ()).map_err(|_| Self::poisoned())
    }

    fn find_job_by_id(&self, key: &JobKey) -> Result<Option<JobRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(key).cloned())
    }

    fn append_event(&self, event: JobEvent) -> Result<AppendOutcome, RepositoryError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        match records.get_mut(&event.key()) {
            Some(record) => Ok(record.append(event)?),
            None => {
                let record = JobRecord::from_event(event);
                records.insert(record.key(), record);
                Ok(AppendOutcome::Appended)
            }
        }
    }

    fn record_queue_signal(&self, signal: QueueSignal) -> Result<(), RepositoryError> {
        let mut signals = self.signals.write().map_err(|_| Self::poisoned())?;
        signals.push(signal);
        Ok(())
    }

    fn queue_signals(&self, queue_id: &QueueId) -> Result<Vec<QueueSignal>, RepositoryError> {
        let signals = self.signals.read().map_err(|_| Self::poisoned())?;
        Ok(signals
            .iter()
            .filter(|s| &s.queue_id == queue_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl JobQuery for InMemoryJobRepository {
    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<JobQueryResult, RepositoryError> {
        let mut jobs: Vec<JobSummary> = {
            let records = self.records.read().map_err(|_| Self::poisoned())?;
            records
                .values()
                .filter(|r| r.tenant_id() == &tenant_id)
                .filter_map(JobSummary::of)
                .filter(|j| filter.matches(j))
                .collect()
        };

        jobs.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        let total = jobs.len() as u64;
        let jobs: Vec<JobSummary> = jobs
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);

        Ok(JobQueryResult {
            jobs,
            total,
            pagination,
            has_more,
        })
    }
}

//! Materialized per-job event log.
//!
//! The log is the source of truth; a record's state is always derived from
//! it and never stored on its own.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

use dmq_core::{JobId, TenantId};

use crate::lifecycle::{JobEvent, JobKey, JobState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("event for {found_tenant}/{found_job} appended to record {tenant}/{job}")]
    KeyMismatch {
        tenant: TenantId,
        job: JobId,
        found_tenant: TenantId,
        found_job: JobId,
    },
}

/// Result of appending an event to a record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An event with the same sequence was already recorded; nothing changed.
    Duplicate,
}

/// Ordered event log of a single `(tenant, job)`.
///
/// Invariants:
/// - every event shares the record's tenant and job id
/// - events are strictly ordered by `sequence`
/// - the record is never empty
///
/// Serializes as `{ job_id, tenant_id, state, events }` with `state` derived
/// from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    job_id: JobId,
    tenant_id: TenantId,
    events: Vec<JobEvent>,
}

impl JobRecord {
    /// Start a record from the first observed event.
    pub fn from_event(event: JobEvent) -> Self {
        Self {
            job_id: event.job_id.clone(),
            tenant_id: event.tenant_id.clone(),
            events: vec![event],
        }
    }

    /// Rebuild a record from stored events in any order.
    ///
    /// Returns `None` when `events` is empty.
    pub fn from_events(events: impl IntoIterator<Item = JobEvent>) -> Result<Option<Self>, RecordError> {
        let mut events = events.into_iter();
        let Some(first) = events.next() else {
            return Ok(None);
        };
        let mut record = Self::from_event(first);
        for event in events {
            record.append(event)?;
        }
        Ok(Some(record))
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.tenant_id.clone(), self.job_id.clone())
    }

    pub fn events(&self) -> &[JobEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// State of the highest-sequence event.
    pub fn state(&self) -> JobState {
        self.events
            .last()
            .map(|e| e.state)
            .unwrap_or(JobState::Added)
    }

    pub fn last_sequence(&self) -> u64 {
        self.events.last().map(|e| e.sequence).unwrap_or(0)
    }

    /// Append an event, idempotent on `sequence`.
    ///
    /// An event that arrives late is inserted at its ordered position.
    pub fn append(&mut self, event: JobEvent) -> Result<AppendOutcome, RecordError> {
        if event.tenant_id != self.tenant_id || event.job_id != self.job_id {
            return Err(RecordError::KeyMismatch {
                tenant: self.tenant_id.clone(),
                job: self.job_id.clone(),
                found_tenant: event.tenant_id,
                found_job: event.job_id,
            });
        }

        match self
            .events
            .binary_search_by_key(&event.sequence, |e| e.sequence)
        {
            Ok(_) => Ok(AppendOutcome::Duplicate),
            Err(pos) => {
                self.events.insert(pos, event);
                Ok(AppendOutcome::Appended)
            }
        }
    }
}

impl Serialize for JobRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("JobRecord", 4)?;
        record.serialize_field("job_id", &self.job_id)?;
        record.serialize_field("tenant_id", &self.tenant_id)?;
        record.serialize_field("state", &self.state())?;
        record.serialize_field("events", &self.events)?;
        record.end()
    }
}

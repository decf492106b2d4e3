//! Job processing: the handler contract and the worker that drives it.
//!
//! A handler receives a leased job together with its lease token and returns
//! a [`JobOutcome`]. It never throws to signal "not ready yet": rescheduling
//! is an explicit outcome carrying the due time and the lease token it was
//! given.

pub mod worker;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use dmq_core::{JobId, LeaseToken};

use crate::gateway::{GatewayError, LeasedJob};

pub use worker::{Processed, Worker, WorkerConfig, WorkerHandle, WorkerStats};

/// Instruction to put a job back until `due_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reschedule {
    pub due_at: DateTime<Utc>,
    /// Must be the token the handler was invoked with.
    pub token: LeaseToken,
    /// Written to the job's progress after the move, for inspection only.
    pub progress: Option<JsonValue>,
}

impl Reschedule {
    pub fn new(due_at: DateTime<Utc>, token: LeaseToken) -> Self {
        Self {
            due_at,
            token,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: JsonValue) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// What a handler decided for one attempt.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(JsonValue),
    Delayed(Reschedule),
    Failed(anyhow::Error),
}

impl JobOutcome {
    pub fn delayed(due_at: DateTime<Utc>, token: LeaseToken) -> Self {
        JobOutcome::Delayed(Reschedule::new(due_at, token))
    }
}

impl<E> From<Result<JsonValue, E>> for JobOutcome
where
    E: Into<anyhow::Error>,
{
    fn from(result: Result<JsonValue, E>) -> Self {
        match result {
            Ok(value) => JobOutcome::Completed(value),
            Err(err) => JobOutcome::Failed(err.into()),
        }
    }
}

/// Processes leased jobs.
pub trait JobHandler: Send {
    fn process(&mut self, job: &LeasedJob, token: &LeaseToken) -> JobOutcome;
}

impl<F> JobHandler for F
where
    F: FnMut(&LeasedJob, &LeaseToken) -> JobOutcome + Send,
{
    fn process(&mut self, job: &LeasedJob, token: &LeaseToken) -> JobOutcome {
        self(job, token)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// A handler rescheduled with a token other than the one it was given.
    #[error("handler rescheduled job {job_id} with a lease token it does not hold")]
    LeaseMismatch { job_id: JobId },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn results_convert_into_outcomes() {
        let ok: Result<JsonValue, std::io::Error> = Ok(json!(1));
        assert!(matches!(JobOutcome::from(ok), JobOutcome::Completed(_)));

        let err: Result<JsonValue, std::io::Error> = Err(std::io::Error::other("down"));
        match JobOutcome::from(err) {
            JobOutcome::Failed(e) => assert_eq!(e.to_string(), "down"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn reschedule_carries_progress() {
        let token = LeaseToken::new();
        let r = Reschedule::new(Utc::now(), token).with_progress(json!({ "polls": 2 }));
        assert_eq!(r.token, token);
        assert_eq!(r.progress, Some(json!({ "polls": 2 })));
    }
}

//! In-memory broker for tests/dev.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use dmq_core::{JobId, LeaseToken, QueueId};
use dmq_events::{Envelope, EventBus, JobRef, JobState, LifecycleEvent};

use crate::config::{ConfigError, DmqConfig};

use super::{
    EnqueueOptions, GatewayError, JobCounts, JobHandle, JobSnapshot, JobStatus, Lease, LeasedJob,
    QueueGateway,
};

/// Default time a lease stays valid without a heartbeat.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Longest lease the broker grants; longer durations are clamped.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Completed and failed jobs kept for inspection and de-duplication.
pub const DEFAULT_FINISHED_RETENTION: usize = 10_000;

#[derive(Debug)]
struct JobEntry {
    job_id: JobId,
    name: String,
    envelope: Envelope<JsonValue>,
    status: JobStatus,
    /// State of the last emitted lifecycle event.
    last_state: JobState,
    /// Sequence of the last emitted lifecycle event.
    sequence: u64,
    attempts: u32,
    token: Option<LeaseToken>,
    lease_expires_at: Option<DateTime<Utc>>,
    due_at: Option<DateTime<Utc>>,
    progress: Option<JsonValue>,
    return_value: Option<JsonValue>,
    failed_reason: Option<String>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            name: self.name.clone(),
            tenant_id: self.envelope.tenant_id().clone(),
            status: self.status,
            attempts: self.attempts,
            due_at: self.due_at,
            progress: self.progress.clone(),
            return_value: self.return_value.clone(),
            failed_reason: self.failed_reason.clone(),
        }
    }

    /// A lease is honored only while it is active, matches and has not run out.
    fn check_lease(&self, token: &LeaseToken, now: DateTime<Utc>) -> Result<(), GatewayError> {
        if self.status != JobStatus::Active {
            return Err(GatewayError::NotActive {
                job_id: self.job_id.clone(),
                status: self.status,
            });
        }
        if self.token.as_ref() != Some(token) {
            return Err(GatewayError::LeaseMismatch(self.job_id.clone()));
        }
        if self.lease_expires_at.is_none_or(|at| at <= now) {
            return Err(GatewayError::LeaseExpired(self.job_id.clone()));
        }
        Ok(())
    }

    /// Drop the lease and return the expiry it was indexed under.
    fn release_lease(&mut self) -> Option<DateTime<Utc>> {
        self.token = None;
        self.lease_expires_at.take()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    jobs: HashMap<JobId, JobEntry>,
    waiting: VecDeque<JobId>,
    /// Active jobs ordered by lease expiry.
    leases: BTreeSet<(DateTime<Utc>, JobId)>,
    /// Delayed jobs ordered by due time.
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    /// Completed and failed jobs, oldest first.
    finished: VecDeque<JobId>,
    paused: bool,
}

impl BrokerState {
    fn unindex_lease(&mut self, expires_at: Option<DateTime<Utc>>, job_id: &JobId) {
        if let Some(at) = expires_at {
            self.leases.remove(&(at, job_id.clone()));
        }
    }

    /// Record a finished job and evict the oldest ones beyond `retention`.
    fn finish(&mut self, job_id: JobId, retention: usize) {
        self.finished.push_back(job_id);
        while self.finished.len() > retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }
}

fn lease_delta(lease_duration: Duration) -> chrono::Duration {
    let clamped = lease_duration.min(MAX_LEASE_DURATION);
    chrono::Duration::milliseconds(clamped.as_millis() as i64)
}

/// In-memory broker for a single queue.
///
/// - FIFO waiting list
/// - Lease tokens with expiry; an expired lease is reported as `stalled` the
///   next time a worker asks for a job, and the job goes back to waiting
/// - Delayed jobs are promoted to waiting once their due time has passed,
///   never earlier
/// - Enqueueing an existing job id is a no-op while that job is retained
///
/// Every transition is published to the bus while the broker lock is held,
/// so per-job event order matches transition order. Sequences are per job and
/// start at 1.
///
/// Leases and delays are indexed by deadline, so leasing only looks at jobs
/// whose deadline has passed. Finished jobs are kept up to a retention bound.
#[derive(Debug)]
pub struct InMemoryBroker<B> {
    queue_id: QueueId,
    bus: B,
    lease_duration: chrono::Duration,
    finished_retention: usize,
    state: Mutex<BrokerState>,
}

impl<B> InMemoryBroker<B>
where
    B: EventBus<LifecycleEvent>,
{
    pub fn new(queue_id: QueueId, bus: B) -> Self {
        Self {
            queue_id,
            bus,
            lease_duration: lease_delta(DEFAULT_LEASE_DURATION),
            finished_retention: DEFAULT_FINISHED_RETENTION,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Broker for the configured queue and lease duration.
    pub fn from_config(config: &DmqConfig, bus: B) -> Result<Self, ConfigError> {
        Ok(Self::new(config.queue_id()?, bus).with_lease_duration(config.lease_duration))
    }

    /// Durations above [`MAX_LEASE_DURATION`] are clamped.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        if lease_duration > MAX_LEASE_DURATION {
            warn!(
                queue_id = %self.queue_id,
                requested_ms = lease_duration.as_millis() as u64,
                max_ms = MAX_LEASE_DURATION.as_millis() as u64,
                "lease duration clamped"
            );
        }
        self.lease_duration = lease_delta(lease_duration);
        self
    }

    /// How many completed/failed jobs stay inspectable. Evicted ids can be
    /// enqueued again.
    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, GatewayError> {
        self.state
            .lock()
            .map_err(|_| GatewayError::Unavailable("broker state poisoned".to_string()))
    }

    fn emit(&self, event: LifecycleEvent) -> Result<(), GatewayError> {
        self.bus
            .publish(event)
            .map_err(|e| GatewayError::Publish(format!("{e:?}")))
    }

    /// Reference for the next event of `entry`; the caller bumps `sequence` once published.
    fn next_ref(&self, entry: &JobEntry, now: DateTime<Utc>) -> JobRef {
        JobRef {
            job_id: entry.job_id.clone(),
            tenant_id: entry.envelope.tenant_id().clone(),
            queue_id: self.queue_id.clone(),
            sequence: entry.sequence + 1,
            timestamp: now,
        }
    }

    /// Report expired leases as stalled and put those jobs back in line.
    fn reclaim_stalled(&self, state: &mut BrokerState, now: DateTime<Utc>) -> Result<(), GatewayError> {
        while let Some((at, job_id)) = state.leases.first().cloned() {
            if at > now {
                break;
            }
            let Some(entry) = state.jobs.get_mut(&job_id) else {
                state.leases.remove(&(at, job_id));
                continue;
            };
            let job = self.next_ref(entry, now);
            self.emit(LifecycleEvent::Stalled { job })?;

            warn!(queue_id = %self.queue_id, job_id = %job_id, "lease expired; job stalled");
            entry.sequence += 1;
            entry.last_state = JobState::Stalled;
            entry.status = JobStatus::Waiting;
            entry.release_lease();
            state.leases.remove(&(at, job_id.clone()));
            state.waiting.push_back(job_id);
        }
        Ok(())
    }

    /// Move delayed jobs whose due time has passed to the waiting list.
    fn promote_due(state: &mut BrokerState, now: DateTime<Utc>) {
        while let Some((at, job_id)) = state.delayed.first().cloned() {
            if at > now {
                break;
            }
            state.delayed.remove(&(at, job_id.clone()));
            if let Some(entry) = state.jobs.get_mut(&job_id) {
                entry.status = JobStatus::Waiting;
                entry.due_at = None;
                state.waiting.push_back(job_id);
            }
        }
    }

    fn set_paused(&self, paused: bool) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        if state.paused == paused {
            return Ok(());
        }

        let queue_id = self.queue_id.clone();
        let timestamp = Utc::now();
        let event = if paused {
            LifecycleEvent::Paused { queue_id, timestamp }
        } else {
            LifecycleEvent::Resumed { queue_id, timestamp }
        };
        state.paused = paused;

        // Queue signals are best-effort.
        if let Err(err) = self.emit(event) {
            warn!(queue_id = %self.queue_id, paused, error = %err, "queue signal not published");
        }
        Ok(())
    }
}

impl<B> QueueGateway for InMemoryBroker<B>
where
    B: EventBus<LifecycleEvent>,
{
    fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    fn ping(&self) -> Result<(), GatewayError> {
        self.lock().map(|_| ())
    }

    fn enqueue(
        &self,
        name: &str,
        payload: Envelope<JsonValue>,
        options: EnqueueOptions,
    ) -> Result<JobHandle, GatewayError> {
        let mut state = self.lock()?;
        let job_id = options.job_id;

        if state.jobs.contains_key(&job_id) {
            debug!(queue_id = %self.queue_id, job_id = %job_id, "duplicate enqueue ignored");
            return Ok(JobHandle {
                job_id,
                name: name.to_string(),
                deduplicated: true,
            });
        }

        let now = Utc::now();
        let mut entry = JobEntry {
            job_id: job_id.clone(),
            name: name.to_string(),
            envelope: payload,
            status: JobStatus::Waiting,
            last_state: JobState::Added,
            sequence: 0,
            attempts: 0,
            token: None,
            lease_expires_at: None,
            due_at: None,
            progress: None,
            return_value: None,
            failed_reason: None,
        };

        let job = self.next_ref(&entry, now);
        self.emit(LifecycleEvent::Added {
            job,
            name: name.to_string(),
        })?;
        entry.sequence = 1;

        state.jobs.insert(job_id.clone(), entry);
        state.waiting.push_back(job_id.clone());

        Ok(JobHandle {
            job_id,
            name: name.to_string(),
            deduplicated: false,
        })
    }

    fn lease(&self) -> Result<Option<Lease>, GatewayError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let now = Utc::now();

        self.reclaim_stalled(state, now)?;
        Self::promote_due(state, now);

        if state.paused {
            return Ok(None);
        }

        let Some(job_id) = state.waiting.pop_front() else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return Err(GatewayError::UnknownJob(job_id));
        };

        let job = self.next_ref(entry, now);
        let prev_state = Some(entry.last_state);
        if let Err(err) = self.emit(LifecycleEvent::Active { job, prev_state }) {
            state.waiting.push_front(job_id);
            return Err(err);
        }

        let token = LeaseToken::new();
        let expires_at = now + self.lease_duration;
        entry.sequence += 1;
        entry.last_state = JobState::Active;
        entry.status = JobStatus::Active;
        entry.attempts += 1;
        entry.token = Some(token);
        entry.lease_expires_at = Some(expires_at);

        let leased = LeasedJob {
            job_id: entry.job_id.clone(),
            name: entry.name.clone(),
            tenant_id: entry.envelope.tenant_id().clone(),
            queue_id: self.queue_id.clone(),
            envelope: entry.envelope.clone(),
            attempts: entry.attempts,
        };
        state.leases.insert((expires_at, job_id));

        Ok(Some(Lease {
            job: leased,
            token,
            expires_at,
        }))
    }

    fn move_to_delayed(
        &self,
        job_id: &JobId,
        due_at: DateTime<Utc>,
        token: &LeaseToken,
    ) -> Result<(), GatewayError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let now = Utc::now();
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| GatewayError::UnknownJob(job_id.clone()))?;
        entry.check_lease(token, now)?;

        let job = self.next_ref(entry, now);
        self.emit(LifecycleEvent::Delayed { job, due_at })?;

        entry.sequence += 1;
        entry.last_state = JobState::Delayed;
        entry.status = JobStatus::Delayed;
        entry.due_at = Some(due_at);
        let expired_at = entry.release_lease();

        state.unindex_lease(expired_at, job_id);
        state.delayed.insert((due_at, job_id.clone()));
        Ok(())
    }

    fn complete(
        &self,
        job_id: &JobId,
        return_value: JsonValue,
        token: &LeaseToken,
    ) -> Result<(), GatewayError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let now = Utc::now();
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| GatewayError::UnknownJob(job_id.clone()))?;
        entry.check_lease(token, now)?;

        let job = self.next_ref(entry, now);
        self.emit(LifecycleEvent::Completed {
            job,
            return_value: return_value.clone(),
            prev_state: Some(entry.last_state),
        })?;

        entry.sequence += 1;
        entry.last_state = JobState::Completed;
        entry.status = JobStatus::Completed;
        entry.return_value = Some(return_value);
        let expired_at = entry.release_lease();

        state.unindex_lease(expired_at, job_id);
        state.finish(job_id.clone(), self.finished_retention);
        Ok(())
    }

    fn fail(&self, job_id: &JobId, error: &str, token: &LeaseToken) -> Result<(), GatewayError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let now = Utc::now();
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| GatewayError::UnknownJob(job_id.clone()))?;
        entry.check_lease(token, now)?;

        let job = self.next_ref(entry, now);
        self.emit(LifecycleEvent::Failed {
            job,
            error: error.to_string(),
            prev_state: Some(entry.last_state),
        })?;

        entry.sequence += 1;
        entry.last_state = JobState::Failed;
        entry.status = JobStatus::Failed;
        entry.failed_reason = Some(error.to_string());
        let expired_at = entry.release_lease();

        state.unindex_lease(expired_at, job_id);
        state.finish(job_id.clone(), self.finished_retention);
        Ok(())
    }

    fn extend_lease(&self, job_id: &JobId, token: &LeaseToken) -> Result<DateTime<Utc>, GatewayError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let now = Utc::now();
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| GatewayError::UnknownJob(job_id.clone()))?;
        entry.check_lease(token, now)?;

        let expires_at = now + self.lease_duration;
        let previous = entry.lease_expires_at.replace(expires_at);

        state.unindex_lease(previous, job_id);
        state.leases.insert((expires_at, job_id.clone()));
        Ok(expires_at)
    }

    fn update_progress(&self, job_id: &JobId, progress: JsonValue) -> Result<(), GatewayError> {
        let mut state = self.lock()?;
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| GatewayError::UnknownJob(job_id.clone()))?;
        entry.progress = Some(progress);
        Ok(())
    }

    fn pause(&self) -> Result<(), GatewayError> {
        self.set_paused(true)
    }

    fn resume(&self) -> Result<(), GatewayError> {
        self.set_paused(false)
    }

    fn is_paused(&self) -> Result<bool, GatewayError> {
        Ok(self.lock()?.paused)
    }

    fn job(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, GatewayError> {
        Ok(self.lock()?.jobs.get(job_id).map(JobEntry::snapshot))
    }

    fn delayed_count(&self) -> Result<usize, GatewayError> {
        Ok(self.lock()?.delayed.len())
    }

    fn counts(&self) -> Result<JobCounts, GatewayError> {
        let state = self.lock()?;
        let mut counts = JobCounts::default();
        for entry in state.jobs.values() {
            match entry.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use dmq_events::{InMemoryEventBus, MessageDefinition, MessageSchema, ResumeFrom, build};

    type Bus = Arc<InMemoryEventBus<LifecycleEvent>>;

    fn broker() -> (InMemoryBroker<Bus>, Bus) {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let broker = InMemoryBroker::new(QueueId::new("jobs").unwrap(), bus.clone());
        (broker, bus)
    }

    fn envelope() -> Envelope<JsonValue> {
        build(
            &MessageDefinition::command("test.message.a"),
            &MessageSchema::envelope_default(),
            "tenantId",
            "",
            json!({}),
        )
        .unwrap()
    }

    fn enqueue(broker: &InMemoryBroker<Bus>, id: &str) -> JobId {
        let job_id = JobId::new(id).unwrap();
        broker
            .enqueue(
                "test.message.a",
                envelope(),
                EnqueueOptions {
                    job_id: job_id.clone(),
                },
            )
            .unwrap();
        job_id
    }

    fn states(bus: &Bus) -> Vec<(JobState, Option<u64>)> {
        bus.history()
            .iter()
            .map(|e| (e.state(), e.job().map(|j| j.sequence)))
            .collect()
    }

    #[test]
    fn leases_in_fifo_order() {
        let (broker, _) = broker();
        enqueue(&broker, "a");
        enqueue(&broker, "b");

        assert_eq!(broker.lease().unwrap().unwrap().job.job_id.as_str(), "a");
        assert_eq!(broker.lease().unwrap().unwrap().job.job_id.as_str(), "b");
        assert!(broker.lease().unwrap().is_none());
    }

    #[test]
    fn duplicate_enqueue_is_a_no_op() {
        let (broker, bus) = broker();
        enqueue(&broker, "a");
        let handle = broker
            .enqueue(
                "test.message.a",
                envelope(),
                EnqueueOptions {
                    job_id: JobId::new("a").unwrap(),
                },
            )
            .unwrap();

        assert!(handle.deduplicated);
        assert_eq!(bus.len(), 1);
        assert_eq!(broker.counts().unwrap().waiting, 1);
    }

    #[test]
    fn transitions_carry_per_job_sequences() {
        let (broker, bus) = broker();
        let job_id = enqueue(&broker, "a");
        let lease = broker.lease().unwrap().unwrap();
        broker.complete(&job_id, json!("done"), &lease.token).unwrap();

        assert_eq!(
            states(&bus),
            vec![
                (JobState::Added, Some(1)),
                (JobState::Active, Some(2)),
                (JobState::Completed, Some(3)),
            ]
        );
        let snapshot = broker.job(&job_id).unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.return_value, Some(json!("done")));
    }

    #[test]
    fn delayed_job_is_not_leased_before_due_time() {
        let (broker, _) = broker();
        let job_id = enqueue(&broker, "a");
        let lease = broker.lease().unwrap().unwrap();

        let due_at = Utc::now() + ChronoDuration::hours(1);
        broker.move_to_delayed(&job_id, due_at, &lease.token).unwrap();

        assert!(broker.lease().unwrap().is_none());
        assert_eq!(broker.delayed_count().unwrap(), 1);
    }

    #[test]
    fn due_job_is_leased_again() {
        let (broker, bus) = broker();
        let job_id = enqueue(&broker, "a");
        let lease = broker.lease().unwrap().unwrap();
        broker.move_to_delayed(&job_id, Utc::now(), &lease.token).unwrap();

        let again = broker.lease().unwrap().unwrap();
        assert_eq!(again.job.attempts, 2);
        assert_ne!(again.token, lease.token);

        let last = bus.history().pop().unwrap();
        assert!(matches!(
            last,
            LifecycleEvent::Active {
                prev_state: Some(JobState::Delayed),
                ..
            }
        ));
    }

    #[test]
    fn stale_token_is_rejected() {
        let (broker, _) = broker();
        let job_id = enqueue(&broker, "a");
        broker.lease().unwrap().unwrap();

        let err = broker
            .move_to_delayed(&job_id, Utc::now(), &LeaseToken::new())
            .unwrap_err();
        assert_eq!(err, GatewayError::LeaseMismatch(job_id.clone()));
        assert_eq!(broker.job(&job_id).unwrap().unwrap().status, JobStatus::Active);
    }

    #[test]
    fn expired_lease_is_reported_as_stalled() {
        let (broker, bus) = broker();
        let broker = broker.with_lease_duration(Duration::ZERO);
        let job_id = enqueue(&broker, "a");
        let first = broker.lease().unwrap().unwrap();

        let second = broker.lease().unwrap().unwrap();
        assert_eq!(second.job.job_id, job_id);

        let got: Vec<JobState> = states(&bus).into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            got,
            vec![JobState::Added, JobState::Active, JobState::Stalled, JobState::Active]
        );

        let err = broker.complete(&job_id, json!(null), &first.token).unwrap_err();
        assert_eq!(err, GatewayError::LeaseMismatch(job_id));
    }

    #[test]
    fn expired_token_cannot_acknowledge() {
        let (broker, bus) = broker();
        let broker = broker.with_lease_duration(Duration::ZERO);
        let job_id = enqueue(&broker, "a");
        let lease = broker.lease().unwrap().unwrap();

        let err = broker.complete(&job_id, json!(null), &lease.token).unwrap_err();
        assert_eq!(err, GatewayError::LeaseExpired(job_id.clone()));
        let err = broker
            .move_to_delayed(&job_id, Utc::now(), &lease.token)
            .unwrap_err();
        assert_eq!(err, GatewayError::LeaseExpired(job_id.clone()));
        let err = broker.extend_lease(&job_id, &lease.token).unwrap_err();
        assert_eq!(err, GatewayError::LeaseExpired(job_id.clone()));

        // Nothing was acknowledged; the next lease reports the stall.
        assert_eq!(bus.len(), 2);
        broker.lease().unwrap().unwrap();
        let got: Vec<JobState> = states(&bus).into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            got,
            vec![JobState::Added, JobState::Active, JobState::Stalled, JobState::Active]
        );
    }

    #[test]
    fn extended_lease_is_not_reclaimed() {
        let (broker, bus) = broker();
        let broker = broker.with_lease_duration(Duration::from_millis(200));
        let job_id = enqueue(&broker, "a");
        let lease = broker.lease().unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(120));
        let extended = broker.extend_lease(&job_id, &lease.token).unwrap();
        assert!(extended > lease.expires_at);

        std::thread::sleep(Duration::from_millis(120));
        assert!(broker.lease().unwrap().is_none());
        broker.complete(&job_id, json!("done"), &lease.token).unwrap();

        assert!(bus.history().iter().all(|e| e.state() != JobState::Stalled));
    }

    #[test]
    fn oversized_lease_duration_is_clamped() {
        let (broker, _) = broker();
        let broker = broker.with_lease_duration(Duration::MAX);
        enqueue(&broker, "a");

        let before = Utc::now();
        let lease = broker.lease().unwrap().unwrap();
        let granted = lease.expires_at - before;
        assert!(granted > ChronoDuration::hours(23));
        assert!(granted <= ChronoDuration::hours(24) + ChronoDuration::seconds(1));
    }

    #[test]
    fn from_config_uses_configured_queue_and_lease() {
        let config = DmqConfig {
            queue_name: "emails".to_string(),
            lease_duration: Duration::from_secs(5),
            ..DmqConfig::default()
        };
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let broker = InMemoryBroker::from_config(&config, bus).unwrap();
        assert_eq!(broker.queue_id().as_str(), "emails");
        enqueue(&broker, "a");

        let before = Utc::now();
        let lease = broker.lease().unwrap().unwrap();
        assert!(lease.expires_at - before <= ChronoDuration::seconds(5));
        assert!(lease.expires_at - before > ChronoDuration::seconds(4));
    }

    #[test]
    fn finished_jobs_beyond_retention_are_evicted() {
        let (broker, _) = broker();
        let broker = broker.with_finished_retention(1);
        let a = enqueue(&broker, "a");
        let b = enqueue(&broker, "b");

        let lease = broker.lease().unwrap().unwrap();
        broker.complete(&a, json!(null), &lease.token).unwrap();
        assert!(broker.job(&a).unwrap().is_some());

        let lease = broker.lease().unwrap().unwrap();
        broker.fail(&b, "boom", &lease.token).unwrap();

        assert!(broker.job(&a).unwrap().is_none());
        assert_eq!(broker.job(&b).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(
            broker.counts().unwrap(),
            JobCounts {
                failed: 1,
                ..JobCounts::default()
            }
        );
    }

    #[test]
    fn delayed_jobs_are_promoted_in_due_order() {
        let (broker, _) = broker();
        let a = enqueue(&broker, "a");
        let b = enqueue(&broker, "b");
        let now = Utc::now();

        let lease_a = broker.lease().unwrap().unwrap();
        let lease_b = broker.lease().unwrap().unwrap();
        broker
            .move_to_delayed(&a, now - ChronoDuration::milliseconds(1), &lease_a.token)
            .unwrap();
        broker
            .move_to_delayed(&b, now - ChronoDuration::milliseconds(5), &lease_b.token)
            .unwrap();
        assert_eq!(broker.delayed_count().unwrap(), 2);

        assert_eq!(broker.lease().unwrap().unwrap().job.job_id, b);
        assert_eq!(broker.lease().unwrap().unwrap().job.job_id, a);
        assert_eq!(broker.delayed_count().unwrap(), 0);
    }

    #[test]
    fn paused_queue_grants_no_leases() {
        let (broker, bus) = broker();
        let sub = bus.subscribe(ResumeFrom::LastSeen);
        enqueue(&broker, "a");

        broker.pause().unwrap();
        broker.pause().unwrap();
        assert!(broker.is_paused().unwrap());
        assert!(broker.lease().unwrap().is_none());

        broker.resume().unwrap();
        assert!(broker.lease().unwrap().is_some());

        let signals: Vec<JobState> = std::iter::from_fn(|| sub.try_recv().ok())
            .map(|d| d.message.state())
            .filter(|s| matches!(s, JobState::Paused | JobState::Resumed))
            .collect();
        assert_eq!(signals, vec![JobState::Paused, JobState::Resumed]);
    }

    #[test]
    fn progress_is_observable_but_not_a_transition() {
        let (broker, bus) = broker();
        let job_id = enqueue(&broker, "a");
        broker.update_progress(&job_id, json!({ "polls": 1 })).unwrap();

        assert_eq!(bus.len(), 1);
        let snapshot = broker.job(&job_id).unwrap().unwrap();
        assert_eq!(snapshot.progress, Some(json!({ "polls": 1 })));
        assert_eq!(snapshot.status, JobStatus::Waiting);
    }
}

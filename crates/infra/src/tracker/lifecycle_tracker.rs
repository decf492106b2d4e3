//! Typed dispatch of lifecycle events into a [`JobRepository`], and the
//! subscriber loop that feeds it.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use dmq_events::{
    AppendOutcome, Delivery, EventBus, JobEvent, JobKey, JobRecord, JobState, LifecycleEvent,
    QueueSignal, ResumeFrom, Subscription,
};
use dmq_observability::TelemetryContext;

use super::{JobRepository, RepositoryError};
use crate::config::DmqConfig;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Thread name and subscriber name on the bus. Durable buses resume a
    /// subscriber by name, so keep it stable across restarts.
    pub name: String,
    /// How many times to ping the repository before giving up at start.
    pub startup_attempts: u32,
    /// Pause between startup pings and between retries of a failed append.
    pub retry_interval: Duration,
    /// How long to block on the subscription before checking for shutdown.
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            name: "dmq-tracker".to_string(),
            startup_attempts: 5,
            retry_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl TrackerConfig {
    pub fn from_config(config: &DmqConfig) -> Self {
        Self::default()
            .with_name(format!("{}-tracker", config.queue_name))
            .with_startup_attempts(config.tracker_startup_attempts)
            .with_retry_interval(config.tracker_retry_interval)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("job store unreachable after {attempts} attempts: {source}")]
    StoreUnreachable {
        attempts: u32,
        #[source]
        source: RepositoryError,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What the tracker did with one lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedEvent {
    Job(AppendOutcome),
    QueueSignal,
}

/// Tracker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TrackerStats {
    pub events_received: u64,
    pub events_appended: u64,
    pub duplicates: u64,
    pub queue_signals: u64,
    /// Retryable failures; the event was retried.
    pub append_failures: u64,
    /// Events the store refused for good; logged, acknowledged and skipped.
    pub events_rejected: u64,
}

/// Handle to control a running tracker.
#[derive(Debug)]
pub struct TrackerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<TrackerStats>>,
}

impl TrackerHandle {
    /// Request graceful shutdown and wait for the tracker to stop.
    ///
    /// An event whose append is still being retried stays unacknowledged.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Materializes lifecycle events into job records.
///
/// Events for one job arrive in order from a single stream, so appends for
/// the same job never race; appends for different jobs touch different
/// records. Redelivered events collapse on `(tenant, job, sequence)`.
#[derive(Debug, Clone)]
pub struct JobLifecycleTracker<R> {
    repository: R,
    telemetry: TelemetryContext,
}

impl<R> JobLifecycleTracker<R>
where
    R: JobRepository,
{
    pub fn new(repository: R, telemetry: TelemetryContext) -> Self {
        Self {
            repository,
            telemetry,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn find_job_by_id(&self, key: &JobKey) -> Result<Option<JobRecord>, RepositoryError> {
        self.repository.find_job_by_id(key)
    }

    /// Record one lifecycle event.
    pub fn handle(&self, event: &LifecycleEvent) -> Result<TrackedEvent, RepositoryError> {
        let job_event = match event {
            LifecycleEvent::Added { job, name } => {
                JobEvent::new(job, JobState::Added).with_payload(json!({ "name": name }))
            }
            LifecycleEvent::Active { job, prev_state } => {
                JobEvent::new(job, JobState::Active).with_prev_state(*prev_state)
            }
            LifecycleEvent::Delayed { job, due_at } => {
                JobEvent::new(job, JobState::Delayed).with_payload(json!({ "due_at": due_at }))
            }
            LifecycleEvent::Completed {
                job,
                return_value,
                prev_state,
            } => JobEvent::new(job, JobState::Completed)
                .with_prev_state(*prev_state)
                .with_payload(json!({ "returnvalue": return_value })),
            LifecycleEvent::Failed {
                job,
                error,
                prev_state,
            } => JobEvent::new(job, JobState::Failed)
                .with_prev_state(*prev_state)
                .with_payload(json!({ "error": error })),
            LifecycleEvent::Stalled { job } => JobEvent::new(job, JobState::Stalled),
            LifecycleEvent::Paused { queue_id, timestamp }
            | LifecycleEvent::Resumed { queue_id, timestamp } => {
                self.repository.record_queue_signal(QueueSignal {
                    queue_id: queue_id.clone(),
                    state: event.state(),
                    timestamp: *timestamp,
                })?;
                debug!(queue_id = %queue_id, state = %event.state(), "queue signal recorded");
                return Ok(TrackedEvent::QueueSignal);
            }
        };

        let (tenant_id, job_id, sequence, state) = (
            job_event.tenant_id.clone(),
            job_event.job_id.clone(),
            job_event.sequence,
            job_event.state,
        );
        let outcome = self.repository.append_event(job_event)?;
        debug!(
            tenant_id = %tenant_id,
            job_id = %job_id,
            sequence,
            state = %state,
            outcome = ?outcome,
            "job event recorded"
        );
        Ok(TrackedEvent::Job(outcome))
    }

    /// Subscribe to `bus` from the earliest event and record everything in a
    /// background thread.
    ///
    /// Fails fast when the repository cannot be reached within
    /// `startup_attempts`. A delivery is acknowledged only after it has been
    /// recorded. An append that fails because the store is unavailable is
    /// retried every `retry_interval` until it succeeds or the tracker is shut
    /// down; any other failure is logged at `error`, counted in
    /// `events_rejected` and skipped so later events keep flowing.
    ///
    /// The subscription is named after `config.name`.
    pub fn start<B>(self, bus: B, config: TrackerConfig) -> Result<TrackerHandle, TrackerError>
    where
        R: 'static,
        B: EventBus<LifecycleEvent>,
    {
        self.wait_for_store(&config)?;

        // Earliest, always: events emitted before this process existed must
        // still be recorded.
        let subscription = bus.subscribe_as(&config.name, ResumeFrom::Earliest);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(TrackerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || tracker_loop(self, subscription, config, shutdown_rx, stats_clone))
            .expect("failed to spawn tracker thread");

        Ok(TrackerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn wait_for_store(&self, config: &TrackerConfig) -> Result<(), TrackerError> {
        let attempts = config.startup_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.repository.ping() {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= attempts => {
                    error!(tracker = %config.name, attempts, error = %err, "job store unreachable");
                    return Err(TrackerError::StoreUnreachable {
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(tracker = %config.name, attempt, error = %err, "job store not ready");
                    attempt += 1;
                    thread::sleep(config.retry_interval);
                }
            }
        }
    }
}

fn tracker_loop<R: JobRepository>(
    tracker: JobLifecycleTracker<R>,
    subscription: Subscription<LifecycleEvent>,
    config: TrackerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<TrackerStats>>,
) {
    let span = tracker.telemetry.span("tracker");
    let _entered = span.enter();
    info!(tracker = %config.name, "tracker started");

    'outer: loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let delivery: Delivery<LifecycleEvent> = match subscription.recv_timeout(config.poll_interval) {
            Ok(delivery) => delivery,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        if let Ok(mut s) = stats.lock() {
            s.events_received += 1;
        }

        loop {
            match tracker.handle(&delivery.message) {
                Ok(tracked) => {
                    subscription.ack(&delivery);
                    if let Ok(mut s) = stats.lock() {
                        match tracked {
                            TrackedEvent::Job(AppendOutcome::Appended) => s.events_appended += 1,
                            TrackedEvent::Job(AppendOutcome::Duplicate) => s.duplicates += 1,
                            TrackedEvent::QueueSignal => s.queue_signals += 1,
                        }
                    }
                    break;
                }
                Err(err) if !err.is_retryable() => {
                    error!(
                        tracker = %config.name,
                        delivery_id = %delivery.id,
                        state = %delivery.message.state(),
                        error = %err,
                        "lifecycle event rejected by the job store; skipped"
                    );
                    subscription.ack(&delivery);
                    if let Ok(mut s) = stats.lock() {
                        s.events_rejected += 1;
                    }
                    break;
                }
                Err(err) => {
                    if let Ok(mut s) = stats.lock() {
                        s.append_failures += 1;
                    }
                    warn!(
                        tracker = %config.name,
                        delivery_id = %delivery.id,
                        state = %delivery.message.state(),
                        error = %err,
                        "failed to record lifecycle event; will retry"
                    );
                    if shutdown_rx.recv_timeout(config.retry_interval).is_ok() {
                        break 'outer;
                    }
                }
            }
        }
    }

    info!(tracker = %config.name, "tracker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use dmq_core::{JobId, QueueId, TenantId};
    use dmq_events::{InMemoryEventBus, JobRef, RecordError};

    use crate::tracker::InMemoryJobRepository;

    fn tracker() -> JobLifecycleTracker<InMemoryJobRepository> {
        JobLifecycleTracker::new(InMemoryJobRepository::new(), TelemetryContext::new("dmq-test"))
    }

    fn job_ref(sequence: u64) -> JobRef {
        JobRef {
            job_id: JobId::new("job-1").unwrap(),
            tenant_id: TenantId::new("!!").unwrap(),
            queue_id: QueueId::new("jobs").unwrap(),
            sequence,
            timestamp: Utc::now(),
        }
    }

    fn key() -> JobKey {
        JobKey::new(TenantId::new("!!").unwrap(), JobId::new("job-1").unwrap())
    }

    #[test]
    fn payloads_follow_the_event_kind() {
        let tracker = tracker();
        tracker
            .handle(&LifecycleEvent::Added {
                job: job_ref(1),
                name: "test.message.a".to_string(),
            })
            .unwrap();
        tracker
            .handle(&LifecycleEvent::Active {
                job: job_ref(2),
                prev_state: Some(JobState::Added),
            })
            .unwrap();
        tracker
            .handle(&LifecycleEvent::Failed {
                job: job_ref(3),
                error: "boom".to_string(),
                prev_state: Some(JobState::Active),
            })
            .unwrap();

        let record = tracker.find_job_by_id(&key()).unwrap().unwrap();
        let events = record.events();
        assert_eq!(events[0].payload, Some(json!({ "name": "test.message.a" })));
        assert_eq!(events[1].prev_state, Some(JobState::Added));
        assert_eq!(events[2].payload, Some(json!({ "error": "boom" })));
        assert_eq!(record.state(), JobState::Failed);
    }

    #[test]
    fn stalled_is_recorded_as_its_own_state() {
        let tracker = tracker();
        tracker
            .handle(&LifecycleEvent::Active {
                job: job_ref(2),
                prev_state: None,
            })
            .unwrap();
        tracker.handle(&LifecycleEvent::Stalled { job: job_ref(3) }).unwrap();

        let record = tracker.find_job_by_id(&key()).unwrap().unwrap();
        assert_eq!(record.state(), JobState::Stalled);
    }

    #[test]
    fn queue_signals_do_not_create_job_records() {
        let tracker = tracker();
        let outcome = tracker
            .handle(&LifecycleEvent::Paused {
                queue_id: QueueId::new("jobs").unwrap(),
                timestamp: Utc::now(),
            })
            .unwrap();

        assert_eq!(outcome, TrackedEvent::QueueSignal);
        let signals = tracker
            .repository()
            .queue_signals(&QueueId::new("jobs").unwrap())
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].state, JobState::Paused);
        assert!(tracker.find_job_by_id(&key()).unwrap().is_none());
    }

    #[test]
    fn duplicate_delivery_is_reported() {
        let tracker = tracker();
        let event = LifecycleEvent::Stalled { job: job_ref(4) };
        assert_eq!(
            tracker.handle(&event).unwrap(),
            TrackedEvent::Job(AppendOutcome::Appended)
        );
        assert_eq!(
            tracker.handle(&event).unwrap(),
            TrackedEvent::Job(AppendOutcome::Duplicate)
        );
    }

    /// Bus that only accepts named subscriptions and remembers them.
    #[derive(Default)]
    struct NamedOnlyBus {
        inner: InMemoryEventBus<LifecycleEvent>,
        subscribers: Mutex<Vec<(String, ResumeFrom)>>,
    }

    impl EventBus<LifecycleEvent> for NamedOnlyBus {
        type Error = <InMemoryEventBus<LifecycleEvent> as EventBus<LifecycleEvent>>::Error;

        fn publish(&self, message: LifecycleEvent) -> Result<(), Self::Error> {
            self.inner.publish(message)
        }

        fn subscribe(&self, _resume_from: ResumeFrom) -> Subscription<LifecycleEvent> {
            panic!("anonymous subscription would not survive a restart");
        }

        fn subscribe_as(&self, subscriber: &str, resume_from: ResumeFrom) -> Subscription<LifecycleEvent> {
            self.subscribers
                .lock()
                .unwrap()
                .push((subscriber.to_string(), resume_from));
            self.inner.subscribe(resume_from)
        }
    }

    #[test]
    fn subscribes_under_its_configured_name() {
        let bus = Arc::new(NamedOnlyBus::default());
        let handle = tracker()
            .start(bus.clone(), TrackerConfig::default().with_name("billing-tracker"))
            .unwrap();
        handle.shutdown();

        let subscribers = bus.subscribers.lock().unwrap().clone();
        assert_eq!(
            subscribers,
            vec![("billing-tracker".to_string(), ResumeFrom::Earliest)]
        );
    }

    #[test]
    fn only_unavailable_stores_are_retried() {
        assert!(RepositoryError::Unavailable("timeout".to_string()).is_retryable());
        assert!(!RepositoryError::Storage("constraint".to_string()).is_retryable());
        let mismatch = RecordError::KeyMismatch {
            tenant: TenantId::new("a").unwrap(),
            job: JobId::new("job-1").unwrap(),
            found_tenant: TenantId::new("b").unwrap(),
            found_job: JobId::new("job-1").unwrap(),
        };
        assert!(!RepositoryError::Record(mismatch).is_retryable());
    }

    #[test]
    fn config_is_derived_from_settings() {
        let settings = DmqConfig {
            queue_name: "billing".to_string(),
            tracker_startup_attempts: 0,
            tracker_retry_interval: Duration::from_millis(10),
            ..DmqConfig::default()
        };
        let config = TrackerConfig::from_config(&settings);

        assert_eq!(config.name, "billing-tracker");
        assert_eq!(config.startup_attempts, 1);
        assert_eq!(config.retry_interval, Duration::from_millis(10));
    }
}

//! Worker loop: lease, run the handler, apply its outcome.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use dmq_core::{JobId, LeaseToken};
use dmq_observability::TelemetryContext;

use super::{JobHandler, JobOutcome, ProcessorError};
use crate::config::DmqConfig;
use crate::gateway::QueueGateway;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name, also used in logs.
    pub name: String,
    /// How long to sleep when no job is ready.
    pub poll_interval: Duration,
    /// How long to wait for the broker to answer `ping` before giving up.
    pub ready_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "dmq-worker".to_string(),
            poll_interval: Duration::from_millis(100),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &DmqConfig) -> Self {
        Self::default()
            .with_name(format!("{}-worker", config.queue_name))
            .with_poll_interval(config.poll_interval)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }
}

/// What happened to a processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Completed { job_id: JobId },
    Delayed { job_id: JobId, due_at: DateTime<Utc> },
    Failed { job_id: JobId, error: String },
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    /// The broker answered `ping` and the loop is leasing.
    pub ready: bool,
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_delayed: u64,
    pub jobs_failed: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, processed: &Processed) {
        self.jobs_processed += 1;
        match processed {
            Processed::Completed { .. } => self.jobs_completed += 1,
            Processed::Delayed { .. } => self.jobs_delayed += 1,
            Processed::Failed { .. } => self.jobs_failed += 1,
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown. The job in hand, if any, is finished first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Shortest pause between two lease extensions.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Drives a [`JobHandler`] against a queue.
///
/// While a handler runs, a heartbeat thread extends the lease at half its
/// remaining time, so slow handlers keep their job. The heartbeat stops as
/// soon as the handler returns or the broker refuses an extension.
///
/// The broker arbitrates leases; the worker only has to hand the token it was
/// given back unchanged. A handler that reschedules with any other token is a
/// programming error: it is logged at `error` and the broker is left alone, so
/// the lease eventually expires and the job is reported as stalled.
pub struct Worker<G, H> {
    gateway: G,
    handler: H,
    telemetry: TelemetryContext,
}

impl<G, H> Worker<G, H>
where
    G: QueueGateway,
    H: JobHandler,
{
    pub fn new(gateway: G, handler: H, telemetry: TelemetryContext) -> Self {
        Self {
            gateway,
            handler,
            telemetry,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Lease one job and apply the handler's outcome.
    ///
    /// Returns `Ok(None)` when no job is ready.
    pub fn process_next(&mut self) -> Result<Option<Processed>, ProcessorError> {
        let Some(lease) = self.gateway.lease()? else {
            return Ok(None);
        };
        let job_id = lease.job.job_id.clone();

        debug!(
            queue_id = %lease.job.queue_id,
            job_id = %job_id,
            tenant_id = %lease.job.tenant_id,
            attempts = lease.job.attempts,
            "leased job"
        );

        let gateway = &self.gateway;
        let handler = &mut self.handler;
        let (beat_job_id, token, expires_at) = (job_id.clone(), lease.token, lease.expires_at);
        let outcome = thread::scope(|scope| {
            let (done_tx, done_rx) = mpsc::channel::<()>();
            let spawned = thread::Builder::new()
                .name("dmq-heartbeat".to_string())
                .spawn_scoped(scope, move || {
                    heartbeat(gateway, &beat_job_id, &token, expires_at, done_rx)
                });
            if let Err(err) = spawned {
                warn!(job_id = %job_id, error = %err, "heartbeat not started");
            }

            let outcome = handler.process(&lease.job, &lease.token);
            drop(done_tx);
            outcome
        });

        let processed = match outcome {
            JobOutcome::Completed(value) => {
                self.gateway.complete(&job_id, value, &lease.token)?;
                Processed::Completed { job_id }
            }
            JobOutcome::Delayed(reschedule) => {
                if reschedule.token != lease.token {
                    error!(
                        queue_id = %lease.job.queue_id,
                        job_id = %job_id,
                        "handler rescheduled with a foreign lease token"
                    );
                    return Err(ProcessorError::LeaseMismatch { job_id });
                }

                self.gateway
                    .move_to_delayed(&job_id, reschedule.due_at, &lease.token)?;
                if let Some(progress) = reschedule.progress {
                    self.gateway.update_progress(&job_id, progress)?;
                }
                Processed::Delayed {
                    job_id,
                    due_at: reschedule.due_at,
                }
            }
            JobOutcome::Failed(err) => {
                let error = format!("{err:#}");
                self.gateway.fail(&job_id, &error, &lease.token)?;
                Processed::Failed { job_id, error }
            }
        };

        Ok(Some(processed))
    }

    /// Spawn the worker in a background thread.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle
    where
        G: 'static,
        H: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx, stats_clone))
            .expect("failed to spawn worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

/// Extend a lease until `done` disconnects or the broker refuses.
fn heartbeat<G: QueueGateway>(
    gateway: &G,
    job_id: &JobId,
    token: &LeaseToken,
    mut expires_at: DateTime<Utc>,
    done: mpsc::Receiver<()>,
) {
    loop {
        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        match done.recv_timeout((remaining / 2).max(MIN_HEARTBEAT_INTERVAL)) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => return,
        }

        match gateway.extend_lease(job_id, token) {
            Ok(at) => {
                debug!(job_id = %job_id, expires_at = %at, "lease extended");
                expires_at = at;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "lease not extended; heartbeat stopped");
                return;
            }
        }
    }
}

/// Wait for the broker to answer `ping`.
///
/// Returns `false` on shutdown or when `ready_timeout` elapses first.
fn wait_until_ready<G: QueueGateway>(
    gateway: &G,
    config: &WorkerConfig,
    shutdown_rx: &mpsc::Receiver<()>,
) -> bool {
    let deadline = Instant::now() + config.ready_timeout;
    loop {
        match gateway.ping() {
            Ok(()) => return true,
            Err(err) => {
                if Instant::now() >= deadline {
                    error!(worker = %config.name, error = %err, "broker not ready; giving up");
                    return false;
                }
                debug!(worker = %config.name, error = %err, "waiting for broker");
            }
        }
        if shutdown_rx.recv_timeout(config.poll_interval).is_ok() {
            return false;
        }
    }
}

fn worker_loop<G, H>(
    mut worker: Worker<G, H>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    G: QueueGateway,
    H: JobHandler,
{
    let span = worker.telemetry.span("worker");
    let _entered = span.enter();
    let start_time = Instant::now();

    if !wait_until_ready(&worker.gateway, &config, &shutdown_rx) {
        return;
    }
    if let Ok(mut s) = stats.lock() {
        s.ready = true;
    }
    info!(worker = %config.name, queue_id = %worker.gateway.queue_id(), "worker started");

    loop {
        // Check for shutdown
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let result = worker.process_next();

        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(Some(processed)) => s.record(processed),
                Ok(None) => {}
                Err(_) => s.errors += 1,
            }
        }

        match result {
            Ok(Some(processed)) => {
                debug!(worker = %config.name, outcome = ?processed, "job processed");
            }
            Ok(None) => {
                // No jobs available, sleep
                if shutdown_rx.recv_timeout(config.poll_interval).is_ok() {
                    break;
                }
            }
            Err(ProcessorError::LeaseMismatch { .. }) => {
                // Already logged; the lease will expire and the job stalls.
            }
            Err(e) => {
                warn!(worker = %config.name, error = %e, "failed to process job");
                if shutdown_rx.recv_timeout(config.poll_interval).is_ok() {
                    break;
                }
            }
        }
    }

    info!(worker = %config.name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use serde_json::{Value as JsonValue, json};

    use dmq_core::{LeaseToken, QueueId};
    use dmq_events::{
        Envelope, InMemoryEventBus, LifecycleEvent, MessageDefinition, MessageSchema, build,
    };

    use crate::gateway::{EnqueueOptions, InMemoryBroker, JobStatus, LeasedJob};
    use crate::processor::Reschedule;

    type Broker = Arc<InMemoryBroker<Arc<InMemoryEventBus<LifecycleEvent>>>>;

    fn broker() -> Broker {
        Arc::new(InMemoryBroker::new(
            QueueId::new("jobs").unwrap(),
            Arc::new(InMemoryEventBus::new()),
        ))
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

    fn enqueue(broker: &Broker) -> JobId {
        let job_id = JobId::generate();
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

    fn telemetry() -> TelemetryContext {
        TelemetryContext::new("dmq-test")
    }

    #[test]
    fn completes_on_first_attempt() {
        let broker = broker();
        let job_id = enqueue(&broker);
        let mut worker = Worker::new(
            broker.clone(),
            |_: &LeasedJob, _: &LeaseToken| JobOutcome::Completed(json!("ok")),
            telemetry(),
        );

        assert_eq!(
            worker.process_next().unwrap(),
            Some(Processed::Completed {
                job_id: job_id.clone()
            })
        );
        assert_eq!(worker.process_next().unwrap(), None);
        assert_eq!(broker.job(&job_id).unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn reschedule_then_progress() {
        let broker = broker();
        let job_id = enqueue(&broker);
        let due_at = Utc::now() + ChronoDuration::hours(1);
        let mut worker = Worker::new(
            broker.clone(),
            move |_: &LeasedJob, token: &LeaseToken| {
                JobOutcome::Delayed(Reschedule::new(due_at, *token).with_progress(json!({ "polls": 1 })))
            },
            telemetry(),
        );

        worker.process_next().unwrap();

        let snapshot = broker.job(&job_id).unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Delayed);
        assert_eq!(snapshot.due_at, Some(due_at));
        assert_eq!(snapshot.progress, Some(json!({ "polls": 1 })));
        assert_eq!(broker.delayed_count().unwrap(), 1);
        assert_eq!(worker.process_next().unwrap(), None);
    }

    #[test]
    fn foreign_token_fails_loudly_and_leaves_the_job_alone() {
        let broker = broker();
        let job_id = enqueue(&broker);
        let mut worker = Worker::new(
            broker.clone(),
            |_: &LeasedJob, _: &LeaseToken| JobOutcome::delayed(Utc::now(), LeaseToken::new()),
            telemetry(),
        );

        let err = worker.process_next().unwrap_err();
        assert!(matches!(err, ProcessorError::LeaseMismatch { job_id: ref id } if *id == job_id));
        assert_eq!(broker.job(&job_id).unwrap().unwrap().status, JobStatus::Active);
    }

    #[test]
    fn handler_errors_fail_the_job() {
        let broker = broker();
        let job_id = enqueue(&broker);
        let mut worker = Worker::new(
            broker.clone(),
            |_: &LeasedJob, _: &LeaseToken| JobOutcome::Failed(anyhow::anyhow!("dependency exploded")),
            telemetry(),
        );

        let processed = worker.process_next().unwrap().unwrap();
        assert!(matches!(processed, Processed::Failed { ref error, .. } if error == "dependency exploded"));

        let snapshot = broker.job(&job_id).unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.failed_reason.as_deref(), Some("dependency exploded"));
    }

    #[test]
    fn slow_handler_keeps_its_lease() {
        let broker: Broker = Arc::new(
            InMemoryBroker::new(QueueId::new("jobs").unwrap(), Arc::new(InMemoryEventBus::new()))
                .with_lease_duration(Duration::from_millis(100)),
        );
        let job_id = enqueue(&broker);
        let other = broker.clone();
        let mut worker = Worker::new(
            broker.clone(),
            move |_: &LeasedJob, _: &LeaseToken| {
                thread::sleep(Duration::from_millis(350));
                // Another worker asking for work must not get this job back.
                assert!(other.lease().unwrap().is_none());
                JobOutcome::Completed(json!("slow"))
            },
            telemetry(),
        );

        assert_eq!(
            worker.process_next().unwrap(),
            Some(Processed::Completed {
                job_id: job_id.clone()
            })
        );
        let snapshot = broker.job(&job_id).unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.attempts, 1);
        assert!(
            broker
                .bus()
                .history()
                .iter()
                .all(|e| e.state() != dmq_events::JobState::Stalled)
        );
    }

    #[test]
    fn heartbeat_stops_once_the_lease_is_lost() {
        let broker = broker();
        let job_id = enqueue(&broker);
        let lease = broker.lease().unwrap().unwrap();
        broker.complete(&job_id, json!(null), &lease.token).unwrap();

        let (_done_tx, done_rx) = mpsc::channel::<()>();
        // Returns on the first refused extension instead of looping.
        heartbeat(&broker, &job_id, &lease.token, Utc::now(), done_rx);
    }

    #[test]
    fn spawned_worker_drains_the_queue() {
        let broker = broker();
        let first = enqueue(&broker);
        let second = enqueue(&broker);

        let worker = Worker::new(
            broker.clone(),
            |_: &LeasedJob, _: &LeaseToken| JobOutcome::Completed(json!(null)),
            telemetry(),
        );
        let handle = worker.spawn(
            WorkerConfig::default()
                .with_name("test-worker")
                .with_poll_interval(Duration::from_millis(5)),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_completed < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.stats();
        handle.shutdown();

        assert!(stats.ready);
        assert_eq!(stats.jobs_completed, 2);
        for job_id in [first, second] {
            assert_eq!(broker.job(&job_id).unwrap().unwrap().status, JobStatus::Completed);
        }
    }
}

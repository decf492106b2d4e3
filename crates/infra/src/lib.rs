//! Infrastructure layer: queue gateway, job processing, lifecycle tracking,
//! Postgres and Redis adapters, configuration.

pub mod config;
pub mod dispatch;
pub mod event_bus;
pub mod gateway;
pub mod processor;
pub mod tracker;
pub mod workers;


pub use config::{ConfigError, DmqConfig};
pub use dispatch::{SendError, publish, send};
pub use gateway::{
    EnqueueOptions, GatewayError, InMemoryBroker, JobHandle, JobSnapshot, JobStatus, Lease,
    LeasedJob, QueueGateway,
};
pub use processor::{JobHandler, JobOutcome, ProcessorError, Reschedule, Worker, WorkerConfig};
pub use tracker::{
    InMemoryJobRepository, JobLifecycleTracker, JobQuery, JobRepository, PostgresJobRepository,
    RepositoryError, TrackerConfig, TrackerError, TrackerHandle,
};
pub use workers::{EventListener, ListenerHandle};

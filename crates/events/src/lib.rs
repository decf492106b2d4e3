//! Message model and lifecycle-event mechanics.
//!
//! - message definitions, schemas and validated envelopes
//! - bindings and the allow-list gate
//! - job lifecycle events and the per-job record they materialize into
//! - the event bus abstraction with replay markers

pub mod binding;
pub mod bus;
pub mod definition;
pub mod envelope;
pub mod in_memory_bus;
pub mod lifecycle;
pub mod record;
pub mod schema;

pub use binding::{Binding, BindingSet, Direction, DirectionPolicy, is_allowed};
pub use bus::{Delivery, EventBus, ResumeFrom, Subscription};
pub use definition::{CloudEventAttributes, MessageDefinition, MessageType};
pub use envelope::{Envelope, EnvelopeMetadata, build};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{JobEvent, JobKey, JobRef, JobState, LifecycleEvent, QueueSignal};
pub use record::{AppendOutcome, JobRecord, RecordError};
pub use schema::{FieldKind, FieldRule, MessageSchema};

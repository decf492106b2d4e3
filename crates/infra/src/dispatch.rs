//! Sending and publishing envelopes through a gateway.
//!
//! Both operations are a single authorization check followed by a single
//! enqueue attempt. There is no retry or buffering here: a rejected envelope
//! never reaches the gateway, and a gateway failure is returned as-is.

use serde::Serialize;
use tracing::{debug, warn};

use dmq_core::{DomainError, JobId};
use dmq_events::{BindingSet, Envelope};

use crate::gateway::{EnqueueOptions, GatewayError, JobHandle, QueueGateway};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No binding declares the envelope's message type.
    #[error(transparent)]
    NotAllowed(DomainError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Send a command on behalf of a consumer.
pub fn send<G, T>(gateway: &G, bindings: &BindingSet, envelope: Envelope<T>) -> Result<JobHandle, SendError>
where
    G: QueueGateway + ?Sized,
    T: Serialize,
{
    dispatch("send", gateway, bindings, envelope)
}

/// Publish an event on behalf of an exchange.
pub fn publish<G, T>(
    gateway: &G,
    bindings: &BindingSet,
    envelope: Envelope<T>,
) -> Result<JobHandle, SendError>
where
    G: QueueGateway + ?Sized,
    T: Serialize,
{
    dispatch("publish", gateway, bindings, envelope)
}

fn dispatch<G, T>(
    operation: &'static str,
    gateway: &G,
    bindings: &BindingSet,
    envelope: Envelope<T>,
) -> Result<JobHandle, SendError>
where
    G: QueueGateway + ?Sized,
    T: Serialize,
{
    if let Err(err) = bindings.authorize(&envelope) {
        warn!(
            operation,
            queue_id = %bindings.queue_id(),
            message_type = envelope.event_type(),
            tenant_id = %envelope.tenant_id(),
            "envelope rejected by bindings"
        );
        return Err(SendError::NotAllowed(err));
    }

    let name = envelope.event_type().to_string();
    let job_id = JobId::from(envelope.id());
    let payload = envelope.into_json()?;

    let handle = gateway.enqueue(&name, payload, EnqueueOptions { job_id })?;
    debug!(
        operation,
        queue_id = %gateway.queue_id(),
        job_id = %handle.job_id,
        deduplicated = handle.deduplicated,
        "envelope enqueued"
    );
    Ok(handle)
}

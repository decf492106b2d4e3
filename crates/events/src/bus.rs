//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** used to distribute lifecycle
//! events from the broker to their consumers (the tracker, monitoring
//! listeners).
//!
//! ## Delivery model
//!
//! - **At-least-once**: a delivery that is not acknowledged may be delivered
//!   again (after a restart, or by a transport that redelivers pending
//!   entries). Consumers must be idempotent.
//! - **Per-publisher order**: messages published by one publisher are
//!   delivered in publish order. There is no ordering across publishers.
//! - **Replay markers**: a subscriber chooses where to start reading with
//!   [`ResumeFrom`]. Authoritative consumers must use
//!   [`ResumeFrom::Earliest`] so nothing emitted before they started is lost.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a new subscription starts reading.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFrom {
    /// Everything since the stream began, including events emitted before
    /// the subscriber existed.
    #[default]
    Earliest,
    /// Only events published after subscribing.
    LastSeen,
}

/// A message together with its transport position.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<M> {
    /// Transport-specific id used to acknowledge this delivery.
    pub id: String,
    pub message: M,
}

/// A subscription to an event stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe(ResumeFrom::Earliest);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(100)) {
///         Ok(delivery) => {
///             persist(&delivery.message)?;
///             subscription.ack(&delivery);
///         }
///         Err(RecvTimeoutError::Timeout) => continue,  // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break, // bus closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<Delivery<M>>,
    acks: Option<Sender<String>>,
}

impl<M> Subscription<M> {
    /// A subscription whose transport needs no acknowledgement.
    pub fn new(receiver: Receiver<Delivery<M>>) -> Self {
        Self {
            receiver,
            acks: None,
        }
    }

    /// A subscription that forwards acknowledged delivery ids to `acks`.
    pub fn with_acks(receiver: Receiver<Delivery<M>>, acks: Sender<String>) -> Self {
        Self {
            receiver,
            acks: Some(acks),
        }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<Delivery<M>, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<Delivery<M>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<M>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Mark a delivery as consumed.
    ///
    /// Only call this once the message has been durably handled: an
    /// unacknowledged delivery is what the transport redelivers after a crash.
    pub fn ack(&self, delivery: &Delivery<M>) {
        if let Some(acks) = &self.acks {
            // The transport is gone; redelivery will cover it.
            let _ = acks.send(delivery.id.clone());
        }
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Broker (transition) → Event Bus (publish) → Subscribers
///                                               ├─ Job Lifecycle Tracker (Earliest)
///                                               └─ Monitoring listeners (LastSeen)
/// ```
///
/// Each subscription receives a copy of every published message from its
/// resume marker onwards (broadcast semantics).
///
/// The trait requires `Send + Sync`: multiple threads may publish
/// concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self, resume_from: ResumeFrom) -> Subscription<M>;

    /// Subscribe under a stable `subscriber` name.
    ///
    /// Durable transports keep the read position of a named subscriber, so a
    /// restarted subscriber with the same name resumes where it stopped
    /// instead of starting over. `resume_from` only applies the first time a
    /// name is seen. Transports without durable positions ignore the name.
    fn subscribe_as(&self, subscriber: &str, resume_from: ResumeFrom) -> Subscription<M> {
        let _ = subscriber;
        self.subscribe(resume_from)
    }
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self, resume_from: ResumeFrom) -> Subscription<M> {
        (**self).subscribe(resume_from)
    }

    fn subscribe_as(&self, subscriber: &str, resume_from: ResumeFrom) -> Subscription<M> {
        (**self).subscribe_as(subscriber, resume_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn ack_forwards_delivery_id() {
        let (tx, rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        let subscription = Subscription::with_acks(rx, ack_tx);

        tx.send(Delivery {
            id: "1-0".to_string(),
            message: 7u32,
        })
        .unwrap();

        let delivery = subscription.recv().unwrap();
        subscription.ack(&delivery);
        assert_eq!(ack_rx.try_recv().unwrap(), "1-0");
    }

    #[test]
    fn ack_without_transport_is_a_no_op() {
        let (tx, rx) = mpsc::channel();
        let subscription = Subscription::new(rx);
        tx.send(Delivery {
            id: "0".to_string(),
            message: (),
        })
        .unwrap();

        let delivery = subscription.try_recv().unwrap();
        subscription.ack(&delivery);
        assert!(subscription.try_recv().is_err());
    }
}

//! In-memory event bus for tests/dev.

use std::sync::{Mutex, mpsc};

use crate::bus::{Delivery, EventBus, ResumeFrom, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

#[derive(Debug)]
struct BusState<M> {
    log: Vec<M>,
    subscribers: Vec<mpsc::Sender<Delivery<M>>>,
}

/// In-memory pub/sub bus that retains every published message.
///
/// - No IO / no async
/// - [`ResumeFrom::Earliest`] replays the full log before live messages,
///   with no gap between the two
/// - Delivery ids are log positions
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    state: Mutex<BusState<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages published so far.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: Clone> InMemoryEventBus<M> {
    /// Snapshot of the published log.
    pub fn history(&self) -> Vec<M> {
        self.state.lock().map(|s| s.log.clone()).unwrap_or_default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            state: Mutex::new(BusState {
                log: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut state = self.state.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let id = state.log.len().to_string();
        state.log.push(message.clone());

        // Drop any dead subscribers while publishing.
        state.subscribers.retain(|tx| {
            tx.send(Delivery {
                id: id.clone(),
                message: message.clone(),
            })
            .is_ok()
        });

        Ok(())
    }

    fn subscribe(&self, resume_from: ResumeFrom) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut state) = self.state.lock() {
            if resume_from == ResumeFrom::Earliest {
                for (position, message) in state.log.iter().enumerate() {
                    let _ = tx.send(Delivery {
                        id: position.to_string(),
                        message: message.clone(),
                    });
                }
            }
            state.subscribers.push(tx);
        }

        Subscription::new(rx)
    }
}

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use dmq_events::{EventBus, ResumeFrom, Subscription};

/// Handle to control and join a background listener.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Request graceful shutdown and wait for the listener to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Best-effort event listener (monitoring, metrics, debugging).
///
/// - Subscribes to an event bus from the given resume marker
/// - Calls the handler for each message, then acknowledges it
/// - A handler error is logged and the message is still acknowledged
///
/// Listeners never feed authoritative state; use the job lifecycle tracker
/// for that.
#[derive(Debug)]
pub struct EventListener;

impl EventListener {
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: B,
        resume_from: ResumeFrom,
        mut handler: H,
    ) -> ListenerHandle
    where
        M: Send + 'static,
        B: EventBus<M>,
        H: FnMut(&M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe(resume_from);

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || listener_loop(name, sub, shutdown_rx, &mut handler))
            .expect("failed to spawn event listener thread");

        ListenerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn listener_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(&M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(delivery) => {
                if let Err(err) = handler(&delivery.message) {
                    warn!(listener = name, delivery_id = %delivery.id, error = ?err, "event listener handler failed");
                }
                sub.ack(&delivery);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(listener = name, "event listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use dmq_events::InMemoryEventBus;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn last_seen_listener_skips_history() {
        let bus = Arc::new(InMemoryEventBus::<u32>::new());
        bus.publish(1).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = EventListener::spawn("listener-test", bus.clone(), ResumeFrom::LastSeen, move |m: &u32| {
            tx.send(*m).map_err(|_| "closed")
        });

        bus.publish(2).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        handle.shutdown();
    }

    #[test]
    fn earliest_listener_replays_history_and_survives_handler_errors() {
        let bus = Arc::new(InMemoryEventBus::<u32>::new());
        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = EventListener::spawn("listener-test", bus.clone(), ResumeFrom::Earliest, move |m: &u32| {
            seen_clone.lock().unwrap().push(*m);
            if *m == 1 { Err("odd") } else { Ok(()) }
        });

        assert!(wait_for(|| seen.lock().unwrap().len() == 2));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        handle.shutdown();
    }
}

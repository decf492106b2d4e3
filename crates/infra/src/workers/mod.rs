//! Background workers that consume event bus subscriptions.

pub mod listener;

pub use listener::{EventListener, ListenerHandle};

//! Infrastructure event bus implementations.
//!
//! The event bus abstraction lives in `dmq-events` as pure mechanics (with an
//! in-memory implementation). This module provides transport-backed
//! implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{
    RedisStreamsError, RedisStreamsEventBus, durable_group_name, queue_stream_key,
};

//! Tracing/logging setup shared by the queue components.
//!
//! There is no process-wide `init()`: a [`TelemetryContext`] is built once at
//! startup, installed, and handed to the components that log.

pub mod tracing;

pub use crate::tracing::TelemetryContext;

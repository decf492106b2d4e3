//! `dmq-core`: foundation building blocks shared by every dmq crate.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! strongly-typed identifiers and the error model for validation and
//! authorization failures.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, ValidationError};
pub use id::{JobId, LeaseToken, MessageId, QueueId, TenantId};

//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// A message or identifier failed a structural or length check.
///
/// `field` names the offending field using the envelope's wire names, with a
/// dotted path for nested data (e.g. `tenantid`, `data.name`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("validation failed for `{field}`: {reason}")]
pub struct ValidationError {
    field: String,
    reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, authorization
/// against bindings, invariants). Broker and storage failures belong to the
/// infrastructure crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A message failed schema validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An identifier was invalid (e.g. empty or unparsable).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The message type has no binding on the queue it was sent through.
    #[error("message type `{message_type}` is not allowed on queue `{queue_id}`")]
    NotAllowed {
        message_type: String,
        queue_id: String,
    },

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(field, reason))
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_allowed(message_type: impl Into<String>, queue_id: impl Into<String>) -> Self {
        Self::NotAllowed {
            message_type: message_type.into(),
            queue_id: queue_id.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

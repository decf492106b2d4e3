//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a tenant (multi-tenant boundary).
///
/// Tenant identifiers are opaque strings chosen by the producing service.
/// Length bounds are a schema concern and are checked when an envelope is
/// built, not here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

/// Identifier of a job inside a queue.
///
/// Reusing a job id on enqueue is the broker's de-duplication point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Identifier of a queue (the `queueId` a consumer or exchange binds under).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueId(String);

/// Identifier of a single envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

/// Exclusive right to process a leased job.
///
/// Issued by the broker when a job is leased and required, unchanged, to
/// reschedule, complete, or fail that job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create an identifier, rejecting empty or whitespace-only values.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: must not be empty", $name)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_string_newtype!(TenantId, "TenantId");
impl_string_newtype!(JobId, "JobId");
impl_string_newtype!(QueueId, "QueueId");
impl_uuid_newtype!(MessageId, "MessageId");
impl_uuid_newtype!(LeaseToken, "LeaseToken");

impl JobId {
    /// Generate a fresh, time-ordered job id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl From<MessageId> for JobId {
    fn from(value: MessageId) -> Self {
        Self(value.0.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_reject_blank_values() {
        assert!(TenantId::new("").is_err());
        assert!(JobId::new("   ").is_err());
        assert_eq!(QueueId::new("billing").unwrap().as_str(), "billing");
    }

    #[test]
    fn short_tenant_ids_are_accepted_at_the_id_level() {
        // Length bounds belong to the message schema.
        assert_eq!(TenantId::new("!!").unwrap().to_string(), "!!");
    }

    #[test]
    fn string_ids_deserialize_through_validation() {
        let ok: JobId = serde_json::from_str("\"job-1\"").unwrap();
        assert_eq!(ok.as_str(), "job-1");

        let err = serde_json::from_str::<JobId>("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn job_id_from_message_id_uses_uuid_text() {
        let message_id = MessageId::new();
        let job_id = JobId::from(message_id);
        assert_eq!(job_id.as_str(), message_id.to_string());
    }

    #[test]
    fn lease_tokens_are_unique() {
        assert_ne!(LeaseToken::new(), LeaseToken::new());
    }
}

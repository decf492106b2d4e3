//! Configuration loading and representation.
//!
//! Settings come from environment variables with defaults for everything
//! except connection strings, which are optional: components that need them
//! are simply not constructed when they are absent.

use std::time::Duration;

use dmq_core::QueueId;
use dmq_events::DirectionPolicy;

pub const ENV_QUEUE_NAME: &str = "DMQ_QUEUE_NAME";
pub const ENV_REDIS_URL: &str = "DMQ_REDIS_URL";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_LEASE_DURATION_MS: &str = "DMQ_LEASE_DURATION_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "DMQ_POLL_INTERVAL_MS";
pub const ENV_TRACKER_STARTUP_ATTEMPTS: &str = "DMQ_TRACKER_STARTUP_ATTEMPTS";
pub const ENV_TRACKER_RETRY_INTERVAL_MS: &str = "DMQ_TRACKER_RETRY_INTERVAL_MS";
pub const ENV_ENFORCE_BINDING_DIRECTION: &str = "DMQ_ENFORCE_BINDING_DIRECTION";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmqConfig {
    pub queue_name: String,
    /// Used by `RedisStreamsEventBus::from_config`.
    pub redis_url: Option<String>,
    /// Used by `PostgresJobRepository::from_config`.
    pub database_url: Option<String>,
    /// Lease granted by `InMemoryBroker::from_config`.
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub tracker_startup_attempts: u32,
    pub tracker_retry_interval: Duration,
    pub enforce_binding_direction: bool,
}

impl Default for DmqConfig {
    fn default() -> Self {
        Self {
            queue_name: "jobs".to_string(),
            redis_url: None,
            database_url: None,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            tracker_startup_attempts: 5,
            tracker_retry_interval: Duration::from_secs(1),
            enforce_binding_direction: false,
        }
    }
}

impl DmqConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source. Unset or empty keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            queue_name: get(ENV_QUEUE_NAME).unwrap_or(defaults.queue_name),
            redis_url: get(ENV_REDIS_URL),
            database_url: get(ENV_DATABASE_URL),
            lease_duration: millis(ENV_LEASE_DURATION_MS, get(ENV_LEASE_DURATION_MS))?
                .unwrap_or(defaults.lease_duration),
            poll_interval: millis(ENV_POLL_INTERVAL_MS, get(ENV_POLL_INTERVAL_MS))?
                .unwrap_or(defaults.poll_interval),
            tracker_startup_attempts: match get(ENV_TRACKER_STARTUP_ATTEMPTS) {
                Some(v) => match v.trim().parse::<u32>() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(invalid(ENV_TRACKER_STARTUP_ATTEMPTS, v)),
                },
                None => defaults.tracker_startup_attempts,
            },
            tracker_retry_interval: millis(
                ENV_TRACKER_RETRY_INTERVAL_MS,
                get(ENV_TRACKER_RETRY_INTERVAL_MS),
            )?
            .unwrap_or(defaults.tracker_retry_interval),
            enforce_binding_direction: match get(ENV_ENFORCE_BINDING_DIRECTION) {
                Some(v) => flag(ENV_ENFORCE_BINDING_DIRECTION, v)?,
                None => defaults.enforce_binding_direction,
            },
        })
    }

    pub fn queue_id(&self) -> Result<QueueId, ConfigError> {
        QueueId::new(self.queue_name.clone()).map_err(|_| invalid(ENV_QUEUE_NAME, self.queue_name.clone()))
    }

    pub fn direction_policy(&self) -> DirectionPolicy {
        if self.enforce_binding_direction {
            DirectionPolicy::OutboundOnly
        } else {
            DirectionPolicy::AnyDirection
        }
    }
}

fn invalid(key: &'static str, value: String) -> ConfigError {
    ConfigError::Invalid { key, value }
}

fn millis(key: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| invalid(key, v)),
    }
}

fn flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

//! Tracing/logging initialization.

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Default filter directive when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Telemetry settings for one service.
///
/// Components receive a clone and open their spans through it, so every log
/// line carries the service name and component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryContext {
    service: String,
    json: bool,
    filter: String,
}

impl TelemetryContext {
    /// JSON logs, filter from `RUST_LOG` (default `info`).
    pub fn new(service: impl Into<String>) -> Self {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        Self {
            service: service.into(),
            json: true,
            filter,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Human-readable output instead of JSON.
    pub fn with_pretty_output(mut self) -> Self {
        self.json = false;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Install the subscriber for this process.
    ///
    /// Returns `false` when a subscriber was already installed; that one
    /// stays in effect.
    pub fn install(&self) -> bool {
        let filter = EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false);

        if self.json {
            builder.json().try_init().is_ok()
        } else {
            builder.try_init().is_ok()
        }
    }

    /// Span for a named component of this service.
    pub fn span(&self, component: &str) -> Span {
        tracing::info_span!("component", service = %self.service, component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let ctx = TelemetryContext::new("dmq")
            .with_filter("debug")
            .with_pretty_output();

        assert_eq!(ctx.service(), "dmq");
        assert_eq!(ctx.filter(), "debug");
        assert!(!ctx.is_json());
    }

    #[test]
    fn install_is_idempotent() {
        let ctx = TelemetryContext::new("dmq").with_filter("off");
        let first = ctx.install();
        let second = ctx.install();
        assert!(!second || !first);
    }

    #[test]
    fn spans_can_be_entered_without_a_subscriber() {
        let ctx = TelemetryContext::new("dmq");
        let span = ctx.span("worker");
        let _guard = span.enter();
    }
}

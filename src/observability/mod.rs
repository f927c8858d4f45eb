//! Observability subsystem: tracing setup plus trait-based event recording.
//!
//! Provides a pluggable [`Observer`] trait with two backends:
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Zero overhead, discards everything (default) |
//! | `log`   | Emits structured events via `tracing` |
//!
//! The [`create_observer`] factory builds the right backend from
//! [`ObservabilityConfig`].

mod log;
mod noop;
pub mod traits;

#[cfg(test)]
pub mod recording;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use self::log::LogObserver;
pub use self::noop::NoopObserver;
pub use self::traits::{Observer, ObserverEvent, ObserverMetric};

/// Configuration for logging and the observer backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Backend name: "none", "noop", or "log".
    pub backend: String,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json_logs: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: "none".into(),
            json_logs: false,
            default_filter: "info".into(),
        }
    }
}

/// Create an observer from configuration.
///
/// Returns a [`NoopObserver`] for "none"/"noop" (or unknown values) and a
/// [`LogObserver`] for "log".
pub fn create_observer(config: &ObservabilityConfig) -> Arc<dyn Observer> {
    match config.backend.as_str() {
        "log" => Arc::new(LogObserver),
        "none" | "noop" | "" => Arc::new(NoopObserver),
        other => {
            tracing::warn!(backend = other, "Unknown observability backend, using noop");
            Arc::new(NoopObserver)
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.default_filter`. Returns `false` if a
/// subscriber was already installed (e.g. by the host application).
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let result = if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(backend: &str) -> ObservabilityConfig {
        ObservabilityConfig {
            backend: backend.into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_none() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.backend, "none");
        assert!(!config.json_logs);
    }

    #[test]
    fn factory_returns_noop_for_none() {
        assert_eq!(create_observer(&test_config("none")).name(), "noop");
    }

    #[test]
    fn factory_returns_noop_for_unknown() {
        assert_eq!(create_observer(&test_config("prometheus")).name(), "noop");
    }

    #[test]
    fn factory_returns_log_for_log() {
        assert_eq!(create_observer(&test_config("log")).name(), "log");
    }

    #[test]
    fn recording_observer_captures_events() {
        let (observer, events, _metrics) = recording::RecordingObserver::new();
        observer.record_event(&ObserverEvent::BreakerRecovered {
            provider: "azure".into(),
        });
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        let config = ObservabilityConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}

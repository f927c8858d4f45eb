//! Tracing-based observer that emits structured log events.
//!
//! Events appear alongside normal application logs with no extra
//! dependencies. Good for local development and debugging.

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that logs events and metrics via `tracing`.
pub struct LogObserver;

impl Observer for LogObserver {
    #[allow(clippy::cognitive_complexity, clippy::too_many_lines)] // Exhaustive match over event variants
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::Routed {
                request_id,
                policy,
                tier,
                economy,
                complexity,
                domain,
                candidates,
            } => {
                tracing::info!(
                    request_id,
                    policy,
                    tier,
                    economy,
                    complexity,
                    domain = domain.as_deref().unwrap_or(""),
                    candidates,
                    "observer: request.routed"
                );
            }
            ObserverEvent::FailOpen {
                request_id,
                reason,
                fallback_model,
            } => {
                tracing::error!(
                    request_id,
                    reason,
                    fallback_model,
                    severity = "critical",
                    "observer: routing.fail_open"
                );
            }
            ObserverEvent::HealthBypassed { request_id, model } => {
                tracing::warn!(request_id, model, "observer: health.bypassed");
            }
            ObserverEvent::AttemptFailed {
                model,
                provider,
                error,
                retryable,
                duration,
            } => {
                tracing::info!(
                    model,
                    provider,
                    error = error.as_str(),
                    retryable,
                    duration_ms = duration.as_millis() as u64,
                    "observer: attempt.failed"
                );
            }
            ObserverEvent::BreakerTripped {
                provider,
                error_count,
                cooldown,
            } => {
                tracing::warn!(
                    provider,
                    error_count,
                    cooldown_secs = cooldown.as_secs(),
                    "observer: breaker.tripped"
                );
            }
            ObserverEvent::BreakerRecovered { provider } => {
                tracing::info!(provider, "observer: breaker.recovered");
            }
            ObserverEvent::Settled {
                request_id,
                user_id,
                model,
                cost,
            } => {
                tracing::info!(
                    request_id,
                    user_id,
                    model,
                    cost = %cost,
                    "observer: request.settled"
                );
            }
            ObserverEvent::SettlementDeferred {
                request_id,
                stage,
                error,
            } => {
                tracing::warn!(
                    request_id,
                    stage,
                    error = error.as_str(),
                    "observer: settlement.deferred"
                );
            }
            ObserverEvent::Error { component, message } => {
                tracing::warn!(component, error = message.as_str(), "observer: error");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::RequestLatency(d) => {
                tracing::debug!(
                    latency_ms = d.as_millis() as u64,
                    "observer: metric.request_latency"
                );
            }
            ObserverMetric::TokensUsed(n) => {
                tracing::debug!(tokens = n, "observer: metric.tokens_used");
            }
            ObserverMetric::AttemptsPerRequest(n) => {
                tracing::debug!(attempts = n, "observer: metric.attempts_per_request");
            }
            ObserverMetric::ReconciliationDepth(n) => {
                tracing::debug!(depth = n, "observer: metric.reconciliation_depth");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;
    use tracing_test::traced_test;

    use crate::observability::log::LogObserver;
    use crate::observability::traits::*;

    #[test]
    fn name_is_log() {
        assert_eq!(LogObserver.name(), "log");
    }

    #[traced_test]
    #[test]
    fn fail_open_is_logged_as_critical() {
        LogObserver.record_event(&ObserverEvent::FailOpen {
            request_id: "req-9".into(),
            reason: "Model registry is empty".into(),
            fallback_model: "azure/gpt-4o".into(),
        });
        assert!(logs_contain("routing.fail_open"));
        assert!(logs_contain("critical"));
    }

    #[test]
    fn record_event_does_not_panic() {
        let obs = LogObserver;
        obs.record_event(&ObserverEvent::Routed {
            request_id: "req-1".into(),
            policy: "default".into(),
            tier: "smart".into(),
            economy: true,
            complexity: 0.6,
            domain: Some("legal".into()),
            candidates: 3,
        });
        obs.record_event(&ObserverEvent::HealthBypassed {
            request_id: "req-1".into(),
            model: "azure/gpt-4o".into(),
        });
        obs.record_event(&ObserverEvent::AttemptFailed {
            model: "azure/gpt-4o".into(),
            provider: "azure".into(),
            error: "503".into(),
            retryable: true,
            duration: Duration::from_millis(120),
        });
        obs.record_event(&ObserverEvent::BreakerTripped {
            provider: "azure".into(),
            error_count: 4,
            cooldown: Duration::from_secs(300),
        });
        obs.record_event(&ObserverEvent::BreakerRecovered {
            provider: "azure".into(),
        });
        obs.record_event(&ObserverEvent::Settled {
            request_id: "req-1".into(),
            user_id: "alice".into(),
            model: "azure/gpt-4o".into(),
            cost: dec!(0.0125),
        });
        obs.record_event(&ObserverEvent::SettlementDeferred {
            request_id: "req-1".into(),
            stage: "deduct".into(),
            error: "budget service down".into(),
        });
        obs.record_event(&ObserverEvent::Error {
            component: "accountant".into(),
            message: "queue full".into(),
        });
    }

    #[test]
    fn record_metric_does_not_panic() {
        let obs = LogObserver;
        obs.record_metric(&ObserverMetric::RequestLatency(Duration::from_millis(200)));
        obs.record_metric(&ObserverMetric::TokensUsed(1000));
        obs.record_metric(&ObserverMetric::AttemptsPerRequest(2));
        obs.record_metric(&ObserverMetric::ReconciliationDepth(0));
    }
}

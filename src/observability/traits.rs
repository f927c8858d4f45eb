//! Core observer trait and event/metric types.

use std::time::Duration;

use rust_decimal::Decimal;

/// Provider-agnostic observer for routing lifecycle events and metrics.
///
/// The engine records events at key points of a request (routing, failed
/// attempts, breaker transitions, settlement) and the observer decides what
/// to do with them.
///
/// Thread-safe and cheaply cloneable behind `Arc<dyn Observer>`.
pub trait Observer: Send + Sync {
    /// Record a discrete lifecycle event.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// Discrete lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    /// The router produced a candidate chain.
    Routed {
        request_id: String,
        policy: String,
        tier: String,
        economy: bool,
        complexity: f64,
        domain: Option<String>,
        candidates: usize,
    },

    /// Routing failed and the safe default chain was used instead.
    FailOpen {
        request_id: String,
        reason: String,
        fallback_model: String,
    },

    /// Every candidate was unhealthy; the first was attempted anyway.
    HealthBypassed { request_id: String, model: String },

    /// One dispatch attempt failed.
    AttemptFailed {
        model: String,
        provider: String,
        error: String,
        retryable: bool,
        duration: Duration,
    },

    /// A provider's circuit breaker opened.
    BreakerTripped {
        provider: String,
        error_count: u32,
        cooldown: Duration,
    },

    /// A provider became eligible again.
    BreakerRecovered { provider: String },

    /// A ledger entry was written for a successful request.
    Settled {
        request_id: String,
        user_id: String,
        model: String,
        cost: Decimal,
    },

    /// Budget deduction or audit logging failed and was queued for retry.
    SettlementDeferred {
        request_id: String,
        stage: String,
        error: String,
    },

    /// An error occurred in a component.
    Error { component: String, message: String },
}

/// Numeric metric samples.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMetric {
    /// End-to-end latency of a request.
    RequestLatency(Duration),
    /// Tokens consumed by one completion.
    TokensUsed(u64),
    /// Attempts made for one request, including the successful one.
    AttemptsPerRequest(u64),
    /// Settlements waiting in the reconciliation queue (gauge).
    ReconciliationDepth(u64),
}

#[cfg(test)]
mod tests {
    use crate::observability::traits::*;

    #[test]
    fn event_variants_are_constructible() {
        let _ = ObserverEvent::Routed {
            request_id: "req-1".into(),
            policy: "default".into(),
            tier: "fast".into(),
            economy: false,
            complexity: 0.05,
            domain: None,
            candidates: 2,
        };
        let _ = ObserverEvent::FailOpen {
            request_id: "req-1".into(),
            reason: "Model registry is empty".into(),
            fallback_model: "azure/gpt-4o".into(),
        };
        let _ = ObserverEvent::AttemptFailed {
            model: "azure/gpt-4o".into(),
            provider: "azure".into(),
            error: "rate limited".into(),
            retryable: true,
            duration: Duration::from_millis(40),
        };
        let _ = ObserverEvent::BreakerTripped {
            provider: "azure".into(),
            error_count: 4,
            cooldown: Duration::from_secs(300),
        };
        let _ = ObserverEvent::Settled {
            request_id: "req-1".into(),
            user_id: "alice".into(),
            model: "azure/gpt-4o".into(),
            cost: Decimal::new(15, 4),
        };
        let _ = ObserverEvent::SettlementDeferred {
            request_id: "req-1".into(),
            stage: "audit".into(),
            error: "unavailable".into(),
        };
    }
}

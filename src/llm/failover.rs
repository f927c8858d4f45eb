//! Bounded multi-provider failover.
//!
//! Walks a candidate chain in order until one model succeeds. Retryable
//! failures are reported to the [`HealthTracker`] and the next candidate is
//! tried; non-retryable failures abort the walk immediately because a
//! different provider will not fix a bad request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{AttemptFailure, DispatchError, ProviderError};
use crate::llm::health::{AttemptOutcome, HealthTracker, HealthTransition};
use crate::llm::provider::{CompletionBackend, CompletionRequest, CompletionResponse};
use crate::llm::registry::ModelDefinition;
use crate::observability::{NoopObserver, Observer, ObserverEvent};

/// Time limits for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Ceiling for a single attempt.
    #[serde(rename = "attempt_timeout_secs", with = "crate::config::secs")]
    pub attempt_timeout: Duration,
    /// Ceiling for the whole chain.
    #[serde(rename = "total_timeout_secs", with = "crate::config::secs")]
    pub total_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(90),
        }
    }
}

/// A successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: CompletionResponse,
    /// The model that actually served the request.
    pub model: ModelDefinition,
    /// Failed attempts that preceded the success.
    pub failures: Vec<AttemptFailure>,
}

impl DispatchOutcome {
    /// Total attempts including the successful one.
    pub fn attempts(&self) -> usize {
        self.failures.len() + 1
    }
}

/// Executes a candidate chain against the completion backend.
pub struct Dispatcher {
    backend: Arc<dyn CompletionBackend>,
    health: Arc<HealthTracker>,
    config: DispatchConfig,
    observer: Arc<dyn Observer>,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        health: Arc<HealthTracker>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            backend,
            health,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Try each candidate in order until one succeeds, the chain is
    /// exhausted, a non-retryable error occurs, or the total deadline passes.
    ///
    /// Dropping the returned future abandons the in-flight attempt without
    /// recording an outcome for it.
    pub async fn dispatch(
        &self,
        chain: &[ModelDefinition],
        request: &CompletionRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        if chain.is_empty() {
            return Err(DispatchError::EmptyChain);
        }

        let deadline = Instant::now() + self.config.total_timeout;
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for (i, model) in chain.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.deadline_exceeded(failures));
            }
            let budget = self.config.attempt_timeout.min(remaining);
            let started = Instant::now();

            let result =
                match tokio::time::timeout(budget, self.backend.complete(&model.id, request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        provider: model.provider.clone(),
                        timeout: budget,
                    }),
                };

            let err = match result {
                Ok(response) => {
                    self.record(&model.provider, AttemptOutcome::Success);
                    if i > 0 {
                        tracing::info!(
                            model = %model.id,
                            provider = %model.provider,
                            failed_attempts = failures.len(),
                            "Request served after failover"
                        );
                    }
                    return Ok(DispatchOutcome {
                        response,
                        model: model.clone(),
                        failures,
                    });
                }
                Err(err) => err,
            };

            let retryable = err.is_retryable();
            self.record(&model.provider, AttemptOutcome::from_error(&err));
            self.observer.record_event(&ObserverEvent::AttemptFailed {
                model: model.id.clone(),
                provider: model.provider.clone(),
                error: err.to_string(),
                retryable,
                duration: started.elapsed(),
            });

            if !retryable {
                tracing::warn!(
                    model = %model.id,
                    provider = %model.provider,
                    error = %err,
                    "Non-retryable error, aborting failover"
                );
                return Err(DispatchError::NonRetryable {
                    model_id: model.id.clone(),
                    source: err,
                    attempts: failures,
                });
            }

            if let Some(next) = chain.get(i + 1) {
                tracing::warn!(
                    model = %model.id,
                    provider = %model.provider,
                    error = %err,
                    next_model = %next.id,
                    "Model failed with retryable error, trying next candidate"
                );
            }
            failures.push(AttemptFailure {
                model_id: model.id.clone(),
                error: err,
            });
        }

        tracing::error!(
            attempts = failures.len(),
            "All candidates exhausted"
        );
        Err(DispatchError::AllCandidatesExhausted { attempts: failures })
    }

    fn record(&self, provider: &str, outcome: AttemptOutcome) {
        match self.health.record_outcome(provider, outcome) {
            HealthTransition::Tripped {
                error_count,
                cooldown,
            } => self.observer.record_event(&ObserverEvent::BreakerTripped {
                provider: provider.to_string(),
                error_count,
                cooldown,
            }),
            HealthTransition::Recovered => {
                self.observer.record_event(&ObserverEvent::BreakerRecovered {
                    provider: provider.to_string(),
                })
            }
            HealthTransition::Unchanged => {}
        }
    }

    fn deadline_exceeded(&self, attempts: Vec<AttemptFailure>) -> DispatchError {
        tracing::error!(
            budget_secs = self.config.total_timeout.as_secs(),
            attempts = attempts.len(),
            "Dispatch deadline exceeded"
        );
        DispatchError::DeadlineExceeded {
            budget: self.config.total_timeout,
            attempts,
        }
    }
}

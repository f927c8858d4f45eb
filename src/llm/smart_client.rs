//! Request facade: classify, check budget, route, filter, dispatch, settle.
//!
//! Two failure policies meet here and point in opposite directions:
//!
//! - Routing fails **open**. If the router cannot produce a chain, the
//!   request goes to a configured safe default model and a critical log is
//!   emitted. Availability wins.
//! - Budget fails **closed**. If the allowance cannot be read, or is spent,
//!   the request is denied before any provider is contacted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::collaborators::BudgetClient;
use crate::error::{AccountingError, ArbitrageError};
use crate::llm::accountant::Accountant;
use crate::llm::costs::{default_rates, reference_rates};
use crate::llm::failover::Dispatcher;
use crate::llm::health::HealthTracker;
use crate::llm::provider::{ChatMessage, CompletionRequest, TokenUsage};
use crate::llm::registry::{ModelDefinition, Tier};
use crate::llm::routing::{BudgetState, Gatekeeper, Router};
use crate::observability::{NoopObserver, Observer, ObserverEvent, ObserverMetric};

/// Default safe model when routing fails.
pub const DEFAULT_FALLBACK_MODEL: &str = "azure/gpt-4o";

/// Where requests go when the router cannot decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailOpenConfig {
    /// Model id of the safe default. Looked up in the registry first; if it
    /// is not registered it is priced from reference rates.
    pub default_model: String,
}

impl Default for FailOpenConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_FALLBACK_MODEL.to_string(),
        }
    }
}

/// Facade tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartClientConfig {
    pub fail_open: FailOpenConfig,
    /// Caller groups that never get downgraded by economy mode.
    /// Compared case-insensitively.
    pub economy_exempt_groups: Vec<String>,
    /// Ceiling on the allowance check. A budget service that does not answer
    /// in time is treated as unreachable and the request is denied.
    #[serde(rename = "budget_timeout_secs", with = "crate::config::secs")]
    pub budget_timeout: Duration,
}

impl Default for SmartClientConfig {
    fn default() -> Self {
        Self {
            fail_open: FailOpenConfig::default(),
            economy_exempt_groups: vec!["executives".to_string()],
            budget_timeout: Duration::from_secs(5),
        }
    }
}

/// Inbound generation request.
#[derive(Debug, Clone, Default)]
pub struct ArbitrageRequest {
    pub messages: Vec<ChatMessage>,
    /// Caller's preferred model. Advisory only: routing decides.
    pub model: Option<String>,
    pub user: String,
    pub groups: Vec<String>,
    /// Idempotency key for settlement. Generated when absent.
    pub request_id: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Passed through to the completion backend untouched.
    pub options: HashMap<String, serde_json::Value>,
}

impl ArbitrageRequest {
    pub fn new(user: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    fn to_completion_request(&self) -> CompletionRequest {
        CompletionRequest {
            messages: self.messages.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            options: self.options.clone(),
        }
    }
}

/// Result of a served request.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrageResponse {
    pub request_id: String,
    pub content: String,
    /// Model that actually produced `content`.
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub cost: Decimal,
    /// Failed attempts before the one that succeeded.
    pub failed_attempts: usize,
    /// Whether routing failed and the safe default was used.
    pub fail_open: bool,
}

#[derive(Default)]
struct SmartClientStats {
    total_requests: AtomicU64,
    budget_denials: AtomicU64,
    fail_opens: AtomicU64,
    health_bypasses: AtomicU64,
    economy_downgrades: AtomicU64,
    dispatch_failures: AtomicU64,
}

/// Point-in-time copy of the facade's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmartClientSnapshot {
    pub total_requests: u64,
    pub budget_denials: u64,
    pub fail_opens: u64,
    pub health_bypasses: u64,
    pub economy_downgrades: u64,
    pub dispatch_failures: u64,
}

/// The single entry point callers use.
pub struct SmartClient {
    gatekeeper: Gatekeeper,
    router: Router,
    health: Arc<HealthTracker>,
    dispatcher: Dispatcher,
    accountant: Arc<Accountant>,
    budget: Arc<dyn BudgetClient>,
    observer: Arc<dyn Observer>,
    config: SmartClientConfig,
    stats: SmartClientStats,
}

impl SmartClient {
    pub fn new(
        gatekeeper: Gatekeeper,
        router: Router,
        health: Arc<HealthTracker>,
        dispatcher: Dispatcher,
        accountant: Arc<Accountant>,
        budget: Arc<dyn BudgetClient>,
        config: SmartClientConfig,
    ) -> Self {
        Self {
            gatekeeper,
            router,
            health,
            dispatcher,
            accountant,
            budget,
            observer: Arc::new(NoopObserver),
            config,
            stats: SmartClientStats::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn accountant(&self) -> &Arc<Accountant> {
        &self.accountant
    }

    pub fn stats(&self) -> SmartClientSnapshot {
        SmartClientSnapshot {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            budget_denials: self.stats.budget_denials.load(Ordering::Relaxed),
            fail_opens: self.stats.fail_opens.load(Ordering::Relaxed),
            health_bypasses: self.stats.health_bypasses.load(Ordering::Relaxed),
            economy_downgrades: self.stats.economy_downgrades.load(Ordering::Relaxed),
            dispatch_failures: self.stats.dispatch_failures.load(Ordering::Relaxed),
        }
    }

    /// Serve one request end to end.
    pub async fn complete(
        &self,
        request: ArbitrageRequest,
    ) -> Result<ArbitrageResponse, ArbitrageError> {
        let started = Instant::now();
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let user = request.user.as_str();

        let completion_request = request.to_completion_request();
        let prompt = completion_request.last_user_prompt();
        if prompt.is_empty() {
            tracing::warn!(%request_id, "No user message found, classifying empty prompt");
        }
        if let Some(hint) = request.model.as_deref() {
            tracing::debug!(%request_id, hint, "Model hint is advisory and ignored by routing");
        }

        let context = self.gatekeeper.classify(prompt);
        tracing::debug!(
            %request_id,
            complexity = context.complexity(),
            domain = ?context.domain(),
            raw_length = context.raw_length(),
            "Classified request"
        );

        let remaining = self.check_budget(&request_id, user).await?;
        let budget = BudgetState::new(remaining).exempt(self.is_exempt(&request.groups));

        let (chain, fail_open) = match self.router.select_for_prompt(prompt, &context, budget) {
            Ok(decision) => {
                if decision.economy {
                    self.stats.economy_downgrades.fetch_add(1, Ordering::Relaxed);
                }
                tracing::info!(
                    %request_id,
                    policy = %decision.policy,
                    tier = %decision.tier,
                    economy = decision.economy,
                    candidates = ?decision.model_ids(),
                    "Routed request"
                );
                self.observer.record_event(&ObserverEvent::Routed {
                    request_id: request_id.clone(),
                    policy: decision.policy.clone(),
                    tier: decision.tier.to_string(),
                    economy: decision.economy,
                    complexity: context.complexity(),
                    domain: context.domain().map(str::to_string),
                    candidates: decision.candidates.len(),
                });
                (decision.candidates, false)
            }
            Err(err) => {
                self.stats.fail_opens.fetch_add(1, Ordering::Relaxed);
                let fallback = self.fail_open_model();
                tracing::error!(
                    severity = "critical",
                    %request_id,
                    error = %err,
                    fallback_model = %fallback.id,
                    "Fail-Open triggered: routing failed, using safe default model"
                );
                self.observer.record_event(&ObserverEvent::FailOpen {
                    request_id: request_id.clone(),
                    reason: err.to_string(),
                    fallback_model: fallback.id.clone(),
                });
                (vec![fallback], true)
            }
        };

        let filtered = self.health.filter_or_bypass(&chain);
        if filtered.bypassed {
            self.stats.health_bypasses.fetch_add(1, Ordering::Relaxed);
            if let Some(first) = filtered.candidates.first() {
                tracing::warn!(
                    %request_id,
                    model = %first.id,
                    provider = %first.provider,
                    "All candidate providers unhealthy, attempting first candidate anyway"
                );
                self.observer.record_event(&ObserverEvent::HealthBypassed {
                    request_id: request_id.clone(),
                    model: first.id.clone(),
                });
            }
        }

        let outcome = match self
            .dispatcher
            .dispatch(&filtered.candidates, &completion_request)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%request_id, error = %err, "Request failed");
                self.observer.record_event(&ObserverEvent::Error {
                    component: "dispatcher".to_string(),
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let usage = outcome.response.usage();
        let cost = match self
            .accountant
            .settle(&request_id, user, &outcome.model, usage)
        {
            Ok(entry) => entry.cost,
            Err(AccountingError::AlreadySettled { .. }) => {
                // The response is still delivered; the duplicate is not billed.
                tracing::warn!(
                    %request_id,
                    model = %outcome.model.id,
                    "Request id already settled, response served without a second charge"
                );
                Decimal::ZERO
            }
        };

        self.observer
            .record_metric(&ObserverMetric::RequestLatency(started.elapsed()));
        self.observer.record_metric(&ObserverMetric::TokensUsed(
            u64::from(usage.input_tokens) + u64::from(usage.output_tokens),
        ));
        self.observer
            .record_metric(&ObserverMetric::AttemptsPerRequest(outcome.attempts() as u64));

        Ok(ArbitrageResponse {
            request_id,
            content: outcome.response.content,
            failed_attempts: outcome.failures.len(),
            model: outcome.model.id,
            provider: outcome.model.provider,
            usage,
            cost,
            fail_open,
        })
    }

    async fn check_budget(&self, request_id: &str, user: &str) -> Result<f64, ArbitrageError> {
        let deny = |reason: String| {
            self.stats.budget_denials.fetch_add(1, Ordering::Relaxed);
            ArbitrageError::BudgetDenied {
                user: user.to_string(),
                reason,
            }
        };

        let checked =
            tokio::time::timeout(self.config.budget_timeout, self.budget.check_allowance(user))
                .await;
        let Ok(checked) = checked else {
            tracing::error!(
                request_id,
                user,
                timeout_secs = self.config.budget_timeout.as_secs(),
                "Budget check timed out, failing closed"
            );
            return Err(deny("budget check timed out".to_string()));
        };

        match checked {
            Ok(remaining) if remaining.is_finite() && remaining > 0.0 => Ok(remaining),
            Ok(remaining) => {
                tracing::warn!(request_id, user, remaining, "Budget exhausted, denying request");
                Err(deny("budget exhausted".to_string()))
            }
            Err(err) => {
                tracing::error!(
                    request_id,
                    user,
                    error = %err,
                    "Budget check failed, failing closed"
                );
                Err(deny(err.to_string()))
            }
        }
    }

    fn is_exempt(&self, groups: &[String]) -> bool {
        groups.iter().any(|g| {
            self.config
                .economy_exempt_groups
                .iter()
                .any(|exempt| exempt.eq_ignore_ascii_case(g))
        })
    }

    fn fail_open_model(&self) -> ModelDefinition {
        let id = &self.config.fail_open.default_model;
        if let Some(model) = self.router.registry().get(id) {
            return model;
        }
        let provider = id.split_once('/').map(|(p, _)| p).unwrap_or("default");
        let (input, output) = reference_rates(id).unwrap_or_else(default_rates);
        ModelDefinition::new(id.clone(), provider, Tier::Smart, input, output)
    }
}

//! Shared collaborator doubles for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arbitrage::error::{AuditError, BudgetError, ProviderError};
use arbitrage::observability::{Observer, ObserverEvent, ObserverMetric};
use arbitrage::{
    ArbitrageConfig, ArbitrageEngine, AuditClient, BudgetClient, Collaborators, CompletionBackend,
    CompletionRequest, CompletionResponse, LedgerEntry, ModelDefinition, Tier,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const INPUT_TOKENS: u32 = 1000;
pub const OUTPUT_TOKENS: u32 = 500;

/// Completion backend whose per-model failures can be scripted.
#[derive(Default)]
pub struct MockBackend {
    failures: Mutex<HashMap<String, ProviderError>>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn fail(&self, model_id: &str, error: ProviderError) {
        self.failures
            .lock()
            .unwrap()
            .insert(model_id.to_string(), error);
    }

    pub fn heal(&self, model_id: &str) {
        self.failures.lock().unwrap().remove(model_id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(
        &self,
        model_id: &str,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.lock().unwrap().push(model_id.to_string());
        if let Some(err) = self.failures.lock().unwrap().get(model_id) {
            return Err(err.clone());
        }
        Ok(CompletionResponse {
            content: format!("{model_id}: ok"),
            input_tokens: INPUT_TOKENS,
            output_tokens: OUTPUT_TOKENS,
        })
    }
}

pub struct MockBudget {
    allowance: Mutex<Result<f64, BudgetError>>,
    pub deducted: Mutex<Vec<(String, Decimal)>>,
}

impl MockBudget {
    pub fn with_allowance(allowance: Result<f64, BudgetError>) -> Self {
        Self {
            allowance: Mutex::new(allowance),
            deducted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_allowance(&self, allowance: Result<f64, BudgetError>) {
        *self.allowance.lock().unwrap() = allowance;
    }
}

impl Default for MockBudget {
    fn default() -> Self {
        Self::with_allowance(Ok(1.0))
    }
}

#[async_trait]
impl BudgetClient for MockBudget {
    async fn check_allowance(&self, _user_id: &str) -> Result<f64, BudgetError> {
        self.allowance.lock().unwrap().clone()
    }

    async fn deduct(&self, user_id: &str, cost: Decimal) -> Result<(), BudgetError> {
        self.deducted
            .lock()
            .unwrap()
            .push((user_id.to_string(), cost));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockAudit {
    pub fail: AtomicBool,
    pub entries: Mutex<Vec<LedgerEntry>>,
}

impl MockAudit {
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditClient for MockAudit {
    async fn log_transaction(&self, entry: &LedgerEntry) -> Result<(), AuditError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuditError("audit sink offline".into()));
        }
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Observer that keeps every event for later assertions.
#[derive(Default)]
pub struct CapturingObserver {
    pub events: Mutex<Vec<ObserverEvent>>,
}

impl CapturingObserver {
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Observer for CapturingObserver {
    fn record_event(&self, event: &ObserverEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn record_metric(&self, _metric: &ObserverMetric) {}

    fn name(&self) -> &str {
        "capturing"
    }
}

pub fn models() -> Vec<ModelDefinition> {
    vec![
        ModelDefinition::new("azure/gpt-4o-mini", "azure", Tier::Fast, dec!(0.00015), dec!(0.0006)),
        ModelDefinition::new("aws/claude-haiku", "aws", Tier::Fast, dec!(0.00025), dec!(0.00125)),
        ModelDefinition::new("azure/gpt-4o", "azure", Tier::Smart, dec!(0.0025), dec!(0.01)),
        ModelDefinition::new("aws/claude-sonnet", "aws", Tier::Smart, dec!(0.003), dec!(0.015)),
        ModelDefinition::new("azure/o1", "azure", Tier::Reasoning, dec!(0.015), dec!(0.06)),
        ModelDefinition::new("aws/claude-opus", "aws", Tier::Reasoning, dec!(0.015), dec!(0.075)),
        ModelDefinition::new(
            "foundry/oncology-reasoner",
            "foundry",
            Tier::Reasoning,
            dec!(0.004),
            dec!(0.008),
        )
        .with_tag("medical"),
    ]
}

pub struct Harness {
    pub engine: ArbitrageEngine,
    pub backend: Arc<MockBackend>,
    pub budget: Arc<MockBudget>,
    pub audit: Arc<MockAudit>,
    pub observer: Arc<CapturingObserver>,
}

impl Harness {
    pub fn new(config: ArbitrageConfig) -> Self {
        let backend = Arc::new(MockBackend::default());
        let budget = Arc::new(MockBudget::default());
        let audit = Arc::new(MockAudit::default());
        let observer = Arc::new(CapturingObserver::default());

        let collaborators = Collaborators::new(
            Arc::clone(&backend) as Arc<dyn CompletionBackend>,
            Arc::clone(&budget) as Arc<dyn BudgetClient>,
            Arc::clone(&audit) as Arc<dyn AuditClient>,
        );
        let engine = ArbitrageEngine::new_with_observer(
            config,
            collaborators,
            Arc::clone(&observer) as Arc<dyn Observer>,
        )
        .expect("valid config");

        Self {
            engine,
            backend,
            budget,
            audit,
            observer,
        }
    }

    pub fn with_models() -> Self {
        Self::new(ArbitrageConfig {
            models: models(),
            ..Default::default()
        })
    }

    /// Wait for background deduction and audit tasks.
    pub async fn settle(&self) {
        self.engine.accountant().flush().await;
    }
}

pub fn rate_limited(provider: &str) -> ProviderError {
    ProviderError::RateLimited {
        provider: provider.to_string(),
        retry_after: None,
    }
}

pub fn server_error(provider: &str) -> ProviderError {
    ProviderError::ServerError {
        provider: provider.to_string(),
        reason: "503 Service Unavailable".to_string(),
    }
}

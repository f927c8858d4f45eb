//! Capability interfaces for the services the core depends on but never
//! constructs: budget, audit, and the model foundry.
//!
//! Implementations are injected through [`Collaborators`]; the core only sees
//! trait objects.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::{AuditError, BudgetError, FoundryError};
use crate::llm::{CompletionBackend, LedgerEntry, ModelDefinition};

/// Budget service.
#[async_trait]
pub trait BudgetClient: Send + Sync {
    /// Remaining budget for `user_id` as a fraction in `[0, 1]`.
    ///
    /// Any error denies the request (fail closed).
    async fn check_allowance(&self, user_id: &str) -> Result<f64, BudgetError>;

    /// Deduct `cost` after a successful completion. Best-effort.
    async fn deduct(&self, user_id: &str, cost: Decimal) -> Result<(), BudgetError>;
}

/// Audit/compliance sink. Fire-and-forget from the core's perspective.
#[async_trait]
pub trait AuditClient: Send + Sync {
    async fn log_transaction(&self, entry: &LedgerEntry) -> Result<(), AuditError>;
}

/// Source of fine-tuned, domain-specialized models.
#[async_trait]
pub trait ModelFoundryClient: Send + Sync {
    async fn list_specialized_models(
        &self,
        domain: &str,
    ) -> Result<Vec<ModelDefinition>, FoundryError>;
}

/// Injected collaborator set for an engine.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn CompletionBackend>,
    pub budget: Arc<dyn BudgetClient>,
    pub audit: Arc<dyn AuditClient>,
    pub foundry: Option<Arc<dyn ModelFoundryClient>>,
}

impl Collaborators {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        budget: Arc<dyn BudgetClient>,
        audit: Arc<dyn AuditClient>,
    ) -> Self {
        Self {
            backend,
            budget,
            audit,
            foundry: None,
        }
    }

    pub fn with_foundry(mut self, foundry: Arc<dyn ModelFoundryClient>) -> Self {
        self.foundry = Some(foundry);
        self
    }
}

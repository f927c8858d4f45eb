//! Cost ledger for successful completions.
//!
//! [`Accountant::settle`] prices a completion with the model that actually
//! served it, returns the ledger entry synchronously, and hands budget
//! deduction plus audit logging to tracked background tasks. Those side
//! effects are best-effort: failures land in a [`ReconciliationQueue`] and
//! are retried by [`Accountant::reconcile`], never surfaced to the caller.
//!
//! Settlement is idempotent per request id. A bounded LRU remembers recently
//! settled ids; a second settle for the same id is rejected. Ids evicted from
//! the LRU are forgotten, so request ids must not be reused once
//! `settled_id_capacity` newer requests have settled.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;

use crate::collaborators::{AuditClient, BudgetClient};
use crate::error::AccountingError;
use crate::llm::costs::compute_cost;
use crate::llm::provider::TokenUsage;
use crate::llm::registry::ModelDefinition;
use crate::observability::{NoopObserver, Observer, ObserverEvent, ObserverMetric};

/// Immutable record of one successful, billed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: String,
    pub user_id: String,
    pub model_id: String,
    pub provider: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Which side effect of a settlement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStage {
    Deduct,
    Audit,
}

impl fmt::Display for SettlementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementStage::Deduct => write!(f, "deduct"),
            SettlementStage::Audit => write!(f, "audit"),
        }
    }
}

/// A side effect waiting to be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSettlement {
    pub entry: LedgerEntry,
    pub stage: SettlementStage,
    /// Failed attempts so far, including the original one.
    pub attempts: u32,
    pub last_error: String,
}

/// Holding area for settlements whose deduction or audit write failed.
///
/// The in-memory default loses its contents on restart; a durable
/// implementation can be injected where that matters.
pub trait ReconciliationQueue: Send + Sync {
    fn push(&self, item: PendingSettlement);

    /// Remove and return everything currently queued.
    fn drain(&self) -> Vec<PendingSettlement>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory queue. When full, the oldest item is dropped.
pub struct InMemoryReconciliationQueue {
    items: Mutex<VecDeque<PendingSettlement>>,
    capacity: usize,
}

impl InMemoryReconciliationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for InMemoryReconciliationQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ReconciliationQueue for InMemoryReconciliationQueue {
    fn push(&self, item: PendingSettlement) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.len() >= self.capacity {
            if let Some(dropped) = items.pop_front() {
                tracing::error!(
                    request_id = %dropped.entry.request_id,
                    stage = %dropped.stage,
                    capacity = self.capacity,
                    "Reconciliation queue full, dropping oldest settlement"
                );
            }
        }
        items.push_back(item);
    }

    fn drain(&self) -> Vec<PendingSettlement> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Accountant tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountantConfig {
    /// Ceiling on one deduction or audit call. A call that runs past it
    /// counts as failed and is queued for reconciliation.
    #[serde(rename = "stage_timeout_secs", with = "crate::config::secs")]
    pub stage_timeout: Duration,
    /// How many settled request ids are remembered for duplicate detection.
    pub settled_id_capacity: usize,
    /// Give up on a queued side effect after this many failed attempts.
    pub max_reconcile_attempts: u32,
    /// Capacity of the default in-memory reconciliation queue.
    pub queue_capacity: usize,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(10),
            settled_id_capacity: 100_000,
            max_reconcile_attempts: 5,
            queue_capacity: 10_000,
        }
    }
}

/// Outcome of one [`Accountant::reconcile`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub retried: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub abandoned: usize,
}

pub struct Accountant {
    budget: Arc<dyn BudgetClient>,
    audit: Arc<dyn AuditClient>,
    queue: Arc<dyn ReconciliationQueue>,
    settled: Mutex<LruCache<String, ()>>,
    tasks: TaskTracker,
    observer: Arc<dyn Observer>,
    config: AccountantConfig,
}

impl Accountant {
    pub fn new(
        budget: Arc<dyn BudgetClient>,
        audit: Arc<dyn AuditClient>,
        config: AccountantConfig,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.settled_id_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            budget,
            audit,
            queue: Arc::new(InMemoryReconciliationQueue::new(config.queue_capacity)),
            settled: Mutex::new(LruCache::new(capacity)),
            tasks: TaskTracker::new(),
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn ReconciliationQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Record a successful completion.
    ///
    /// Must be called from within a Tokio runtime: deduction and audit run
    /// as background tasks. Returns [`AccountingError::AlreadySettled`] if
    /// `request_id` was settled before.
    pub fn settle(
        &self,
        request_id: &str,
        user_id: &str,
        model: &ModelDefinition,
        usage: TokenUsage,
    ) -> Result<LedgerEntry, AccountingError> {
        {
            let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
            if settled.contains(request_id) {
                tracing::warn!(request_id, "Duplicate settlement rejected");
                return Err(AccountingError::AlreadySettled {
                    request_id: request_id.to_string(),
                });
            }
            settled.put(request_id.to_string(), ());
        }

        let entry = LedgerEntry {
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            model_id: model.id.clone(),
            provider: model.provider.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: compute_cost(model, usage),
            timestamp: Utc::now(),
        };

        tracing::info!(
            request_id,
            user_id,
            model = %entry.model_id,
            input_tokens = entry.input_tokens,
            output_tokens = entry.output_tokens,
            cost = %entry.cost,
            "Settled request"
        );
        self.observer.record_event(&ObserverEvent::Settled {
            request_id: entry.request_id.clone(),
            user_id: entry.user_id.clone(),
            model: entry.model_id.clone(),
            cost: entry.cost,
        });

        let budget = Arc::clone(&self.budget);
        let audit = Arc::clone(&self.audit);
        let queue = Arc::clone(&self.queue);
        let observer = Arc::clone(&self.observer);
        let timeout = self.config.stage_timeout;
        let background = entry.clone();
        self.tasks.spawn(async move {
            for stage in [SettlementStage::Deduct, SettlementStage::Audit] {
                if let Err(error) = run_stage(stage, &background, &*budget, &*audit, timeout).await
                {
                    tracing::warn!(
                        request_id = %background.request_id,
                        %stage,
                        error = %error,
                        "Settlement side effect failed, queued for reconciliation"
                    );
                    observer.record_event(&ObserverEvent::SettlementDeferred {
                        request_id: background.request_id.clone(),
                        stage: stage.to_string(),
                        error: error.clone(),
                    });
                    queue.push(PendingSettlement {
                        entry: background.clone(),
                        stage,
                        attempts: 1,
                        last_error: error,
                    });
                }
            }
        });

        Ok(entry)
    }

    /// Whether `request_id` is remembered as settled.
    pub fn is_settled(&self, request_id: &str) -> bool {
        self.settled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(request_id)
    }

    /// Retry every queued side effect once.
    pub async fn reconcile(&self) -> ReconcileReport {
        let items = self.queue.drain();
        let mut report = ReconcileReport {
            retried: items.len(),
            ..Default::default()
        };

        for mut item in items {
            let outcome = run_stage(
                item.stage,
                &item.entry,
                &*self.budget,
                &*self.audit,
                self.config.stage_timeout,
            )
            .await;
            match outcome {
                Ok(()) => {
                    tracing::info!(
                        request_id = %item.entry.request_id,
                        stage = %item.stage,
                        attempts = item.attempts + 1,
                        "Reconciled settlement"
                    );
                    report.succeeded += 1;
                }
                Err(error) => {
                    item.attempts += 1;
                    item.last_error = error;
                    if item.attempts >= self.config.max_reconcile_attempts {
                        tracing::error!(
                            request_id = %item.entry.request_id,
                            user_id = %item.entry.user_id,
                            stage = %item.stage,
                            cost = %item.entry.cost,
                            attempts = item.attempts,
                            error = %item.last_error,
                            "Abandoning settlement after repeated failures"
                        );
                        report.abandoned += 1;
                    } else {
                        self.queue.push(item);
                        report.requeued += 1;
                    }
                }
            }
        }

        self.observer
            .record_metric(&ObserverMetric::ReconciliationDepth(self.queue.len() as u64));
        report
    }

    /// Settlements waiting for reconciliation.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Wait until every in-flight deduction/audit task has finished.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn run_stage(
    stage: SettlementStage,
    entry: &LedgerEntry,
    budget: &dyn BudgetClient,
    audit: &dyn AuditClient,
    timeout: Duration,
) -> Result<(), String> {
    let call = async {
        match stage {
            SettlementStage::Deduct => budget
                .deduct(&entry.user_id, entry.cost)
                .await
                .map_err(|e| e.to_string()),
            SettlementStage::Audit => audit.log_transaction(entry).await.map_err(|e| e.to_string()),
        }
    };
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(format!("{stage} timed out after {}s", timeout.as_secs())))
}

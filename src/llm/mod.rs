//! Request arbitration across LLM providers.
//!
//! - [`routing`]: prompt classification and policy-driven model selection
//! - [`health`]: per-provider circuit breaker
//! - [`failover`]: bounded walk over a candidate chain
//! - [`accountant`]: idempotent cost settlement
//! - [`smart_client`]: the facade sequencing all of the above

pub mod accountant;
pub mod costs;
pub mod failover;
pub mod health;
pub mod provider;
pub mod registry;
pub mod routing;
pub mod smart_client;

pub use accountant::{
    Accountant, AccountantConfig, InMemoryReconciliationQueue, LedgerEntry, PendingSettlement,
    ReconcileReport, ReconciliationQueue, SettlementStage,
};
pub use costs::compute_cost;
pub use failover::{DispatchConfig, DispatchOutcome, Dispatcher};
pub use health::{
    AttemptOutcome, FilteredChain, HealthConfig, HealthTracker, HealthTransition,
    ProviderHealthState, ProviderStatus,
};
pub use provider::{
    ChatMessage, CompletionBackend, CompletionRequest, CompletionResponse, Role, TokenUsage,
};
pub use registry::{ModelDefinition, ModelRegistry, Tier};
pub use smart_client::{
    ArbitrageRequest, ArbitrageResponse, DEFAULT_FALLBACK_MODEL, FailOpenConfig, SmartClient,
    SmartClientConfig, SmartClientSnapshot,
};

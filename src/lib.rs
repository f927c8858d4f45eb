//! Request arbitration for LLM traffic.
//!
//! Every request is classified by a CPU-only gatekeeper, routed to an
//! ordered chain of candidate models by first-match policies, filtered by
//! per-provider circuit breakers, dispatched with bounded failover, and
//! settled exactly once in `Decimal` money.
//!
//! ```text
//! request ─► Gatekeeper ─► budget check ─► Router ─► HealthTracker ─► Dispatcher ─► Accountant
//!                          (fail closed)   (fail open)                (failover)    (idempotent)
//! ```
//!
//! Start with [`ArbitrageEngine`] for a fully wired pipeline, or assemble a
//! [`llm::SmartClient`] by hand from its parts.

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod observability;

pub use collaborators::{AuditClient, BudgetClient, Collaborators, ModelFoundryClient};
pub use config::ArbitrageConfig;
pub use engine::ArbitrageEngine;
pub use error::{ArbitrageError, ConfigError, DispatchError, ProviderError};
pub use llm::{
    ArbitrageRequest, ArbitrageResponse, ChatMessage, CompletionBackend, CompletionRequest,
    CompletionResponse, LedgerEntry, ModelDefinition, Tier, TokenUsage,
};

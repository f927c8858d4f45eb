//! Error types for the arbitrage core.

use std::time::Duration;

/// Top-level error returned by the smart client.
#[derive(Debug, thiserror::Error)]
pub enum ArbitrageError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Budget denied for user {user}: {reason}")]
    BudgetDenied { user: String, reason: String },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid routing condition `{expression}`: {reason}")]
    InvalidCondition { expression: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Categorized failure from the completion collaborator.
///
/// The dispatcher only ever looks at the category, never at provider-specific
/// error shapes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} server error: {reason}")]
    ServerError { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} rejected the request: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl ProviderError {
    /// Returns `true` if another candidate might succeed where this one failed.
    ///
    /// Auth and malformed-request failures are caller problems; sending the
    /// same request to every provider would only burn the failover budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::ServerError { .. }
                | ProviderError::Timeout { .. }
        )
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::RateLimited { provider, .. }
            | ProviderError::ServerError { provider, .. }
            | ProviderError::AuthFailed { provider }
            | ProviderError::InvalidRequest { provider, .. }
            | ProviderError::Timeout { provider, .. } => provider,
        }
    }
}

/// Router invariant violations.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Model registry is empty")]
    EmptyRegistry,

    #[error("Policy {policy} produced an empty candidate chain for tier {tier}")]
    EmptyChain { policy: String, tier: String },

    #[error("No routing policy matched (catch-all missing)")]
    NoPolicyMatched,
}

/// A single failed attempt, kept for terminal error reporting.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub model_id: String,
    pub error: ProviderError,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.model_id, self.error)
    }
}

/// Terminal dispatcher outcomes.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("All {} candidates exhausted: [{}]", .attempts.len(), join_attempts(.attempts))]
    AllCandidatesExhausted { attempts: Vec<AttemptFailure> },

    #[error("Model {model_id} failed with non-retryable error: {source}")]
    NonRetryable {
        model_id: String,
        #[source]
        source: ProviderError,
        attempts: Vec<AttemptFailure>,
    },

    #[error("Dispatch deadline of {budget:?} exceeded after {} attempts", .attempts.len())]
    DeadlineExceeded {
        budget: Duration,
        attempts: Vec<AttemptFailure>,
    },

    #[error("Candidate chain is empty")]
    EmptyChain,
}

fn join_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Budget collaborator errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BudgetError {
    #[error("Budget service unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown user {0}")]
    UnknownUser(String),
}

/// Audit collaborator errors.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Audit write failed: {0}")]
pub struct AuditError(pub String);

/// Model foundry collaborator errors.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Model foundry unavailable: {0}")]
pub struct FoundryError(pub String);

/// Optional complexity model could not produce a score.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Complexity scorer unavailable: {0}")]
pub struct ScorerError(pub String);

/// Accountant errors.
#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    #[error("Request {request_id} was already settled")]
    AlreadySettled { request_id: String },
}

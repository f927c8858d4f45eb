//! Policy-driven candidate selection.
//!
//! Routes a classified request to an ordered, de-duplicated chain of models:
//! domain-specialized models first, then generic models of the target tier,
//! then the policy's explicit fallbacks.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::condition::PolicyInput;
use super::gatekeeper::RoutingContext;
use super::policy::{PolicyStore, RoutingPolicy};
use crate::error::RoutingError;
use crate::llm::registry::{ModelDefinition, ModelRegistry, Tier};

/// How specialized models of the same tier are ordered among themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecializedTieBreak {
    /// Keep registry order.
    #[default]
    RegistrationOrder,
    /// Cheapest blended rate first; registry order among equals.
    LowestCost,
}

/// Router tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Remaining budget fraction below which economy mode downgrades the tier.
    pub economy_threshold: f64,
    pub specialized_tie_break: SpecializedTieBreak,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            economy_threshold: 0.10,
            specialized_tie_break: SpecializedTieBreak::default(),
        }
    }
}

/// Per-request view of the caller's budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetState {
    /// Remaining budget as a fraction in `[0, 1]`.
    pub remaining_fraction: f64,
    /// Caller is never downgraded by economy mode.
    pub economy_exempt: bool,
}

impl BudgetState {
    pub fn new(remaining_fraction: f64) -> Self {
        Self {
            remaining_fraction: if remaining_fraction.is_nan() {
                0.0
            } else {
                remaining_fraction.clamp(0.0, 1.0)
            },
            economy_exempt: false,
        }
    }

    /// Full budget, used when routing outside a user context.
    pub fn full() -> Self {
        Self::new(1.0)
    }

    pub fn exempt(mut self, exempt: bool) -> Self {
        self.economy_exempt = exempt;
        self
    }
}

/// Result of routing a request.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Name of the policy that matched.
    pub policy: String,
    /// Tier after any economy downgrade.
    pub tier: Tier,
    /// Economy mode lowered the tier.
    pub economy: bool,
    /// Ordered, de-duplicated candidate chain. Never empty.
    pub candidates: Vec<ModelDefinition>,
}

impl RoutingDecision {
    pub fn model_ids(&self) -> Vec<&str> {
        self.candidates.iter().map(|m| m.id.as_str()).collect()
    }

    pub fn primary(&self) -> Option<&ModelDefinition> {
        self.candidates.first()
    }
}

/// Selects candidate chains from the policy store and registry.
pub struct Router {
    registry: Arc<ModelRegistry>,
    policies: PolicyStore,
    config: RouterConfig,
}

impl Router {
    pub fn new(registry: Arc<ModelRegistry>, policies: PolicyStore, config: RouterConfig) -> Self {
        Self {
            registry,
            policies,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// Route a classified request.
    pub fn select(
        &self,
        context: &RoutingContext,
        budget: BudgetState,
    ) -> Result<RoutingDecision, RoutingError> {
        self.select_for_prompt("", context, budget)
    }

    /// Route a classified request, exposing the prompt text to
    /// `prompt contains` conditions.
    pub fn select_for_prompt(
        &self,
        prompt: &str,
        context: &RoutingContext,
        budget: BudgetState,
    ) -> Result<RoutingDecision, RoutingError> {
        if self.registry.is_empty() {
            return Err(RoutingError::EmptyRegistry);
        }

        let input = PolicyInput {
            complexity: context.complexity(),
            budget: budget.remaining_fraction,
            domain: context.domain(),
            prompt,
        };
        let policy = self
            .policies
            .first_match(&input)
            .ok_or(RoutingError::NoPolicyMatched)?;

        let base_tier = policy
            .tier
            .unwrap_or_else(|| Tier::from_complexity(context.complexity()));
        let economy = self.economy_applies(policy, budget) && base_tier != Tier::Fast;
        let tier = if economy { base_tier.downgrade() } else { base_tier };

        let mut chain = Vec::new();
        if let Some(domain) = context.domain() {
            chain.extend(self.specialized(domain, tier, economy));
        }
        chain.extend(self.generic(policy, tier));
        chain.extend(self.resolve_ids(policy, &policy.fallback));

        let mut seen = HashSet::new();
        chain.retain(|m| seen.insert(m.id.clone()));

        if chain.is_empty() {
            return Err(RoutingError::EmptyChain {
                policy: policy.name.clone(),
                tier: tier.to_string(),
            });
        }

        tracing::debug!(
            policy = %policy.name,
            tier = %tier,
            economy,
            complexity = context.complexity(),
            domain = context.domain().unwrap_or(""),
            candidates = ?chain.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            "Routed request"
        );

        Ok(RoutingDecision {
            policy: policy.name.clone(),
            tier,
            economy,
            candidates: chain,
        })
    }

    fn economy_applies(&self, policy: &RoutingPolicy, budget: BudgetState) -> bool {
        budget.remaining_fraction < self.config.economy_threshold
            && !policy.safety_critical
            && !budget.economy_exempt
    }

    /// Domain models at `tier`. When the domain has none there, its models at
    /// other tiers are used instead, never above `tier` while economizing.
    fn specialized(&self, domain: &str, tier: Tier, economy: bool) -> Vec<ModelDefinition> {
        let mut models = self.registry.specialized_for(domain, Some(tier));
        if models.is_empty() {
            models = self
                .registry
                .specialized_for(domain, None)
                .into_iter()
                .filter(|m| !economy || m.tier < tier)
                .collect();
            if !models.is_empty() {
                tracing::debug!(
                    domain,
                    tier = %tier,
                    "No specialized model at target tier, using the domain's other tiers"
                );
            }
        }
        if self.config.specialized_tie_break == SpecializedTieBreak::LowestCost {
            // Stable: equal rates keep registration order.
            models.sort_by_key(ModelDefinition::blended_rate);
        }
        models
    }

    /// Policy models at `tier`; when the policy names none there, generic
    /// registry models at `tier`. Specialized models are never included here.
    fn generic(&self, policy: &RoutingPolicy, tier: Tier) -> Vec<ModelDefinition> {
        let preferred: Vec<_> = self
            .resolve_ids(policy, &policy.models)
            .into_iter()
            .filter(|m| m.tier == tier)
            .collect();
        if !preferred.is_empty() {
            return preferred;
        }

        self.registry
            .list(Some(tier))
            .into_iter()
            .filter(ModelDefinition::is_generic)
            .collect()
    }

    fn resolve_ids(&self, policy: &RoutingPolicy, ids: &[String]) -> Vec<ModelDefinition> {
        ids.iter()
            .filter_map(|id| {
                let model = self.registry.get(id);
                if model.is_none() {
                    tracing::warn!(
                        policy = %policy.name,
                        model = %id,
                        "Policy references unknown model, skipping"
                    );
                }
                model
            })
            .collect()
    }
}

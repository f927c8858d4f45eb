//! Model catalog: static models from configuration plus specialized models
//! registered at runtime (typically pulled from the model foundry).

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::collaborators::ModelFoundryClient;
use crate::error::FoundryError;

/// Coarse capability/cost bucket for models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Tier 1: cheap, low-latency models.
    Fast,
    /// Tier 2: general-purpose models.
    Smart,
    /// Tier 3: expensive reasoning models.
    Reasoning,
}

impl Tier {
    /// Map a complexity score to its baseline tier.
    pub fn from_complexity(complexity: f64) -> Self {
        if complexity >= 0.8 {
            Tier::Reasoning
        } else if complexity >= 0.4 {
            Tier::Smart
        } else {
            Tier::Fast
        }
    }

    /// One level cheaper, saturating at [`Tier::Fast`].
    pub fn downgrade(self) -> Self {
        match self {
            Tier::Reasoning => Tier::Smart,
            Tier::Smart | Tier::Fast => Tier::Fast,
        }
    }

    /// Tier name as string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Smart => "smart",
            Tier::Reasoning => "reasoning",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" | "tier1" | "1" => Ok(Tier::Fast),
            "smart" | "tier2" | "2" => Ok(Tier::Smart),
            "reasoning" | "tier3" | "3" => Ok(Tier::Reasoning),
            _ => Err(format!(
                "invalid tier '{s}', expected one of: fast, smart, reasoning"
            )),
        }
    }
}

/// A routable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Identifier understood by the completion backend, e.g. `azure/gpt-4o`.
    pub id: String,
    pub provider: String,
    pub tier: Tier,
    pub cost_per_1k_input: Decimal,
    pub cost_per_1k_output: Decimal,
    /// Domains this model is specialized for. Empty for generic models.
    #[serde(default)]
    pub specialization_tags: BTreeSet<String>,
}

impl ModelDefinition {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        tier: Tier,
        cost_per_1k_input: Decimal,
        cost_per_1k_output: Decimal,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            tier,
            cost_per_1k_input,
            cost_per_1k_output,
            specialization_tags: BTreeSet::new(),
        }
    }

    /// Add a specialization tag (stored lowercase).
    pub fn with_tag(mut self, tag: impl AsRef<str>) -> Self {
        self.specialization_tags
            .insert(tag.as_ref().to_lowercase());
        self
    }

    pub fn is_specialized_for(&self, domain: &str) -> bool {
        self.specialization_tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(domain))
    }

    pub fn is_generic(&self) -> bool {
        self.specialization_tags.is_empty()
    }

    /// Combined cost of 1k input plus 1k output tokens, used for cheapest-first ordering.
    pub fn blended_rate(&self) -> Decimal {
        self.cost_per_1k_input + self.cost_per_1k_output
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Registration order is preserved; it is the default tie-break.
    models: Vec<ModelDefinition>,
    index: HashMap<String, usize>,
}

/// Thread-safe model catalog.
///
/// Read-mostly: the router takes a read lock per request, registration events
/// take the write lock briefly.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<RegistryInner>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated with `models`.
    pub fn with_models(models: impl IntoIterator<Item = ModelDefinition>) -> Self {
        let registry = Self::new();
        for model in models {
            registry.register(model);
        }
        registry
    }

    /// Register a model, replacing any existing definition with the same id
    /// while keeping its original position.
    pub fn register(&self, model: ModelDefinition) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(model = %model.id, tier = %model.tier, "Registered model");
        match inner.index.get(&model.id).copied() {
            Some(pos) => inner.models[pos] = model,
            None => {
                let pos = inner.models.len();
                inner.index.insert(model.id.clone(), pos);
                inner.models.push(model);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ModelDefinition> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.index.get(id).map(|&pos| inner.models[pos].clone())
    }

    /// All models in registration order, optionally restricted to one tier.
    pub fn list(&self, tier: Option<Tier>) -> Vec<ModelDefinition> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .models
            .iter()
            .filter(|m| tier.is_none_or(|t| m.tier == t))
            .cloned()
            .collect()
    }

    /// Models tagged for `domain` (case-insensitive), in registration order.
    pub fn specialized_for(&self, domain: &str, tier: Option<Tier>) -> Vec<ModelDefinition> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .models
            .iter()
            .filter(|m| m.is_specialized_for(domain))
            .filter(|m| tier.is_none_or(|t| m.tier == t))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .models
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pull specialized models for `domain` from the foundry and register them.
    ///
    /// Returned models are tagged with `domain` even if the foundry left their
    /// tags empty. Returns the number of models registered.
    pub async fn sync_from_foundry(
        &self,
        foundry: &dyn ModelFoundryClient,
        domain: &str,
    ) -> Result<usize, FoundryError> {
        let models = foundry.list_specialized_models(domain).await?;
        let count = models.len();
        for model in models {
            let model = if model.is_specialized_for(domain) {
                model
            } else {
                model.with_tag(domain)
            };
            self.register(model);
        }
        tracing::info!(domain, count, "Synced specialized models from foundry");
        Ok(count)
    }
}

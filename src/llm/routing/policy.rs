//! Ordered routing policies.
//!
//! Policies are evaluated in declaration order and the first whose condition
//! holds wins. The store refuses to load unless the final policy always
//! matches, so every request resolves to some policy.

use serde::{Deserialize, Serialize};

use super::condition::{Condition, PolicyInput, TextField, TextOp};
use crate::error::ConfigError;
use crate::llm::registry::Tier;

/// Serialized policy record, one `[[policies]]` table in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    /// Guard expression; defaults to `"true"`.
    #[serde(default = "default_condition")]
    pub condition: String,
    /// Forced tier. When absent the tier follows the complexity score.
    #[serde(default)]
    pub tier: Option<Tier>,
    /// Preferred model ids, filtered to the target tier.
    #[serde(default)]
    pub models: Vec<String>,
    /// Model ids appended after the tier candidates regardless of tier.
    #[serde(default)]
    pub fallback: Vec<String>,
    /// Safety-critical policies are never downgraded by economy mode.
    #[serde(default)]
    pub safety_critical: bool,
}

fn default_condition() -> String {
    "true".to_string()
}

/// A compiled routing policy.
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    pub name: String,
    pub condition: Condition,
    pub tier: Option<Tier>,
    pub models: Vec<String>,
    pub fallback: Vec<String>,
    pub safety_critical: bool,
}

impl RoutingPolicy {
    /// A catch-all policy that follows the complexity score.
    pub fn catch_all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: Condition::always(),
            tier: None,
            models: Vec::new(),
            fallback: Vec::new(),
            safety_critical: false,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback(mut self, fallback: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fallback = fallback.into_iter().map(Into::into).collect();
        self
    }

    pub fn safety_critical(mut self) -> Self {
        self.safety_critical = true;
        self
    }

    pub fn matches(&self, input: &PolicyInput<'_>) -> bool {
        self.condition.evaluate(input)
    }
}

impl TryFrom<&PolicyConfig> for RoutingPolicy {
    type Error = ConfigError;

    fn try_from(config: &PolicyConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            name: config.name.clone(),
            condition: Condition::parse(&config.condition)?,
            tier: config.tier,
            models: config.models.clone(),
            fallback: config.fallback.clone(),
            safety_critical: config.safety_critical,
        })
    }
}

/// Built-in policies: safety-critical prompts always get the reasoning tier,
/// everything else follows the complexity score.
pub fn default_policies() -> Vec<PolicyConfig> {
    vec![
        PolicyConfig {
            name: "safety-critical".to_string(),
            condition: r#"domain == "safety_critical""#.to_string(),
            tier: Some(Tier::Reasoning),
            models: Vec::new(),
            fallback: Vec::new(),
            safety_critical: true,
        },
        PolicyConfig {
            name: "default".to_string(),
            condition: default_condition(),
            tier: None,
            models: Vec::new(),
            fallback: Vec::new(),
            safety_critical: false,
        },
    ]
}

/// Immutable, ordered policy list.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    policies: Vec<RoutingPolicy>,
}

impl PolicyStore {
    /// Validate and wrap `policies`. Fails if the list is empty or the last
    /// policy is not an unconditional catch-all.
    pub fn new(policies: Vec<RoutingPolicy>) -> Result<Self, ConfigError> {
        let Some(last) = policies.last() else {
            return Err(ConfigError::InvalidValue {
                key: "policies".to_string(),
                message: "at least one routing policy is required".to_string(),
            });
        };
        if !last.condition.is_always() {
            return Err(ConfigError::InvalidValue {
                key: "policies".to_string(),
                message: format!(
                    "last policy '{}' must be a catch-all with condition \"true\"",
                    last.name
                ),
            });
        }
        Ok(Self { policies })
    }

    /// Compile policy records in order.
    pub fn from_config(configs: &[PolicyConfig]) -> Result<Self, ConfigError> {
        let policies = configs
            .iter()
            .map(RoutingPolicy::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(policies)
    }

    /// The first policy whose condition holds. Always `Some` for a validated
    /// store; the `Option` guards hand-built evaluation inputs only.
    pub fn first_match(&self, input: &PolicyInput<'_>) -> Option<&RoutingPolicy> {
        self.policies.iter().find(|p| p.matches(input))
    }

    pub fn policies(&self) -> &[RoutingPolicy] {
        &self.policies
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self {
            policies: vec![
                RoutingPolicy {
                    name: "safety-critical".to_string(),
                    condition: Condition::Text {
                        field: TextField::Domain,
                        op: TextOp::Eq,
                        value: "safety_critical".to_string(),
                    },
                    tier: Some(Tier::Reasoning),
                    models: Vec::new(),
                    fallback: Vec::new(),
                    safety_critical: true,
                },
                RoutingPolicy::catch_all("default"),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(domain: Option<&str>) -> PolicyInput<'_> {
        PolicyInput {
            complexity: 0.2,
            budget: 1.0,
            domain,
            prompt: "",
        }
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let store = PolicyStore::from_config(&[
            PolicyConfig {
                name: "medical".into(),
                condition: r#"domain == "medical""#.into(),
                tier: Some(Tier::Smart),
                models: vec![],
                fallback: vec![],
                safety_critical: false,
            },
            PolicyConfig {
                name: "also-medical".into(),
                condition: r#"domain == "medical""#.into(),
                tier: Some(Tier::Reasoning),
                models: vec![],
                fallback: vec![],
                safety_critical: false,
            },
            PolicyConfig {
                name: "default".into(),
                condition: "true".into(),
                tier: None,
                models: vec![],
                fallback: vec![],
                safety_critical: false,
            },
        ])
        .unwrap();

        assert_eq!(store.first_match(&input(Some("medical"))).unwrap().name, "medical");
        assert_eq!(store.first_match(&input(None)).unwrap().name, "default");
    }

    #[test]
    fn rejects_empty_store() {
        assert!(PolicyStore::new(vec![]).is_err());
    }

    #[test]
    fn rejects_missing_catch_all() {
        let policy = RoutingPolicy {
            condition: Condition::parse("complexity > 0.5").unwrap(),
            ..RoutingPolicy::catch_all("only")
        };
        let err = PolicyStore::new(vec![policy]).unwrap_err();
        assert!(err.to_string().contains("catch-all"));
    }

    #[test]
    fn rejects_bad_condition() {
        let err = PolicyStore::from_config(&[PolicyConfig {
            name: "broken".into(),
            condition: "domain ==".into(),
            tier: None,
            models: vec![],
            fallback: vec![],
            safety_critical: false,
        }])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCondition { .. }));
    }

    #[test]
    fn default_policies_compile_and_match_default_store() {
        let compiled = PolicyStore::from_config(&default_policies()).unwrap();
        let builtin = PolicyStore::default();
        assert_eq!(compiled.len(), builtin.len());

        let safety = input(Some("safety_critical"));
        assert!(compiled.first_match(&safety).unwrap().safety_critical);
        assert!(builtin.first_match(&safety).unwrap().safety_critical);
        assert_eq!(
            compiled.first_match(&safety).unwrap().tier,
            Some(Tier::Reasoning)
        );
    }

    #[test]
    fn policy_record_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            policies: Vec<PolicyConfig>,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
            [[policies]]
            name = "legal"
            condition = 'domain == "legal" && complexity >= 0.4'
            tier = "reasoning"
            models = ["aws/claude-3-opus"]
            fallback = ["azure/gpt-4o"]

            [[policies]]
            name = "default"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.policies[0].tier, Some(Tier::Reasoning));
        assert!(!parsed.policies[0].safety_critical);
        assert_eq!(parsed.policies[1].condition, "true");
        PolicyStore::from_config(&parsed.policies).unwrap();
    }
}

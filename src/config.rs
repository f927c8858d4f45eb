//! Configuration for the arbitrage engine.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables (a `.env` file is honored). Every section has defaults, so an
//! empty file or no file at all yields a working configuration apart from
//! the model list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::accountant::AccountantConfig;
use crate::llm::failover::DispatchConfig;
use crate::llm::health::HealthConfig;
use crate::llm::registry::ModelDefinition;
use crate::llm::routing::{
    Gatekeeper, GatekeeperConfig, PolicyConfig, PolicyStore, RouterConfig, default_policies,
};
use crate::llm::smart_client::SmartClientConfig;
use crate::observability::ObservabilityConfig;

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    /// Statically known models. Specialized models may be added at runtime.
    pub models: Vec<ModelDefinition>,
    /// Ordered routing policies; the last must be a catch-all.
    pub policies: Vec<PolicyConfig>,
    pub gatekeeper: GatekeeperConfig,
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub dispatch: DispatchConfig,
    pub accountant: AccountantConfig,
    pub client: SmartClientConfig,
    pub foundry: FoundryConfig,
    pub background: BackgroundConfig,
    pub observability: ObservabilityConfig,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            policies: default_policies(),
            gatekeeper: GatekeeperConfig::default(),
            router: RouterConfig::default(),
            health: HealthConfig::default(),
            dispatch: DispatchConfig::default(),
            accountant: AccountantConfig::default(),
            client: SmartClientConfig::default(),
            foundry: FoundryConfig::default(),
            background: BackgroundConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Which specialized-model domains to pull from the model foundry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundryConfig {
    pub domains: Vec<String>,
    /// Re-sync period. Zero disables polling; domains are still synced once
    /// at startup.
    #[serde(rename = "poll_interval_secs", with = "secs")]
    pub poll_interval: Duration,
}

impl Default for FoundryConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            poll_interval: Duration::from_secs(600),
        }
    }
}

/// Periods of the engine's background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// How often tripped breakers are checked for expiry.
    #[serde(rename = "sweep_interval_secs", with = "secs")]
    pub sweep_interval: Duration,
    /// How often the reconciliation queue is retried.
    #[serde(rename = "reconcile_interval_secs", with = "secs")]
    pub reconcile_interval: Duration,
    /// How long shutdown waits for in-flight requests.
    #[serde(rename = "shutdown_grace_secs", with = "secs")]
    pub shutdown_grace: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ArbitrageConfig {
    /// Load configuration.
    ///
    /// Reads `.env` if present, then the TOML file at `path` (or at
    /// `ARBITRAGE_CONFIG` when `path` is `None`), then applies environment
    /// overrides, then validates.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => optional_env("ARBITRAGE_CONFIG")?.map(PathBuf::from),
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without env overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(model) = optional_env("ARBITRAGE_FALLBACK_MODEL")? {
            self.client.fail_open.default_model = model;
        }

        self.dispatch.attempt_timeout = Duration::from_secs(parse_optional_env(
            "ARBITRAGE_ATTEMPT_TIMEOUT_SECS",
            self.dispatch.attempt_timeout.as_secs(),
        )?);
        self.dispatch.total_timeout = Duration::from_secs(parse_optional_env(
            "ARBITRAGE_TOTAL_TIMEOUT_SECS",
            self.dispatch.total_timeout.as_secs(),
        )?);

        self.client.budget_timeout = Duration::from_secs(parse_optional_env(
            "ARBITRAGE_BUDGET_TIMEOUT_SECS",
            self.client.budget_timeout.as_secs(),
        )?);

        self.accountant.stage_timeout = Duration::from_secs(parse_optional_env(
            "ARBITRAGE_SETTLEMENT_TIMEOUT_SECS",
            self.accountant.stage_timeout.as_secs(),
        )?);

        self.health.failure_threshold =
            parse_optional_env("ARBITRAGE_BREAKER_THRESHOLD", self.health.failure_threshold)?;
        self.health.window = Duration::from_secs(parse_optional_env(
            "ARBITRAGE_BREAKER_WINDOW_SECS",
            self.health.window.as_secs(),
        )?);
        self.health.cooldown = Duration::from_secs(parse_optional_env(
            "ARBITRAGE_BREAKER_COOLDOWN_SECS",
            self.health.cooldown.as_secs(),
        )?);

        self.router.economy_threshold =
            parse_optional_env("ARBITRAGE_ECONOMY_THRESHOLD", self.router.economy_threshold)?;

        self.observability.json_logs =
            parse_optional_env("ARBITRAGE_LOG_JSON", self.observability.json_logs)?;

        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Compiles every condition and checks the catch-all.
        PolicyStore::from_config(&self.policies)?;
        Gatekeeper::new(&self.gatekeeper)?;

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.id.trim().is_empty() {
                return Err(invalid("models", "model id must not be empty"));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(invalid("models", format!("duplicate model id '{}'", model.id)));
            }
            if model.cost_per_1k_input.is_sign_negative() || model.cost_per_1k_output.is_sign_negative()
            {
                return Err(invalid(
                    "models",
                    format!("model '{}' has a negative rate", model.id),
                ));
            }
        }

        if self.dispatch.attempt_timeout.is_zero() {
            return Err(invalid("dispatch.attempt_timeout_secs", "must be positive"));
        }
        if self.dispatch.total_timeout.is_zero() {
            return Err(invalid("dispatch.total_timeout_secs", "must be positive"));
        }
        if self.health.window.is_zero() {
            return Err(invalid("health.window_secs", "must be positive"));
        }
        if self.health.cooldown.is_zero() {
            return Err(invalid("health.cooldown_secs", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.router.economy_threshold) {
            return Err(invalid(
                "router.economy_threshold",
                format!("{} is outside [0, 1]", self.router.economy_threshold),
            ));
        }
        if self.accountant.stage_timeout.is_zero() {
            return Err(invalid("accountant.stage_timeout_secs", "must be positive"));
        }
        if self.client.budget_timeout.is_zero() {
            return Err(invalid("client.budget_timeout_secs", "must be positive"));
        }
        if self.client.fail_open.default_model.trim().is_empty() {
            return Err(invalid("client.fail_open.default_model", "must not be empty"));
        }
        if self.background.sweep_interval.is_zero() || self.background.reconcile_interval.is_zero()
        {
            return Err(invalid("background", "intervals must be positive"));
        }

        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Serde adapter storing a [`Duration`] as whole seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use crate::llm::registry::Tier;
    use crate::llm::routing::SpecializedTieBreak;

    // Env vars are process-global, so serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const OVERRIDE_KEYS: &[&str] = &[
        "ARBITRAGE_CONFIG",
        "ARBITRAGE_FALLBACK_MODEL",
        "ARBITRAGE_ATTEMPT_TIMEOUT_SECS",
        "ARBITRAGE_TOTAL_TIMEOUT_SECS",
        "ARBITRAGE_BREAKER_THRESHOLD",
        "ARBITRAGE_BREAKER_WINDOW_SECS",
        "ARBITRAGE_BREAKER_COOLDOWN_SECS",
        "ARBITRAGE_ECONOMY_THRESHOLD",
        "ARBITRAGE_LOG_JSON",
        "ARBITRAGE_BUDGET_TIMEOUT_SECS",
        "ARBITRAGE_SETTLEMENT_TIMEOUT_SECS",
    ];

    fn clear_overrides() {
        for key in OVERRIDE_KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    const SAMPLE: &str = r#"
[[models]]
id = "azure/gpt-4o-mini"
provider = "azure"
tier = "fast"
cost_per_1k_input = "0.00015"
cost_per_1k_output = "0.0006"

[[models]]
id = "onc/oncology-7b"
provider = "foundry"
tier = "smart"
cost_per_1k_input = "0.001"
cost_per_1k_output = "0.002"
specialization_tags = ["oncology"]

[[policies]]
name = "safety"
condition = 'domain == "safety_critical"'
tier = "reasoning"
safety_critical = true

[[policies]]
name = "default"
fallback = ["azure/gpt-4o-mini"]

[router]
economy_threshold = 0.2
specialized_tie_break = "lowest_cost"

[health]
failure_threshold = 5
window_secs = 30

[dispatch]
attempt_timeout_secs = 10

[client]
economy_exempt_groups = ["executives", "oncall"]

[client.fail_open]
default_model = "aws/claude-sonnet"

[foundry]
domains = ["oncology"]
poll_interval_secs = 0
"#;

    // --- optional_env tests ---

    #[test]
    fn optional_env_returns_none_for_missing_var() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::remove_var("_TEST_ARB_MISSING_42") };
        assert!(optional_env("_TEST_ARB_MISSING_42").unwrap().is_none());
    }

    #[test]
    fn optional_env_returns_none_for_empty_string() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_ARB_EMPTY_42", "") };
        assert!(optional_env("_TEST_ARB_EMPTY_42").unwrap().is_none());
        unsafe { std::env::remove_var("_TEST_ARB_EMPTY_42") };
    }

    #[test]
    fn parse_optional_env_returns_error_for_invalid_value() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_ARB_BAD_42", "not_a_number") };
        let result: Result<u64, _> = parse_optional_env("_TEST_ARB_BAD_42", 0);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("_TEST_ARB_BAD_42") };
    }

    // --- file parsing ---

    #[test]
    fn empty_toml_gives_defaults() {
        let config = ArbitrageConfig::from_toml("").unwrap();
        assert_eq!(config, ArbitrageConfig::default());
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.window, Duration::from_secs(60));
        assert_eq!(config.health.cooldown, Duration::from_secs(300));
        config.validate().unwrap();
    }

    #[test]
    fn sample_toml_parses() {
        let config = ArbitrageConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].cost_per_1k_input, dec!(0.00015));
        assert_eq!(config.models[1].tier, Tier::Smart);
        assert!(config.models[1].is_specialized_for("Oncology"));

        assert_eq!(config.policies[0].tier, Some(Tier::Reasoning));
        assert_eq!(config.policies[1].condition, "true");

        assert_eq!(config.router.economy_threshold, 0.2);
        assert_eq!(
            config.router.specialized_tie_break,
            SpecializedTieBreak::LowestCost
        );
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.window, Duration::from_secs(30));
        assert_eq!(config.health.cooldown, Duration::from_secs(300));
        assert_eq!(config.dispatch.attempt_timeout, Duration::from_secs(10));
        assert_eq!(config.dispatch.total_timeout, Duration::from_secs(90));
        assert_eq!(config.client.fail_open.default_model, "aws/claude-sonnet");
        assert_eq!(config.client.economy_exempt_groups.len(), 2);
        assert_eq!(config.foundry.poll_interval, Duration::ZERO);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = ArbitrageConfig::from_toml("[[models]\nid = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    // --- validation ---

    #[test]
    fn missing_catch_all_rejected() {
        let mut config = ArbitrageConfig::from_toml(SAMPLE).unwrap();
        config.policies.pop();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn empty_policies_rejected() {
        let mut config = ArbitrageConfig::default();
        config.policies.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_condition_rejected() {
        let mut config = ArbitrageConfig::default();
        config.policies[0].condition = "complexity >>> 0.5".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn duplicate_model_ids_rejected() {
        let mut config = ArbitrageConfig::from_toml(SAMPLE).unwrap();
        let dup = config.models[0].clone();
        config.models.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate model id"));
    }

    #[test]
    fn zero_timeouts_rejected() {
        let mut config = ArbitrageConfig::default();
        config.dispatch.attempt_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ArbitrageConfig::default();
        config.health.cooldown = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_budget_timeout_rejected() {
        let mut config = ArbitrageConfig::default();
        config.client.budget_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client.budget_timeout_secs"));
    }

    #[test]
    fn zero_settlement_timeout_rejected() {
        let mut config = ArbitrageConfig::default();
        config.accountant.stage_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("accountant.stage_timeout_secs"));
    }

    #[test]
    fn economy_threshold_must_be_a_fraction() {
        let mut config = ArbitrageConfig::default();
        config.router.economy_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    // --- resolve ---

    #[test]
    fn resolve_reads_file_and_applies_env_overrides() {
        let _lock = ENV_LOCK.lock();
        clear_overrides();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbitrage.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        unsafe {
            std::env::set_var("ARBITRAGE_FALLBACK_MODEL", "azure/gpt-4o-mini");
            std::env::set_var("ARBITRAGE_BREAKER_COOLDOWN_SECS", "60");
            std::env::set_var("ARBITRAGE_ECONOMY_THRESHOLD", "0.05");
        }
        let config = ArbitrageConfig::resolve(Some(&path));
        clear_overrides();

        let config = config.unwrap();
        assert_eq!(config.client.fail_open.default_model, "azure/gpt-4o-mini");
        assert_eq!(config.health.cooldown, Duration::from_secs(60));
        // File value survives where no override is set.
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.router.economy_threshold, 0.05);
    }

    #[test]
    fn resolve_uses_config_env_path() {
        let _lock = ENV_LOCK.lock();
        clear_overrides();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("from-env.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        unsafe { std::env::set_var("ARBITRAGE_CONFIG", &path) };
        let config = ArbitrageConfig::resolve(None);
        clear_overrides();

        assert_eq!(config.unwrap().models.len(), 2);
    }

    #[test]
    fn resolve_rejects_invalid_override() {
        let _lock = ENV_LOCK.lock();
        clear_overrides();

        unsafe { std::env::set_var("ARBITRAGE_ATTEMPT_TIMEOUT_SECS", "0") };
        let result = ArbitrageConfig::resolve(None);
        clear_overrides();

        assert!(result.is_err());
    }

    #[test]
    fn resolve_missing_file_is_io_error() {
        let _lock = ENV_LOCK.lock();
        clear_overrides();

        let dir = tempfile::tempdir().unwrap();
        let err = ArbitrageConfig::resolve(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}

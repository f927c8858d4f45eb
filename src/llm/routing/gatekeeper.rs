//! Prompt classifier.
//!
//! Produces a [`RoutingContext`] from the raw prompt using deterministic
//! heuristics (length, keyword density, code fences) and whole-word domain
//! term matching. An optional [`ComplexityScorer`] can raise the score but
//! never lower it, so the heuristic result is always a floor.
//!
//! The gatekeeper never issues generation requests and has no side effects
//! beyond logging.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ScorerError};

/// Per-request routing signal.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingContext {
    complexity: f64,
    domain: Option<String>,
    raw_length: usize,
}

impl RoutingContext {
    /// Complexity used when classification faults.
    pub const DEFAULT_COMPLEXITY: f64 = 0.5;

    /// Build a context. `complexity` is clamped to `[0, 1]`; NaN becomes the default.
    pub fn new(complexity: f64, domain: Option<String>, raw_length: usize) -> Self {
        let complexity = if complexity.is_nan() {
            Self::DEFAULT_COMPLEXITY
        } else {
            complexity.clamp(0.0, 1.0)
        };
        Self {
            complexity,
            domain: domain.filter(|d| !d.trim().is_empty()),
            raw_length,
        }
    }

    /// Mid-complexity context used when the classifier itself fails.
    pub fn conservative_default(domain: Option<String>, raw_length: usize) -> Self {
        Self::new(Self::DEFAULT_COMPLEXITY, domain, raw_length)
    }

    pub fn complexity(&self) -> f64 {
        self.complexity
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn raw_length(&self) -> usize {
        self.raw_length
    }
}

/// A named domain and the whole-word terms that identify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRule {
    pub name: String,
    pub terms: Vec<String>,
}

/// Gatekeeper tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Prompt length (chars) at which the length signal saturates.
    pub length_threshold: usize,
    /// Terms that mark a prompt as demanding deep reasoning.
    pub high_complexity_keywords: Vec<String>,
    /// Terms that nudge the score up a little.
    pub moderate_complexity_keywords: Vec<String>,
    /// Checked in order; the first domain with a matching term wins.
    pub domains: Vec<DomainRule>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        let words = |ws: &[&str]| ws.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        Self {
            length_threshold: 2000,
            high_complexity_keywords: words(&[
                "analyze", "analyse", "critique", "reason", "evaluate", "diagnose", "derive",
                "prove",
            ]),
            moderate_complexity_keywords: words(&[
                "explain",
                "compare",
                "summarize",
                "summarise",
                "review",
                "plan",
                "design",
            ]),
            domains: vec![
                // Safety terms are checked first: a clinical prompt that also
                // reports a hazard must be routed as safety-critical.
                DomainRule {
                    name: "safety_critical".into(),
                    terms: words(&[
                        "danger",
                        "hazard",
                        "adverse event",
                        "toxicity",
                        "overdose",
                        "fatal",
                        "contraindication",
                    ]),
                },
                DomainRule {
                    name: "medical".into(),
                    terms: words(&[
                        "clinical",
                        "patient",
                        "diagnosis",
                        "oncology",
                        "dosage",
                        "trial",
                        "symptom",
                    ]),
                },
                DomainRule {
                    name: "legal".into(),
                    terms: words(&["contract", "liability", "statute", "litigation", "clause"]),
                },
                DomainRule {
                    name: "finance".into(),
                    terms: words(&["invoice", "revenue", "portfolio", "audit trail", "ledger"]),
                },
            ],
        }
    }
}

/// Optional lightweight scoring model behind the gatekeeper.
///
/// Must be CPU-only and fast; it runs inline on every request.
pub trait ComplexityScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Score in `[0, 1]`. Errors and out-of-range values are ignored.
    fn score(&self, prompt: &str) -> Result<f64, ScorerError>;
}

const BASE_SCORE: f64 = 0.05;
const LENGTH_WEIGHT: f64 = 0.40;
const HIGH_KEYWORD_FIRST: f64 = 0.40;
const HIGH_KEYWORD_EXTRA: f64 = 0.05;
const HIGH_KEYWORD_EXTRA_CAP: usize = 3;
const MODERATE_KEYWORD: f64 = 0.05;
const MODERATE_KEYWORD_CAP: usize = 2;
const CODE_FENCE: f64 = 0.05;

/// Breakdown of a heuristic score, useful for debug logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicScore {
    pub total: f64,
    pub length: f64,
    pub high_keyword_hits: usize,
    pub moderate_keyword_hits: usize,
    pub has_code: bool,
}

/// Heuristic prompt classifier.
pub struct Gatekeeper {
    length_threshold: usize,
    high: Option<Regex>,
    moderate: Option<Regex>,
    domains: Vec<(String, Regex)>,
    scorer: Option<Arc<dyn ComplexityScorer>>,
}

impl Gatekeeper {
    /// Compile the configured keyword and domain patterns.
    pub fn new(config: &GatekeeperConfig) -> Result<Self, ConfigError> {
        if config.length_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "gatekeeper.length_threshold".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let domains = config
            .domains
            .iter()
            .filter_map(|rule| {
                compile_terms(&rule.terms)
                    .map(|re| re.map(|re| (rule.name.to_lowercase(), re)))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            length_threshold: config.length_threshold,
            high: compile_terms(&config.high_complexity_keywords)?,
            moderate: compile_terms(&config.moderate_complexity_keywords)?,
            domains,
            scorer: None,
        })
    }

    /// Attach an optional scoring model.
    pub fn with_scorer(mut self, scorer: Arc<dyn ComplexityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Classify a prompt. Never fails: a faulting scorer yields the
    /// conservative default context.
    pub fn classify(&self, prompt: &str) -> RoutingContext {
        let raw_length = prompt.chars().count();
        let heuristic = self.heuristic_score(prompt, raw_length);
        let domain = self.detect_domain(prompt);

        let complexity = match self.model_score(prompt) {
            Ok(Some(model)) => heuristic.total.max(model),
            Ok(None) => heuristic.total,
            Err(()) => {
                tracing::warn!(
                    raw_length,
                    "Gatekeeper scorer faulted, using conservative default context"
                );
                return RoutingContext::conservative_default(domain, raw_length);
            }
        };

        tracing::debug!(
            raw_length,
            high_hits = heuristic.high_keyword_hits,
            moderate_hits = heuristic.moderate_keyword_hits,
            has_code = heuristic.has_code,
            domain = domain.as_deref().unwrap_or(""),
            complexity,
            "Gatekeeper classification"
        );

        RoutingContext::new(complexity, domain, raw_length)
    }

    /// Deterministic score from length, keywords, and code fences.
    pub fn heuristic_score(&self, prompt: &str, raw_length: usize) -> HeuristicScore {
        let length_ratio = (raw_length as f64 / self.length_threshold as f64).min(1.0);
        let length = LENGTH_WEIGHT * length_ratio;

        let high_keyword_hits = self.high.as_ref().map_or(0, |re| count_matches(re, prompt));
        let high = if high_keyword_hits == 0 {
            0.0
        } else {
            let extra = (high_keyword_hits - 1).min(HIGH_KEYWORD_EXTRA_CAP);
            HIGH_KEYWORD_FIRST + HIGH_KEYWORD_EXTRA * extra as f64
        };

        let moderate_keyword_hits = self
            .moderate
            .as_ref()
            .map_or(0, |re| count_matches(re, prompt));
        let moderate = MODERATE_KEYWORD * moderate_keyword_hits.min(MODERATE_KEYWORD_CAP) as f64;

        let has_code = prompt.contains("```");
        let code = if has_code { CODE_FENCE } else { 0.0 };

        HeuristicScore {
            total: (BASE_SCORE + length + high + moderate + code).clamp(0.0, 1.0),
            length,
            high_keyword_hits,
            moderate_keyword_hits,
            has_code,
        }
    }

    /// First configured domain with a whole-word match.
    pub fn detect_domain(&self, prompt: &str) -> Option<String> {
        self.domains
            .iter()
            .find(|(_, re)| re.is_match(prompt))
            .map(|(name, _)| name.clone())
    }

    /// `Ok(None)` when there is no usable model score, `Err(())` if the model panicked.
    fn model_score(&self, prompt: &str) -> Result<Option<f64>, ()> {
        let Some(scorer) = &self.scorer else {
            return Ok(None);
        };

        match catch_unwind(AssertUnwindSafe(|| scorer.score(prompt))) {
            Ok(Ok(score)) if (0.0..=1.0).contains(&score) => Ok(Some(score)),
            Ok(Ok(score)) => {
                tracing::warn!(
                    scorer = scorer.name(),
                    score,
                    "Complexity scorer returned out-of-range score, using heuristics"
                );
                Ok(None)
            }
            Ok(Err(e)) => {
                tracing::debug!(scorer = scorer.name(), error = %e, "Complexity scorer unavailable");
                Ok(None)
            }
            Err(_) => Err(()),
        }
    }
}

/// Build a case-insensitive whole-word alternation. Multi-word terms match
/// across any run of whitespace. Returns `None` for an empty term list.
fn compile_terms(terms: &[String]) -> Result<Option<Regex>, ConfigError> {
    let alternatives: Vec<String> = terms
        .iter()
        .map(|t| {
            t.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .filter(|t| !t.is_empty())
        .collect();

    if alternatives.is_empty() {
        return Ok(None);
    }

    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: "gatekeeper".to_string(),
            message: format!("invalid keyword pattern: {e}"),
        })
}

/// Count regex matches in text.
fn count_matches(re: &Regex, text: &str) -> usize {
    re.find_iter(text).count()
}

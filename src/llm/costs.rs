//! Cost arithmetic and reference per-1k-token rates.
//!
//! All money is [`Decimal`]; nothing here touches floating point.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::llm::provider::TokenUsage;
use crate::llm::registry::ModelDefinition;

const PER: Decimal = dec!(1000);

/// Cost of one completion: `in/1000 * rate_in + out/1000 * rate_out`.
pub fn compute_cost(model: &ModelDefinition, usage: TokenUsage) -> Decimal {
    Decimal::from(usage.input_tokens) / PER * model.cost_per_1k_input
        + Decimal::from(usage.output_tokens) / PER * model.cost_per_1k_output
}

/// Published list prices (USD per 1k tokens) for well-known models.
///
/// Used to price a model that is not in the registry, such as a fail-open
/// default configured only by id.
pub fn reference_rates(model_id: &str) -> Option<(Decimal, Decimal)> {
    // Normalize: strip provider prefixes (e.g., "azure/gpt-4o" -> "gpt-4o")
    let id = model_id
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(model_id);

    match id {
        "gpt-4o" | "gpt-4o-2024-11-20" | "gpt-4o-2024-08-06" => Some((dec!(0.0025), dec!(0.01))),
        "gpt-4o-mini" | "gpt-4o-mini-2024-07-18" => Some((dec!(0.00015), dec!(0.0006))),
        "gpt-4-turbo" => Some((dec!(0.01), dec!(0.03))),
        "gpt-3.5-turbo" => Some((dec!(0.0005), dec!(0.0015))),
        "o1" | "o1-2024-12-17" => Some((dec!(0.015), dec!(0.06))),
        "o3-mini" => Some((dec!(0.0011), dec!(0.0044))),

        "claude-3-5-sonnet" | "claude-3-5-sonnet-latest" | "claude-sonnet-4" => {
            Some((dec!(0.003), dec!(0.015)))
        }
        "claude-3-5-haiku" | "claude-3-5-haiku-latest" => Some((dec!(0.0008), dec!(0.004))),
        "claude-3-haiku" => Some((dec!(0.00025), dec!(0.00125))),
        "claude-3-opus" | "claude-opus-4" => Some((dec!(0.015), dec!(0.075))),

        _ if is_local_model(id) => Some((Decimal::ZERO, Decimal::ZERO)),

        _ => None,
    }
}

/// Conservative rates for unknown models, roughly GPT-4o pricing.
pub fn default_rates() -> (Decimal, Decimal) {
    (dec!(0.0025), dec!(0.01))
}

/// Heuristic to detect self-hosted models, which cost nothing per token.
fn is_local_model(model_id: &str) -> bool {
    let lower = model_id.to_lowercase();
    lower.starts_with("llama")
        || lower.starts_with("mistral")
        || lower.starts_with("mixtral")
        || lower.starts_with("gemma")
        || lower.starts_with("qwen")
        || lower.contains(":latest")
}

//! Building an engine from a configuration file on disk.

mod common;

use std::sync::Arc;

use arbitrage::llm::routing::SpecializedTieBreak;
use arbitrage::{ArbitrageConfig, ArbitrageEngine, ArbitrageRequest, ChatMessage, Collaborators};
use pretty_assertions::assert_eq;

use common::{MockAudit, MockBackend, MockBudget};

const CONFIG: &str = r#"
[[models]]
id = "azure/gpt-4o-mini"
provider = "azure"
tier = "fast"
cost_per_1k_input = "0.00015"
cost_per_1k_output = "0.0006"

[[models]]
id = "aws/claude-haiku"
provider = "aws"
tier = "fast"
cost_per_1k_input = "0.00025"
cost_per_1k_output = "0.00125"

[[models]]
id = "legal/contracts-large"
provider = "foundry"
tier = "fast"
cost_per_1k_input = "0.0001"
cost_per_1k_output = "0.0002"
specialization_tags = ["legal"]

[[models]]
id = "legal/contracts-small"
provider = "foundry"
tier = "fast"
cost_per_1k_input = "0.00001"
cost_per_1k_output = "0.00002"
specialization_tags = ["legal"]

[[policies]]
name = "contracts-cheap-first"
condition = 'domain == "legal" && complexity < 0.4'
models = ["aws/claude-haiku"]

[[policies]]
name = "default"
condition = "true"

[router]
specialized_tie_break = "lowest_cost"

[health]
failure_threshold = 1
window_secs = 10
cooldown_secs = 30
"#;

#[tokio::test]
async fn engine_runs_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arbitrage.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = ArbitrageConfig::resolve(Some(&path)).unwrap();
    assert_eq!(config.models.len(), 4);
    assert_eq!(
        config.router.specialized_tie_break,
        SpecializedTieBreak::LowestCost
    );
    assert_eq!(config.health.failure_threshold, 1);

    let backend = Arc::new(MockBackend::default());
    let engine = ArbitrageEngine::new(
        config,
        Collaborators::new(
            Arc::clone(&backend) as Arc<dyn arbitrage::CompletionBackend>,
            Arc::new(MockBudget::default()),
            Arc::new(MockAudit::default()),
        ),
    )
    .unwrap();

    let response = engine
        .complete(ArbitrageRequest::new(
            "counsel",
            vec![ChatMessage::user("Is this indemnity clause enforceable?")],
        ))
        .await
        .unwrap();

    // Specialized legal models first, cheapest of them leading, then the
    // policy's generic pick.
    assert_eq!(response.model, "legal/contracts-small");
    assert_eq!(backend.calls(), vec!["legal/contracts-small"]);

    engine.shutdown().await;
}

#[test]
fn file_without_catch_all_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        r#"
[[policies]]
name = "only-legal"
condition = 'domain == "legal"'
"#,
    )
    .unwrap();

    let err = ArbitrageConfig::resolve(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("catch-all"), "got: {err}");
}

use std::time::Duration;

use weft_core::config::{EngineConfig, RetryStrategy, TimeoutAction};
use weft_core::error::WeftError;
use weft_engine::{Confidence, EdgeCondition, GraphDefinition, NodeKind};
use weft_test_utils::temp_file;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[executor]
max_node_visits = 8
event_capacity = 64

[recovery.default]
strategy = "fixed_delay"
max_retries = 2
base_delay_ms = 250

[recovery.nodes.fetch]
strategy = "exponential_backoff"
max_retries = 4
base_delay_ms = 1000
max_delay_ms = 5000
jitter = true

[recovery.nodes.validate]
strategy = "no_retry"

[review]
default_timeout_secs = 600
on_timeout = "auto_reject"

[routing]
low_confidence_threshold = 0.75
"#;

    let tmp = temp_file(toml_content, ".toml");
    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.executor.max_node_visits, 8);
    assert_eq!(config.executor.event_capacity, 64);

    assert_eq!(config.recovery.default.strategy, RetryStrategy::FixedDelay);
    assert_eq!(config.recovery.default.max_retries, 2);
    assert_eq!(config.recovery.default.base_delay(3), Duration::from_millis(250));

    let fetch = &config.recovery.nodes["fetch"];
    assert!(fetch.jitter);
    assert_eq!(fetch.base_delay(0), Duration::from_secs(1));
    assert_eq!(fetch.base_delay(2), Duration::from_secs(4));
    assert_eq!(fetch.base_delay(5), Duration::from_secs(5));

    let validate = &config.recovery.nodes["validate"];
    assert_eq!(validate.retry_limit(), 0);

    assert_eq!(config.review.default_timeout_secs, 600);
    assert_eq!(config.review.on_timeout, TimeoutAction::AutoReject);
    assert_eq!(config.routing.low_confidence_threshold, 0.75);
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = temp_file("", ".toml");
    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.executor.max_node_visits, 5);
    assert_eq!(config.recovery.default.strategy, RetryStrategy::ExponentialBackoff);
    assert_eq!(config.recovery.default.max_retries, 3);
    assert_eq!(config.recovery.default.base_delay(0), Duration::from_secs(1));
    assert!(config.recovery.nodes.is_empty());
    assert_eq!(config.review.on_timeout, TimeoutAction::Fail);
    assert_eq!(config.routing.low_confidence_threshold, 0.6);
}

#[test]
fn test_env_vars_expanded() {
    std::env::set_var("WEFT_TEST_REVIEW_TIMEOUT", "42");
    let tmp = temp_file(
        "[review]\ndefault_timeout_secs = ${WEFT_TEST_REVIEW_TIMEOUT}\n",
        ".toml",
    );
    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.review.default_timeout_secs, 42);
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = temp_file("[routing]\nlow_confidence_threshold = 1.5\n", ".toml");
    assert!(matches!(
        EngineConfig::load(tmp.path()),
        Err(WeftError::Config(_))
    ));

    let tmp = temp_file("[executor]\nmax_node_visits = \"many\"\n", ".toml");
    assert!(matches!(
        EngineConfig::load(tmp.path()),
        Err(WeftError::Config(_))
    ));

    let missing = std::path::Path::new("/nonexistent/weft.toml");
    assert!(matches!(
        EngineConfig::load(missing),
        Err(WeftError::ConfigNotFound(_))
    ));
}

#[test]
fn test_load_graph_from_toml_file() {
    let graph = r#"
name = "content"
entry = "draft"

[[nodes]]
id = "draft"
name = "Write draft"
timeout_secs = 120

[[nodes]]
id = "research"
kind = { type = "parallel", tasks = ["web", "archive"] }

[[nodes]]
id = "review"
kind = { type = "review", reason = "editorial check", timeout_secs = 3600, on_reject = "draft" }

[[nodes]]
id = "publish"

[[edges]]
from = "draft"
to = "research"

[[edges]]
from = "research"
to = "review"

[[edges]]
from = "review"
to = "publish"
condition = { type = "conditional", expr = "tone == neutral" }
confidence = { from_context = "p_publish" }
"#;

    let tmp = temp_file(graph, ".toml");
    let definition = GraphDefinition::load(tmp.path()).expect("load graph");
    definition.validate().expect("valid graph");

    assert_eq!(definition.name, "content");
    assert_eq!(definition.nodes.len(), 4);
    assert_eq!(definition.nodes[0].timeout_secs, Some(120));
    match &definition.nodes[1].kind {
        NodeKind::Parallel { tasks } => assert_eq!(tasks, &vec!["web".to_string(), "archive".to_string()]),
        other => panic!("expected parallel node, got {:?}", other),
    }
    match &definition.nodes[2].kind {
        NodeKind::Review {
            on_reject,
            timeout_secs,
            ..
        } => {
            assert_eq!(on_reject.as_deref(), Some("draft"));
            assert_eq!(*timeout_secs, Some(3600));
        }
        other => panic!("expected review node, got {:?}", other),
    }
    assert!(matches!(definition.edges[2].condition, EdgeCondition::Conditional { .. }));
    assert_eq!(
        definition.edges[2].confidence,
        Confidence::FromContext("p_publish".into())
    );
}

#[test]
fn test_load_graph_from_json_file() {
    let graph = serde_json::json!({
        "name": "triage",
        "entry": "classify",
        "nodes": [
            { "id": "classify" },
            { "id": "escalate", "kind": { "type": "review", "reason": "low confidence" } }
        ],
        "edges": [
            { "from": "classify", "to": "escalate", "confidence": { "fixed": 0.4 } }
        ]
    });

    let tmp = temp_file(&graph.to_string(), ".json");
    let definition = GraphDefinition::load(tmp.path()).expect("load graph");
    definition.validate().expect("valid graph");
    assert_eq!(definition.entry, "classify");
    assert_eq!(definition.edges[0].confidence, Confidence::Fixed(0.4));
    assert_eq!(definition.edges[0].condition, EdgeCondition::Always);
}

#[test]
fn test_graph_with_dangling_edge_rejected() {
    let tmp = temp_file(
        "name = \"g\"\nentry = \"a\"\n[[nodes]]\nid = \"a\"\n[[edges]]\nfrom = \"a\"\nto = \"ghost\"\n",
        ".toml",
    );
    let definition = GraphDefinition::load(tmp.path()).expect("parse graph");
    assert!(matches!(definition.validate(), Err(WeftError::Graph(_))));
}

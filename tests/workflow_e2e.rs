use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use weft_core::config::{EngineConfig, RetryPolicy, TimeoutAction};
use weft_core::error::WeftError;
use weft_core::state::{Cursor, ErrorKind, HumanFeedback, ReviewStatus, Stage, WorkflowState};
use weft_core::traits::{handler_fn, CheckpointStore};
use weft_core::StateContext;
use weft_engine::{
    CancelStatus, Edge, EngineServices, Graph, GraphDefinition, GraphExecutor,
    MemoryCheckpointStore, Node, WorkflowEngine,
};
use weft_test_utils::{FailingStore, FlakyHandler, PanicOnCall, PanickingTask, SetHandler, SleepTask};

fn engine_with(config: &EngineConfig) -> (WorkflowEngine, Arc<MemoryCheckpointStore>) {
    let store = Arc::new(MemoryCheckpointStore::new());
    (WorkflowEngine::from_config(config, store.clone()), store)
}

fn three_step(fetch: Arc<FlakyHandler>) -> Graph {
    Graph::new(
        GraphDefinition::new("pipeline", "parse")
            .node(Node::new("parse", "Parse"))
            .node(Node::new("fetch", "Fetch"))
            .node(Node::new("store", "Store"))
            .edge(Edge::always("parse", "fetch"))
            .edge(Edge::always("fetch", "store")),
    )
    .with_handler("parse", SetHandler::new("parsed", serde_json::json!(true)))
    .with_handler("fetch", fetch)
    .with_handler("store", SetHandler::new("stored", serde_json::json!(true)))
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retried_to_completion() {
    let mut config = EngineConfig::default();
    config.recovery.nodes.insert(
        "fetch".into(),
        RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30), 3),
    );
    let (engine, _store) = engine_with(&config);
    let fetch = FlakyHandler::new("fetched", 2);

    let started = tokio::time::Instant::now();
    let thread_id = engine
        .start_workflow(Arc::new(three_step(fetch.clone())), StateContext::new())
        .await
        .unwrap();
    let done = engine.join(&thread_id).await.unwrap();

    assert_eq!(done.stage(), Stage::Completed);
    assert_eq!(fetch.calls(), 3);
    assert_eq!(done.context().get_str("fetched"), Some("ok"));

    let errors: Vec<_> = done.errors_for("fetch").collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.kind == ErrorKind::Transient && e.recoverable));
    assert_eq!(errors[0].attempt, 1);
    assert_eq!(errors[1].attempt, 2);
    assert_eq!(done.retry_count("fetch"), 0);

    // 1s then 2s of backoff
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fails_workflow() {
    let mut config = EngineConfig::default();
    config
        .recovery
        .nodes
        .insert("fetch".into(), RetryPolicy::fixed(Duration::from_millis(10), 2));
    let (engine, _store) = engine_with(&config);
    let fetch = FlakyHandler::new("fetched", 10);

    let thread_id = engine
        .start_workflow(Arc::new(three_step(fetch.clone())), StateContext::new())
        .await
        .unwrap();
    let done = engine.join(&thread_id).await.unwrap();

    assert_eq!(done.stage(), Stage::Failed);
    assert_eq!(fetch.calls(), 3);
    assert_eq!(done.errors_for("fetch").count(), 3);
    assert!(done.context().get("stored").is_none());
}

#[tokio::test]
async fn test_panicking_handler_fails_workflow() {
    let (engine, store) = engine_with(&EngineConfig::default());
    let graph = Graph::new(
        GraphDefinition::new("pipeline", "parse")
            .node(Node::new("parse", "Parse"))
            .node(Node::new("fetch", "Fetch"))
            .edge(Edge::always("parse", "fetch")),
    )
    .with_handler("parse", PanicOnCall::new("parser not initialised"))
    .with_handler("fetch", SetHandler::new("fetched", serde_json::json!(true)));

    let thread_id = engine
        .start_workflow(Arc::new(graph), StateContext::new())
        .await
        .unwrap();
    let done = engine.join(&thread_id).await.unwrap();

    assert_eq!(done.stage(), Stage::Failed);
    assert_eq!(done.errors_for("parse").count(), 1);
    assert_eq!(done.errors()[0].kind, ErrorKind::Permanent);
    assert!(done.context().get("fetched").is_none());
    let persisted = store.load(&thread_id).await.unwrap().unwrap();
    assert_eq!(persisted, done);
}

#[tokio::test]
async fn test_rejection_routes_to_regenerate() {
    let (engine, _store) = engine_with(&EngineConfig::default());
    let graph = Graph::new(
        GraphDefinition::new("article", "draft")
            .node(Node::new("draft", "Draft"))
            .node(Node::review("review", "check tone").with_on_reject("regenerate"))
            .node(Node::new("publish", "Publish"))
            .node(Node::new("regenerate", "Regenerate"))
            .edge(Edge::always("draft", "review"))
            .edge(Edge::always("review", "publish")),
    )
    .with_handler("draft", SetHandler::new("draft", serde_json::json!("v1")))
    .with_handler("publish", SetHandler::new("published", serde_json::json!(true)))
    .with_handler("regenerate", SetHandler::new("draft", serde_json::json!("v2")));

    let thread_id = engine
        .start_workflow(Arc::new(graph), StateContext::new())
        .await
        .unwrap();
    let suspended = engine.join(&thread_id).await.unwrap();
    assert_eq!(suspended.stage(), Stage::AwaitingHuman);
    let review_id = suspended.pending_review().unwrap().review_id.clone();

    let feedback = HumanFeedback::reject(&review_id, "editor")
        .with_comments("too formal")
        .with_confidence(0.8);
    let resumed = engine
        .submit_human_feedback(&thread_id, &review_id, feedback)
        .await
        .unwrap();
    assert_eq!(resumed.cursor(), &Cursor::At("regenerate".into()));

    let done = engine.join(&thread_id).await.unwrap();
    assert_eq!(done.stage(), Stage::Completed);
    assert_eq!(done.context().get_str("draft"), Some("v2"));
    assert!(done.context().get("published").is_none());
    assert_eq!(done.human_feedback().len(), 1);
    assert_eq!(done.review_history()[0].status, ReviewStatus::Rejected);
    assert!(done
        .errors()
        .iter()
        .any(|e| e.kind == ErrorKind::HumanRejection && e.node == "review"));

    // A second decision on the same review is refused.
    let late = engine
        .submit_human_feedback(&thread_id, &review_id, HumanFeedback::approve(&review_id, "editor"))
        .await;
    assert!(late.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_parallel_branches_are_isolated() {
    let (engine, _store) = engine_with(&EngineConfig::default());
    let graph = Graph::new(
        GraphDefinition::new("fanout", "gather")
            .node(Node::parallel("gather", vec!["fast".into(), "broken".into(), "slow".into()]))
            .node(Node::new("report", "Report"))
            .edge(Edge::always("gather", "report")),
    )
    .with_task("fast", SleepTask::new(Duration::from_millis(100), serde_json::json!("f")))
    .with_task("broken", PanickingTask::new(Duration::from_millis(50)))
    .with_task("slow", SleepTask::new(Duration::from_millis(300), serde_json::json!("s")))
    .with_handler("report", SetHandler::new("reported", serde_json::json!(true)));

    let thread_id = engine
        .start_workflow(Arc::new(graph), StateContext::new())
        .await
        .unwrap();
    let done = engine.join(&thread_id).await.unwrap();

    assert_eq!(done.stage(), Stage::Completed);
    let results = done.parallel_results();
    assert_eq!(results.len(), 3);
    assert!(results["fast"].is_success());
    assert!(results["slow"].is_success());
    assert!(!results["broken"].is_success());

    let elapsed = done.node_execution_times()["gather"];
    assert!((300..400).contains(&elapsed), "fan-out took {}ms", elapsed);

    let broken: Vec<_> = done.errors_for("broken").collect();
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].kind, ErrorKind::Permanent);
    assert_eq!(done.context().get("reported"), Some(&serde_json::json!(true)));
}

#[tokio::test]
async fn test_review_timeout_resolves_once() {
    let mut config = EngineConfig::default();
    config.review.on_timeout = TimeoutAction::AutoReject;
    let (engine, _store) = engine_with(&config);
    let graph = Graph::new(
        GraphDefinition::new("quick", "gate")
            .node(
                Node::review("gate", "decide")
                    .with_review_timeout(0)
                    .with_on_reject("fallback"),
            )
            .node(Node::new("fallback", "Fallback")),
    )
    .with_handler("fallback", SetHandler::new("fallback", serde_json::json!(true)));

    let thread_id = engine
        .start_workflow(Arc::new(graph), StateContext::new())
        .await
        .unwrap();
    let suspended = engine.join(&thread_id).await.unwrap();
    let review_id = suspended.pending_review().unwrap().review_id.clone();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let expired = engine
        .submit_human_feedback(&thread_id, &review_id, HumanFeedback::approve(&review_id, "late"))
        .await;
    assert!(matches!(expired, Err(WeftError::ReviewExpired(_))));

    assert_eq!(engine.check_timeouts().await.unwrap(), vec![thread_id.clone()]);
    assert!(engine.check_timeouts().await.unwrap().is_empty());

    let done = engine.join(&thread_id).await.unwrap();
    assert_eq!(done.stage(), Stage::Completed);
    assert_eq!(done.context().get("fallback"), Some(&serde_json::json!(true)));
    assert_eq!(done.review_history()[0].status, ReviewStatus::TimedOut);
    let synthetic = &done.human_feedback()[0];
    assert!(!synthetic.approved);
    assert_eq!(synthetic.reviewer_id, "system:timeout");
    assert_eq!(synthetic.confidence, 0.0);
}

#[tokio::test]
async fn test_state_survives_store_round_trip() {
    let (engine, store) = engine_with(&EngineConfig::default());
    let graph = Graph::new(
        GraphDefinition::new("branch", "classify")
            .node(Node::new("classify", "Classify"))
            .node(Node::new("refund", "Refund"))
            .node(Node::new("reply", "Reply"))
            .edge(Edge::always("classify", "refund").with_confidence_key("p_refund"))
            .edge(Edge::always("classify", "reply").with_confidence_key("p_reply")),
    )
    .with_handler(
        "classify",
        handler_fn(|mut state: WorkflowState| async move {
            state.context_mut().set("p_refund", serde_json::json!(0.2));
            state.context_mut().set("p_reply", serde_json::json!(0.7));
            Ok(state)
        }),
    )
    .with_handler("refund", SetHandler::new("refunded", serde_json::json!(true)))
    .with_handler("reply", SetHandler::new("replied", serde_json::json!(true)));

    let thread_id = engine
        .start_workflow(Arc::new(graph), StateContext::new())
        .await
        .unwrap();
    let done = engine.join(&thread_id).await.unwrap();
    assert_eq!(done.stage(), Stage::Completed);
    assert_eq!(done.routing_history().len(), 1);
    assert_eq!(done.routing_history()[0].chosen, "reply");

    let loaded = store.load(&thread_id).await.unwrap().unwrap();
    assert_eq!(loaded, done);

    let json = serde_json::to_string(&loaded).unwrap();
    let restored: WorkflowState = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, done);
    assert_eq!(restored.latest_checkpoint().unwrap().version, done.version());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_workflow() {
    let (engine, _store) = engine_with(&EngineConfig::default());
    let entered = Arc::new(Notify::new());
    let signal = entered.clone();
    let second = SetHandler::new("second", serde_json::json!(true));
    let graph = Graph::new(
        GraphDefinition::new("long", "first")
            .node(Node::new("first", "First"))
            .node(Node::new("second", "Second"))
            .edge(Edge::always("first", "second")),
    )
    .with_handler(
        "first",
        handler_fn(move |mut state: WorkflowState| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                tokio::time::sleep(Duration::from_secs(10)).await;
                state.context_mut().set_str("first", "done");
                Ok(state)
            }
        }),
    )
    .with_handler("second", second.clone());

    let thread_id = engine
        .start_workflow(Arc::new(graph), StateContext::new())
        .await
        .unwrap();
    entered.notified().await;

    let ack = engine.cancel(&thread_id).await.unwrap();
    assert_eq!(ack.status, CancelStatus::Requested);

    let done = engine.join(&thread_id).await.unwrap();
    assert_eq!(done.stage(), Stage::Failed);
    assert_eq!(done.failure_reason(), Some("cancelled"));
    assert_eq!(done.context().get_str("first"), Some("done"));
    assert_eq!(second.calls(), 0);
    assert_eq!(done.errors().last().unwrap().kind, ErrorKind::Cancellation);
}

#[tokio::test]
async fn test_failed_commit_stops_progress() {
    let inner = Arc::new(MemoryCheckpointStore::new());
    let store = FailingStore::new(inner.clone(), 2);
    let fetch = FlakyHandler::new("fetched", 0);
    let last = SetHandler::new("stored", serde_json::json!(true));
    let graph = Graph::new(
        GraphDefinition::new("pipeline", "parse")
            .node(Node::new("parse", "Parse"))
            .node(Node::new("fetch", "Fetch"))
            .node(Node::new("store", "Store"))
            .edge(Edge::always("parse", "fetch"))
            .edge(Edge::always("fetch", "store")),
    )
    .with_handler("parse", SetHandler::new("parsed", serde_json::json!(true)))
    .with_handler("fetch", fetch.clone())
    .with_handler("store", last.clone());

    let services = EngineServices::from_config(&EngineConfig::default(), store.clone());
    let executor = GraphExecutor::new(Arc::new(graph), services);
    let state = WorkflowState::new(StateContext::new());
    let thread_id = state.thread_id().clone();

    let err = executor
        .run(state, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Store(_)));
    assert_eq!(store.attempts(), 3);
    assert_eq!(fetch.calls(), 0);
    assert_eq!(last.calls(), 0);

    // The store still holds the last good commit: "parse" finished.
    let persisted = inner.load(&thread_id).await.unwrap().unwrap();
    assert_eq!(persisted.stage(), Stage::Processing);
    assert_eq!(persisted.cursor(), &Cursor::After("parse".into()));
    assert_eq!(persisted.latest_checkpoint().unwrap().node, "parse");
}

#[tokio::test]
async fn test_feedback_for_unknown_review() {
    let (engine, _store) = engine_with(&EngineConfig::default());
    let graph = Graph::new(
        GraphDefinition::new("gate", "gate").node(Node::review("gate", "decide")),
    );
    let thread_id = engine
        .start_workflow(Arc::new(graph), StateContext::new())
        .await
        .unwrap();
    engine.join(&thread_id).await.unwrap();

    let result = engine
        .submit_human_feedback(&thread_id, "not-a-review", HumanFeedback::approve("not-a-review", "x"))
        .await;
    assert!(matches!(result, Err(WeftError::ReviewNotFound(_))));

    let state = engine.get_state(&thread_id).await.unwrap();
    assert_eq!(state.stage(), Stage::AwaitingHuman);
}

pub mod checkpoint;
pub mod engine;
pub mod graph;
pub mod parallel;
pub mod recovery;
pub mod review;
pub mod router;

pub use checkpoint::MemoryCheckpointStore;
pub use engine::{CancelAck, CancelStatus, WorkflowEngine};
pub use graph::{
    evaluate_condition, Confidence, Edge, EdgeCondition, EdgeRouter, EngineServices, Graph,
    GraphDefinition, GraphExecutor, Node, NodeKind, StepOutcome,
};
pub use parallel::{ParallelExecutionCoordinator, ParallelSummary};
pub use recovery::{ErrorRecoveryManager, RecoveryAction};
pub use review::HumanReviewGate;
pub use router::{RouteStats, RouterOptimizer};

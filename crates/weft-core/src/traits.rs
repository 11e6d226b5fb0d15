use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{NodeError, Result};
use crate::state::{ThreadId, WorkflowState};

/// Node handler: one unit of work in the graph.
///
/// Handlers must be retry-safe: the engine may call `run` again with the same
/// input after a failure, and only the `context` of the returned state is kept.
pub trait NodeHandler: Send + Sync + 'static {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, std::result::Result<WorkflowState, NodeError>>;
}

/// A unit of work inside a fan-out step.
///
/// Receives a snapshot of the workflow and produces a JSON result.
pub trait ParallelTask: Send + Sync + 'static {
    fn run(
        &self,
        snapshot: WorkflowState,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, NodeError>>;
}

/// Routing predicate: candidate successors of `node` with their confidence.
///
/// An empty map ends the workflow, a single entry is followed directly, and
/// several entries are resolved by the router optimizer.
pub trait RoutePredicate: Send + Sync + 'static {
    fn candidates(&self, node: &str, state: &WorkflowState) -> BTreeMap<String, f64>;
}

/// Persistence backend for workflow snapshots.
///
/// `save` must be all-or-nothing: a later `load` returns either the previous
/// snapshot or the new one, never a mix.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, thread_id: &ThreadId, state: &WorkflowState) -> BoxFuture<'_, Result<()>>;

    /// `Ok(None)` when nothing was saved for `thread_id`.
    fn load(&self, thread_id: &ThreadId) -> BoxFuture<'_, Result<Option<WorkflowState>>>;
}

struct FnHandler<F>(F);

impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<WorkflowState, NodeError>> + Send + 'static,
{
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, std::result::Result<WorkflowState, NodeError>> {
        Box::pin((self.0)(state))
    }
}

/// Wrap an async closure as a node handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<WorkflowState, NodeError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnTask<F>(F);

impl<F, Fut> ParallelTask for FnTask<F>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, NodeError>> + Send + 'static,
{
    fn run(
        &self,
        snapshot: WorkflowState,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, NodeError>> {
        Box::pin((self.0)(snapshot))
    }
}

/// Wrap an async closure as a parallel task.
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn ParallelTask>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, NodeError>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

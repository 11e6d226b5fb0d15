use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{NodeError, Result};
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::state::{CheckpointRef, Cursor, ErrorContext, ErrorKind, Stage, WorkflowState};
use weft_core::traits::{CheckpointStore, NodeHandler};

use super::node::{Node, NodeKind};
use super::Graph;
use crate::parallel::{panic_message, ParallelExecutionCoordinator};
use crate::recovery::{fail_cancelled, ErrorRecoveryManager, RecoveryAction};
use crate::review::HumanReviewGate;
use crate::router::RouterOptimizer;

/// The managers an executor delegates to, shared across workflows.
#[derive(Clone)]
pub struct EngineServices {
    pub recovery: Arc<ErrorRecoveryManager>,
    pub review: Arc<HumanReviewGate>,
    pub router: Arc<RouterOptimizer>,
    pub parallel: Arc<ParallelExecutionCoordinator>,
    pub store: Arc<dyn CheckpointStore>,
    pub event_bus: Arc<EventBus>,
    /// A node entered more often than this fails the workflow.
    pub max_node_visits: u32,
}

impl EngineServices {
    pub fn from_config(config: &EngineConfig, store: Arc<dyn CheckpointStore>) -> Self {
        let event_bus = Arc::new(EventBus::new(config.executor.event_capacity));
        let recovery = Arc::new(ErrorRecoveryManager::new(config.recovery.clone()));
        Self {
            review: Arc::new(HumanReviewGate::new(config.review.clone(), event_bus.clone())),
            router: Arc::new(RouterOptimizer::new(config.routing.clone())),
            parallel: Arc::new(ParallelExecutionCoordinator::new(
                recovery.clone(),
                event_bus.clone(),
            )),
            recovery,
            store,
            event_bus,
            max_node_visits: config.executor.max_node_visits,
        }
    }

    /// Swap the recovery manager, e.g. for one with a custom classifier.
    pub fn with_recovery(mut self, recovery: ErrorRecoveryManager) -> Self {
        let recovery = Arc::new(recovery);
        self.parallel = Arc::new(ParallelExecutionCoordinator::new(
            recovery.clone(),
            self.event_bus.clone(),
        ));
        self.recovery = recovery;
        self
    }

    /// Persist `state` as a new checkpoint taken at `node`.
    ///
    /// `state` is only updated once the store accepted the snapshot, so a
    /// failed save leaves both the caller's value and the store untouched.
    pub async fn commit(&self, state: &mut WorkflowState, node: &str) -> Result<CheckpointRef> {
        let mut next = state.clone();
        let checkpoint = next.commit_checkpoint(node);
        if let Err(e) = self.store.save(next.thread_id(), &next).await {
            error!(thread_id = %next.thread_id(), node, error = %e, "Checkpoint commit failed");
            return Err(e);
        }
        *state = next;
        self.event_bus.publish(WorkflowEvent::CheckpointCommitted {
            thread_id: state.thread_id().clone(),
            node: node.to_string(),
            version: checkpoint.version,
        });
        Ok(checkpoint)
    }

    /// Publish `StageChanged` for every transition recorded after `seen`.
    pub fn publish_transitions(&self, state: &WorkflowState, seen: usize) {
        for transition in state.stage_history().iter().skip(seen) {
            self.event_bus.publish(WorkflowEvent::StageChanged {
                thread_id: state.thread_id().clone(),
                from: transition.from,
                to: transition.to,
            });
        }
    }
}

/// What a single executor step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Progress was committed; call `step` again.
    Advanced,
    /// Waiting for a human decision.
    Suspended,
    /// The workflow is terminal.
    Finished,
}

/// Drives one workflow through a graph.
///
/// Every step ends with a committed checkpoint; the next step never starts
/// before the previous commit succeeded. Cancellation is checked between
/// steps and during retry backoff, never inside a running handler.
#[derive(Clone)]
pub struct GraphExecutor {
    graph: Arc<Graph>,
    services: EngineServices,
}

impl GraphExecutor {
    pub fn new(graph: Arc<Graph>, services: EngineServices) -> Self {
        Self { graph, services }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Run until the workflow suspends for review or becomes terminal.
    pub async fn run(
        &self,
        mut state: WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState> {
        let started = Instant::now();
        loop {
            match self.step(&mut state, cancel).await? {
                StepOutcome::Advanced => continue,
                StepOutcome::Suspended if cancel.is_cancelled() => {
                    self.cancel_suspended(&mut state).await?;
                    break;
                }
                StepOutcome::Suspended | StepOutcome::Finished => break,
            }
        }
        info!(
            thread_id = %state.thread_id(),
            graph = %self.graph.name(),
            stage = %state.stage(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Workflow run stopped"
        );
        Ok(state)
    }

    /// Fail a workflow that suspended after cancellation was requested.
    async fn cancel_suspended(&self, state: &mut WorkflowState) -> Result<()> {
        let node = state
            .pending_review()
            .map(|r| r.node.clone())
            .unwrap_or_else(|| cursor_label(state.cursor()));
        info!(thread_id = %state.thread_id(), node = %node, "Cancellation observed at review suspension");
        let seen = state.stage_history().len();
        let mut next = state.clone();
        fail_cancelled(&mut next, &node)?;
        self.services.commit(&mut next, &node).await?;
        *state = next;
        self.services.review.release(state.thread_id()).await;
        self.services.publish_transitions(state, seen);
        Ok(())
    }

    /// Yield the state after every committed step.
    ///
    /// The stream ends after the step that suspends or finishes the
    /// workflow, or after the first error.
    pub fn stream(
        &self,
        state: WorkflowState,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<WorkflowState>> {
        let executor = self.clone();
        Box::pin(stream::unfold(
            Some((executor, state, cancel)),
            |carry| async move {
                let (executor, mut state, cancel) = carry?;
                match executor.step(&mut state, &cancel).await {
                    Ok(StepOutcome::Advanced) => {
                        let snapshot = state.clone();
                        Some((Ok(snapshot), Some((executor, state, cancel))))
                    }
                    Ok(_) => Some((Ok(state), None)),
                    Err(e) => Some((Err(e), None)),
                }
            },
        ))
    }

    /// Advance the workflow by one committed unit of work.
    pub async fn step(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if state.is_terminal() {
            return Ok(StepOutcome::Finished);
        }
        if state.stage() == Stage::AwaitingHuman {
            return Ok(StepOutcome::Suspended);
        }

        let seen = state.stage_history().len();
        let outcome = self.step_inner(state, cancel).await;
        self.services.publish_transitions(state, seen);
        outcome
    }

    async fn step_inner(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if cancel.is_cancelled() {
            let at = cursor_label(state.cursor());
            info!(thread_id = %state.thread_id(), node = %at, "Cancellation observed at node boundary");
            let mut next = state.clone();
            fail_cancelled(&mut next, &at)?;
            self.services.commit(&mut next, &at).await?;
            *state = next;
            return Ok(StepOutcome::Finished);
        }

        let mut next = state.clone();
        let outcome = match next.cursor().clone() {
            Cursor::Start => self.begin(&mut next).await?,
            Cursor::At(node) => self.execute_node(&mut next, &node, cancel).await?,
            Cursor::After(node) => self.route_from(&mut next, &node).await?,
            Cursor::Done => self.finalize(&mut next).await?,
        };
        *state = next;
        Ok(outcome)
    }

    async fn begin(&self, state: &mut WorkflowState) -> Result<StepOutcome> {
        if state.stage() == Stage::Init {
            state.transition(Stage::Processing, Some(format!("graph {} started", self.graph.name())))?;
        }
        state.set_cursor(Cursor::At(self.graph.entry().to_string()))?;
        info!(thread_id = %state.thread_id(), graph = %self.graph.name(), entry = %self.graph.entry(), "Workflow started");
        self.services.commit(state, "start").await?;
        Ok(StepOutcome::Advanced)
    }

    async fn execute_node(
        &self,
        state: &mut WorkflowState,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let node = match self.graph.node(node_id) {
            Ok(node) => node.clone(),
            Err(e) => return self.fail(state, node_id, e.to_string()).await,
        };

        let visits = state.visit(node_id)?;
        if visits > self.services.max_node_visits {
            warn!(
                thread_id = %state.thread_id(),
                node = node_id,
                visits,
                "Node visited more than {} times, terminating workflow",
                self.services.max_node_visits
            );
            let reason = format!(
                "node '{}' exceeded {} visits",
                node_id, self.services.max_node_visits
            );
            return self.fail(state, node_id, reason).await;
        }

        match &node.kind {
            NodeKind::Task => self.run_task(state, &node, cancel).await,
            NodeKind::Review {
                reason,
                timeout_secs,
                on_reject,
            } => {
                self.services
                    .review
                    .request_review(
                        state,
                        &node.id,
                        reason,
                        timeout_secs.map(Duration::from_secs),
                        on_reject.clone(),
                    )
                    .await?;
                self.services.commit(state, &node.id).await?;
                Ok(StepOutcome::Suspended)
            }
            NodeKind::Parallel { tasks } => {
                let tasks = match self.graph.tasks_for(tasks) {
                    Ok(tasks) => tasks,
                    Err(e) => return self.fail(state, node_id, e.to_string()).await,
                };
                let summary = self
                    .services
                    .parallel
                    .execute_parallel(state, &node.id, &tasks, cancel)
                    .await?;
                if summary.cancelled {
                    self.services.commit(state, &node.id).await?;
                    return Ok(StepOutcome::Finished);
                }
                state.set_cursor(Cursor::After(node.id.clone()))?;
                self.services.commit(state, &node.id).await?;
                Ok(StepOutcome::Advanced)
            }
        }
    }

    /// Run a task node, retrying per its recovery policy.
    async fn run_task(
        &self,
        state: &mut WorkflowState,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let handler = match self.graph.handler(&node.id) {
            Ok(handler) => handler,
            Err(e) => return self.fail(state, &node.id, e.to_string()).await,
        };
        let bus = &self.services.event_bus;

        loop {
            let attempt = state.retry_count(&node.id) + 1;
            debug!(thread_id = %state.thread_id(), node = %node.id, attempt, "Executing node");
            bus.publish(WorkflowEvent::NodeStarted {
                thread_id: state.thread_id().clone(),
                node: node.id.clone(),
                attempt,
            });

            let started = Instant::now();
            let result = invoke(handler.clone(), state.clone(), node).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let err = match result {
                Ok(returned) if returned.thread_id() == state.thread_id() => {
                    state.absorb(returned)?;
                    state.record_execution_time(&node.id, elapsed_ms)?;
                    self.services.recovery.record_success(state, &node.id)?;
                    state.set_cursor(Cursor::After(node.id.clone()))?;
                    info!(thread_id = %state.thread_id(), node = %node.id, attempt, elapsed_ms, "Node completed");
                    bus.publish(WorkflowEvent::NodeCompleted {
                        thread_id: state.thread_id().clone(),
                        node: node.id.clone(),
                        elapsed_ms,
                    });
                    self.services.commit(state, &node.id).await?;
                    return Ok(StepOutcome::Advanced);
                }
                Ok(returned) => NodeError::validation(format!(
                    "handler returned state of thread {}",
                    returned.thread_id()
                )),
                Err(err) => err,
            };

            match self.services.recovery.handle_error(state, &err, &node.id)? {
                RecoveryAction::Retry { retry, delay } => {
                    bus.publish(WorkflowEvent::RetryScheduled {
                        thread_id: state.thread_id().clone(),
                        node: node.id.clone(),
                        attempt: retry + 1,
                        delay_ms: delay.as_millis() as u64,
                    });
                    self.services.commit(state, &node.id).await?;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            info!(thread_id = %state.thread_id(), node = %node.id, "Cancelled during retry backoff");
                            fail_cancelled(state, &node.id)?;
                            self.services.commit(state, &node.id).await?;
                            return Ok(StepOutcome::Finished);
                        }
                    }
                }
                RecoveryAction::Fail { reason } => {
                    bus.publish(WorkflowEvent::NodeFailed {
                        thread_id: state.thread_id().clone(),
                        node: node.id.clone(),
                        message: reason,
                    });
                    self.services.commit(state, &node.id).await?;
                    return Ok(StepOutcome::Finished);
                }
            }
        }
    }

    /// Pick the successor of a finished node.
    async fn route_from(&self, state: &mut WorkflowState, from: &str) -> Result<StepOutcome> {
        let candidates = self.graph.router().candidates(from, state);

        let next = if candidates.len() > 1 {
            match self.services.router.optimize_routing(state, from, &candidates) {
                Ok(decision) => {
                    self.services.event_bus.publish(WorkflowEvent::RouteChosen {
                        thread_id: state.thread_id().clone(),
                        node: from.to_string(),
                        route: decision.chosen.clone(),
                        confidence: decision.confidence,
                        low_confidence: decision.low_confidence,
                    });
                    Cursor::At(decision.chosen)
                }
                Err(e) => {
                    let reason = format!("routing from '{}' failed: {}", from, e);
                    return self.fail(state, from, reason).await;
                }
            }
        } else {
            match candidates.into_keys().next() {
                Some(only) => {
                    debug!(thread_id = %state.thread_id(), node = from, next = %only, "Following single edge");
                    Cursor::At(only)
                }
                None => {
                    debug!(thread_id = %state.thread_id(), node = from, "No outgoing edges, finalizing");
                    Cursor::Done
                }
            }
        };

        state.set_cursor(next)?;
        self.services.commit(state, from).await?;
        Ok(StepOutcome::Advanced)
    }

    async fn finalize(&self, state: &mut WorkflowState) -> Result<StepOutcome> {
        match state.stage() {
            Stage::Finalizing => {
                state.transition(Stage::Completed, None)?;
                info!(thread_id = %state.thread_id(), graph = %self.graph.name(), "Workflow completed");
                self.services.commit(state, "finalize").await?;
                Ok(StepOutcome::Finished)
            }
            _ => {
                state.transition(Stage::Finalizing, None)?;
                self.services.commit(state, "finalize").await?;
                Ok(StepOutcome::Advanced)
            }
        }
    }

    async fn fail(&self, state: &mut WorkflowState, node: &str, reason: String) -> Result<StepOutcome> {
        error!(thread_id = %state.thread_id(), node, %reason, "Workflow failed");
        let mut next = state.clone();
        next.push_error(ErrorContext {
            node: node.to_string(),
            kind: ErrorKind::Permanent,
            message: reason.clone(),
            attempt: state.retry_count(node) + 1,
            recoverable: false,
            next_retry_at: None,
            timestamp: Utc::now(),
        })?;
        next.fail(reason.clone())?;
        *state = next;
        self.services.event_bus.publish(WorkflowEvent::NodeFailed {
            thread_id: state.thread_id().clone(),
            node: node.to_string(),
            message: reason,
        });
        self.services.commit(state, node).await?;
        Ok(StepOutcome::Finished)
    }
}

/// Await a handler with the node's deadline; panics become permanent errors.
async fn invoke(
    handler: Arc<dyn NodeHandler>,
    state: WorkflowState,
    node: &Node,
) -> std::result::Result<WorkflowState, NodeError> {
    let guarded = AssertUnwindSafe(async move { handler.run(state).await }).catch_unwind();
    let outcome = match node.timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(NodeError::timeout(format!(
                    "node '{}' exceeded {}s",
                    node.id, secs
                )))
            }
        },
        None => guarded.await,
    };
    outcome.unwrap_or_else(|payload| {
        Err(NodeError::validation(format!(
            "handler panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn cursor_label(cursor: &Cursor) -> String {
    match cursor {
        Cursor::Start => "start".to_string(),
        Cursor::At(node) | Cursor::After(node) => node.clone(),
        Cursor::Done => "finalize".to_string(),
    }
}

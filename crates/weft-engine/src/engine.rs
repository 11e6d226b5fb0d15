use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::context::StateContext;
use weft_core::error::{Result, WeftError};
use weft_core::event::WorkflowEvent;
use weft_core::state::{HumanFeedback, Stage, ThreadId, WorkflowState};
use weft_core::traits::CheckpointStore;

use crate::graph::{EngineServices, Graph, GraphExecutor};
use crate::recovery::fail_cancelled;

/// Keyed async leases: at most one writer per thread at any time.
///
/// An entry lives only while its lease is held or awaited.
#[derive(Default)]
struct ThreadLeases {
    locks: Mutex<HashMap<ThreadId, Arc<AsyncMutex<()>>>>,
}

impl ThreadLeases {
    fn lease(&self, thread_id: &ThreadId) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread_id.clone())
            .or_default()
            .clone()
    }

    async fn acquire(self: &Arc<Self>, thread_id: &ThreadId) -> Lease {
        let guard = self.lease(thread_id).lock_owned().await;
        Lease::new(self, thread_id, guard)
    }

    fn try_acquire(self: &Arc<Self>, thread_id: &ThreadId) -> Option<Lease> {
        let guard = self.lease(thread_id).try_lock_owned().ok()?;
        Some(Lease::new(self, thread_id, guard))
    }

    fn forget(&self, thread_id: &ThreadId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(thread_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(thread_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A held lease; dropping it releases the thread.
struct Lease {
    guard: Option<OwnedMutexGuard<()>>,
    leases: Arc<ThreadLeases>,
    thread_id: ThreadId,
}

impl Lease {
    fn new(leases: &Arc<ThreadLeases>, thread_id: &ThreadId, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            guard: Some(guard),
            leases: leases.clone(),
            thread_id: thread_id.clone(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.guard.take();
        self.leases.forget(&self.thread_id);
    }
}

type Runs = Mutex<HashMap<ThreadId, RunHandle>>;

/// Detach a finished thread from its graph. Its checkpoints stay in the store.
fn retire(runs: &Runs, thread_id: &ThreadId) {
    runs.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(thread_id);
    debug!(thread_id = %thread_id, "Detached finished workflow");
}

/// How a cancel request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    /// The workflow was idle or suspended and is now FAILED(cancelled).
    Applied,
    /// A driver is running; it fails the workflow at the next node boundary.
    Requested,
    /// The workflow had already finished.
    AlreadyTerminal,
}

/// Acknowledgement returned by [`WorkflowEngine::cancel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelAck {
    pub thread_id: ThreadId,
    pub status: CancelStatus,
    /// Stage as last committed.
    pub stage: Stage,
}

struct RunHandle {
    executor: GraphExecutor,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

/// Caller-facing entry point: starts, resumes, and steers workflows.
///
/// Each workflow is driven by a background task holding the thread's lease.
/// Out-of-band mutations (feedback, timeouts, cancellation) take the same
/// lease, so a workflow never has two writers. Once a workflow is terminal
/// the engine drops its graph and lease; only the store remembers it.
pub struct WorkflowEngine {
    services: EngineServices,
    leases: Arc<ThreadLeases>,
    runs: Arc<Runs>,
}

impl WorkflowEngine {
    pub fn new(services: EngineServices) -> Self {
        Self {
            services,
            leases: Arc::new(ThreadLeases::default()),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &EngineConfig, store: Arc<dyn CheckpointStore>) -> Self {
        Self::new(EngineServices::from_config(config, store))
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.services.event_bus.subscribe()
    }

    /// Persist a new workflow in INIT and start driving it.
    pub async fn start_workflow(&self, graph: Arc<Graph>, context: StateContext) -> Result<ThreadId> {
        self.start_workflow_with_id(ThreadId::new(), graph, context)
            .await
    }

    pub async fn start_workflow_with_id(
        &self,
        thread_id: ThreadId,
        graph: Arc<Graph>,
        context: StateContext,
    ) -> Result<ThreadId> {
        graph.validate()?;
        let state = WorkflowState::with_thread_id(thread_id.clone(), context);
        {
            let _lease = self.leases.acquire(&thread_id).await;
            self.services.store.save(&thread_id, &state).await?;
        }
        info!(thread_id = %thread_id, graph = %graph.name(), "Workflow created");

        self.attach(&thread_id, graph);
        self.spawn_driver(&thread_id);
        Ok(thread_id)
    }

    /// Reattach a persisted workflow to its graph, e.g. after a restart.
    ///
    /// Suspended workflows stay suspended; unfinished ones resume from their
    /// last checkpoint.
    pub async fn resume(&self, graph: Arc<Graph>, thread_id: &ThreadId) -> Result<WorkflowState> {
        graph.validate()?;
        let state = self.get_state(thread_id).await?;
        if state.is_terminal() {
            return Ok(state);
        }
        self.attach(thread_id, graph);
        self.services.review.restore(&state).await;

        if is_drivable(&state) {
            info!(thread_id = %thread_id, stage = %state.stage(), version = state.version(), "Resuming workflow");
            self.spawn_driver(thread_id);
        }
        Ok(state)
    }

    /// Latest committed state.
    pub async fn get_state(&self, thread_id: &ThreadId) -> Result<WorkflowState> {
        self.services
            .store
            .load(thread_id)
            .await?
            .ok_or_else(|| WeftError::ThreadNotFound(thread_id.clone()))
    }

    /// Deliver a reviewer's decision. Driving resumes in the background when
    /// the workflow continues.
    pub async fn submit_human_feedback(
        &self,
        thread_id: &ThreadId,
        review_id: &str,
        feedback: HumanFeedback,
    ) -> Result<WorkflowState> {
        let state = {
            let _lease = self.leases.acquire(thread_id).await;
            let mut state = self.get_state(thread_id).await?;
            let seen = state.stage_history().len();
            self.services
                .review
                .submit_feedback(&mut state, review_id, feedback)
                .await?;
            let checkpoint_node = state
                .review_history()
                .last()
                .map(|r| r.node.clone())
                .unwrap_or_else(|| "review".to_string());
            self.services.commit(&mut state, &checkpoint_node).await?;
            self.services.review.release(thread_id).await;
            self.services.publish_transitions(&state, seen);
            state
        };

        if is_drivable(&state) {
            self.spawn_driver(thread_id);
        } else if state.is_terminal() {
            retire(&self.runs, thread_id);
        }
        Ok(state)
    }

    /// Ask a workflow to stop.
    ///
    /// Idle and suspended workflows fail immediately. A running workflow
    /// fails at its next node boundary or retry backoff; the node in flight
    /// is never interrupted.
    pub async fn cancel(&self, thread_id: &ThreadId) -> Result<CancelAck> {
        let token = self.with_run(thread_id, |run| run.cancel.clone());
        if let Some(token) = &token {
            token.cancel();
        }

        let Some(_lease) = self.leases.try_acquire(thread_id) else {
            let state = self.get_state(thread_id).await?;
            info!(thread_id = %thread_id, "Cancellation requested from running workflow");
            return Ok(CancelAck {
                thread_id: thread_id.clone(),
                status: CancelStatus::Requested,
                stage: state.stage(),
            });
        };

        let mut state = self.get_state(thread_id).await?;
        if state.is_terminal() {
            retire(&self.runs, thread_id);
            return Ok(CancelAck {
                thread_id: thread_id.clone(),
                status: CancelStatus::AlreadyTerminal,
                stage: state.stage(),
            });
        }

        let seen = state.stage_history().len();
        let node = state
            .pending_review()
            .map(|r| r.node.clone())
            .unwrap_or_else(|| "cancel".to_string());
        fail_cancelled(&mut state, &node)?;
        self.services.commit(&mut state, &node).await?;
        self.services.review.release(thread_id).await;
        self.services.publish_transitions(&state, seen);
        info!(thread_id = %thread_id, "Workflow cancelled");
        retire(&self.runs, thread_id);

        Ok(CancelAck {
            thread_id: thread_id.clone(),
            status: CancelStatus::Applied,
            stage: state.stage(),
        })
    }

    /// Resolve every review whose deadline has passed.
    ///
    /// Returns the threads that were resolved by this call. A thread whose
    /// resolution cannot be committed stays indexed and is retried by the
    /// next sweep.
    pub async fn check_timeouts(&self) -> Result<Vec<ThreadId>> {
        let mut resolved = vec![];
        for (thread_id, _) in self.services.review.pending_reviews().await {
            match self.resolve_timeout(&thread_id).await {
                Ok(Some(state)) => {
                    if is_drivable(&state) {
                        self.spawn_driver(&thread_id);
                    } else if state.is_terminal() {
                        retire(&self.runs, &thread_id);
                    }
                    resolved.push(thread_id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(thread_id = %thread_id, error = %e, "Review timeout check failed");
                }
            }
        }
        Ok(resolved)
    }

    async fn resolve_timeout(&self, thread_id: &ThreadId) -> Result<Option<WorkflowState>> {
        let _lease = self.leases.acquire(thread_id).await;
        let mut state = self.get_state(thread_id).await?;
        if state.stage() != Stage::AwaitingHuman {
            // Resolved or cancelled elsewhere; the entry is stale.
            self.services.review.release(thread_id).await;
            return Ok(None);
        }
        let seen = state.stage_history().len();
        if !self.services.review.check_timeout(&mut state).await? {
            return Ok(None);
        }
        let node = state
            .review_history()
            .last()
            .map(|r| r.node.clone())
            .unwrap_or_else(|| "review".to_string());
        self.services.commit(&mut state, &node).await?;
        self.services.review.release(thread_id).await;
        self.services.publish_transitions(&state, seen);
        Ok(Some(state))
    }

    /// Wait for the current driver of `thread_id` to stop, then return the
    /// committed state.
    pub async fn join(&self, thread_id: &ThreadId) -> Result<WorkflowState> {
        let driver = self.with_run(thread_id, |run| run.driver.take()).flatten();
        if let Some(driver) = driver {
            driver
                .await
                .map_err(|e| WeftError::Runtime(e.to_string()))?;
        }
        self.get_state(thread_id).await
    }

    fn attach(&self, thread_id: &ThreadId, graph: Arc<Graph>) {
        let executor = GraphExecutor::new(graph, self.services.clone());
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.insert(
            thread_id.clone(),
            RunHandle {
                executor,
                cancel: CancellationToken::new(),
                driver: None,
            },
        );
    }

    fn with_run<T>(&self, thread_id: &ThreadId, f: impl FnOnce(&mut RunHandle) -> T) -> Option<T> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.get_mut(thread_id).map(f)
    }

    fn spawn_driver(&self, thread_id: &ThreadId) {
        let leases = self.leases.clone();
        let runs = self.runs.clone();
        let store = self.services.store.clone();
        let thread = thread_id.clone();

        let spawned = self.with_run(thread_id, |run| {
            let executor = run.executor.clone();
            let cancel = run.cancel.clone();
            let previous = run.driver.take();
            run.driver = Some(tokio::spawn(async move {
                // An earlier driver may still be unwinding; let it finish first.
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                let _lease = leases.acquire(&thread).await;
                let state = match store.load(&thread).await {
                    Ok(Some(state)) => state,
                    Ok(None) => {
                        error!(thread_id = %thread, "Driver found no checkpoint");
                        return;
                    }
                    Err(e) => {
                        error!(thread_id = %thread, error = %e, "Driver failed to load checkpoint");
                        return;
                    }
                };
                match executor.run(state, &cancel).await {
                    Ok(state) if state.is_terminal() => retire(&runs, &thread),
                    Ok(_) => {}
                    Err(e) => {
                        error!(thread_id = %thread, error = %e, "Workflow driver stopped");
                    }
                }
            }));
        });

        if spawned.is_none() {
            warn!(thread_id = %thread_id, "No graph attached; call resume to continue this workflow");
        }
    }
}

fn is_drivable(state: &WorkflowState) -> bool {
    !state.is_terminal() && state.stage() != Stage::AwaitingHuman
}

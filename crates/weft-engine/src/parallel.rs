use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::error::Result;
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::state::{ErrorContext, ErrorKind, Stage, TaskOutcome, WorkflowState};
use weft_core::traits::ParallelTask;

use crate::recovery::{fail_cancelled, ErrorRecoveryManager, RecoveryAction};

/// Outcome of one fan-out step.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Longest task duration in milliseconds.
    pub elapsed_ms: u64,
    /// The step was cancelled; results were discarded and the workflow failed.
    pub cancelled: bool,
}

struct BranchReport {
    name: String,
    outcome: TaskOutcome,
    errors: Vec<ErrorContext>,
}

/// Fans a workflow out to concurrent tasks and joins them back.
pub struct ParallelExecutionCoordinator {
    recovery: Arc<ErrorRecoveryManager>,
    event_bus: Arc<EventBus>,
}

impl ParallelExecutionCoordinator {
    pub fn new(recovery: Arc<ErrorRecoveryManager>, event_bus: Arc<EventBus>) -> Self {
        Self {
            recovery,
            event_bus,
        }
    }

    /// Run every task concurrently against a snapshot of `state`.
    ///
    /// A task's error or panic is captured under its name and never aborts
    /// its siblings. All tasks are joined before the results are merged.
    /// If `cancel` fires, in-flight tasks finish, their results are dropped
    /// and the workflow fails with reason `cancelled`.
    pub async fn execute_parallel(
        &self,
        state: &mut WorkflowState,
        node: &str,
        tasks: &BTreeMap<String, Arc<dyn ParallelTask>>,
        cancel: &CancellationToken,
    ) -> Result<ParallelSummary> {
        let mut next = state.clone();
        next.transition(Stage::ParallelExec, Some(format!("fan-out at {}", node)))?;
        *state = next;

        info!(thread_id = %state.thread_id(), node, tasks = tasks.len(), "Fan-out started");

        let started = Instant::now();
        let mut set = JoinSet::new();
        for (name, task) in tasks {
            set.spawn(run_branch(
                name.clone(),
                task.clone(),
                state.clone(),
                self.recovery.clone(),
                cancel.clone(),
            ));
        }

        let mut reports = Vec::with_capacity(tasks.len());
        let mut lost = vec![];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(thread_id = %state.thread_id(), node, error = %e, "Fan-out task lost");
                    lost.push(e.to_string());
                }
            }
        }
        if !lost.is_empty() {
            // A lost task never reported its name; attribute the losses to
            // whichever tasks are missing.
            let missing: Vec<String> = tasks
                .keys()
                .filter(|name| !reports.iter().any(|r| &r.name == *name))
                .cloned()
                .collect();
            for (name, message) in missing.into_iter().zip(lost) {
                let record = ErrorContext {
                    node: name.clone(),
                    kind: ErrorKind::Permanent,
                    message: format!("task lost: {}", message),
                    attempt: 1,
                    recoverable: false,
                    next_retry_at: None,
                    timestamp: Utc::now(),
                };
                reports.push(finish_with_error(name, record, vec![], started));
            }
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));

        if cancel.is_cancelled() {
            warn!(thread_id = %state.thread_id(), node, "Fan-out cancelled, discarding results");
            fail_cancelled(state, node)?;
            return Ok(ParallelSummary {
                succeeded: vec![],
                failed: vec![],
                elapsed_ms: 0,
                cancelled: true,
            });
        }

        let elapsed_ms = reports
            .iter()
            .map(|r| r.outcome.elapsed_ms())
            .max()
            .unwrap_or(0);
        let mut succeeded = vec![];
        let mut failed = vec![];
        let mut results = HashMap::with_capacity(reports.len());

        let mut next = state.clone();
        for report in reports {
            for record in report.errors {
                next.push_error(record)?;
            }
            if report.outcome.is_success() {
                succeeded.push(report.name.clone());
            } else {
                failed.push(report.name.clone());
            }
            results.insert(report.name, report.outcome);
        }
        next.merge_parallel_results(results)?;
        next.record_execution_time(node, elapsed_ms)?;
        next.transition(Stage::Processing, Some(format!("fan-in at {}", node)))?;
        *state = next;

        info!(
            thread_id = %state.thread_id(),
            node,
            succeeded = succeeded.len(),
            failed = failed.len(),
            elapsed_ms,
            "Fan-in complete"
        );
        self.event_bus.publish(WorkflowEvent::ParallelCompleted {
            thread_id: state.thread_id().clone(),
            node: node.to_string(),
            succeeded: succeeded.len(),
            failed: failed.len(),
        });

        Ok(ParallelSummary {
            succeeded,
            failed,
            elapsed_ms,
            cancelled: false,
        })
    }
}

/// One task with its own retry counter.
async fn run_branch(
    name: String,
    task: Arc<dyn ParallelTask>,
    snapshot: WorkflowState,
    recovery: Arc<ErrorRecoveryManager>,
    cancel: CancellationToken,
) -> BranchReport {
    let start = Instant::now();
    let mut errors = vec![];
    let mut retries_used = 0u32;

    loop {
        let attempt = AssertUnwindSafe(async { task.run(snapshot.clone()).await })
            .catch_unwind()
            .await;

        let err = match attempt {
            Ok(Ok(value)) => {
                debug!(task = %name, retries_used, "Parallel task succeeded");
                return BranchReport {
                    name,
                    outcome: TaskOutcome::Success {
                        value,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    },
                    errors,
                };
            }
            Ok(Err(err)) => err,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(task = %name, panic = %message, "Parallel task panicked");
                let record = ErrorContext {
                    node: name.clone(),
                    kind: ErrorKind::Permanent,
                    message: format!("task panicked: {}", message),
                    attempt: retries_used + 1,
                    recoverable: false,
                    next_retry_at: None,
                    timestamp: Utc::now(),
                };
                return finish_with_error(name, record, errors, start);
            }
        };

        let (record, action) = recovery.assess(&name, &err, retries_used);
        match action {
            RecoveryAction::Retry { retry, delay } if !cancel.is_cancelled() => {
                errors.push(record);
                retries_used = retry;
                debug!(task = %name, retry, delay_ms = delay.as_millis() as u64, "Retrying parallel task");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return BranchReport {
                            name,
                            outcome: TaskOutcome::Error {
                                message: "cancelled".to_string(),
                                elapsed_ms: start.elapsed().as_millis() as u64,
                            },
                            errors,
                        };
                    }
                }
            }
            _ => return finish_with_error(name, record, errors, start),
        }
    }
}

fn finish_with_error(
    name: String,
    mut record: ErrorContext,
    mut errors: Vec<ErrorContext>,
    start: Instant,
) -> BranchReport {
    record.next_retry_at = None;
    let message = record.message.clone();
    errors.push(record);
    BranchReport {
        name,
        outcome: TaskOutcome::Error {
            message,
            elapsed_ms: start.elapsed().as_millis() as u64,
        },
        errors,
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

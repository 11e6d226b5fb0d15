use serde::{Deserialize, Serialize};

use crate::state::{ReviewStatus, Stage, ThreadId};

/// Something observable that happened to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StageChanged {
        thread_id: ThreadId,
        from: Stage,
        to: Stage,
    },
    NodeStarted {
        thread_id: ThreadId,
        node: String,
        attempt: u32,
    },
    NodeCompleted {
        thread_id: ThreadId,
        node: String,
        elapsed_ms: u64,
    },
    RetryScheduled {
        thread_id: ThreadId,
        node: String,
        attempt: u32,
        delay_ms: u64,
    },
    NodeFailed {
        thread_id: ThreadId,
        node: String,
        message: String,
    },
    RouteChosen {
        thread_id: ThreadId,
        node: String,
        route: String,
        confidence: f64,
        low_confidence: bool,
    },
    ReviewRequested {
        thread_id: ThreadId,
        review_id: String,
        reason: String,
    },
    ReviewResolved {
        thread_id: ThreadId,
        review_id: String,
        status: ReviewStatus,
    },
    ParallelCompleted {
        thread_id: ThreadId,
        node: String,
        succeeded: usize,
        failed: usize,
    },
    CheckpointCommitted {
        thread_id: ThreadId,
        node: String,
        version: u64,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

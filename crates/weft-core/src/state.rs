//! Workflow state model.
//!
//! `WorkflowState` is the versioned value threaded through every engine
//! operation. Its fields are private: the engine mutates it through the
//! methods below, which enforce the stage transition matrix and refuse to
//! touch a terminal workflow. Node handlers only get `context_mut`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::StateContext;
use crate::error::{Result, WeftError};

/// Stable identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle stage of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    Processing,
    AwaitingHuman,
    ParallelExec,
    Finalizing,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Whether `self -> target` is an allowed transition.
    ///
    /// INIT -> PROCESSING -> {AWAITING_HUMAN, PARALLEL_EXEC, FINALIZING}
    /// -> {COMPLETED, FAILED}; AWAITING_HUMAN and PARALLEL_EXEC may return
    /// to PROCESSING; PROCESSING and INIT may fail directly.
    pub fn can_transition_to(self, target: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, target),
            (Init, Processing)
                | (Init, Failed)
                | (Processing, AwaitingHuman)
                | (Processing, ParallelExec)
                | (Processing, Finalizing)
                | (Processing, Failed)
                | (AwaitingHuman, Processing)
                | (AwaitingHuman, Completed)
                | (AwaitingHuman, Failed)
                | (ParallelExec, Processing)
                | (ParallelExec, Completed)
                | (ParallelExec, Failed)
                | (Finalizing, Completed)
                | (Finalizing, Failed)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "INIT",
            Stage::Processing => "PROCESSING",
            Stage::AwaitingHuman => "AWAITING_HUMAN",
            Stage::ParallelExec => "PARALLEL_EXEC",
            Stage::Finalizing => "FINALIZING",
            Stage::Completed => "COMPLETED",
            Stage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Classification of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    HumanRejection,
    Timeout,
    Cancellation,
}

/// One failed node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub node: String,
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based number of the execution attempt that failed.
    pub attempt: u32,
    pub recoverable: bool,
    /// Set when a retry was scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// A reviewer's decision on a pending review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub review_id: String,
    pub reviewer_id: String,
    pub approved: bool,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub suggested_changes: Vec<String>,
    /// Reviewer certainty in [0, 1].
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl HumanFeedback {
    pub fn approve(review_id: impl Into<String>, reviewer_id: impl Into<String>) -> Self {
        Self::new(review_id, reviewer_id, true)
    }

    pub fn reject(review_id: impl Into<String>, reviewer_id: impl Into<String>) -> Self {
        Self::new(review_id, reviewer_id, false)
    }

    fn new(review_id: impl Into<String>, reviewer_id: impl Into<String>, approved: bool) -> Self {
        Self {
            review_id: review_id.into(),
            reviewer_id: reviewer_id.into(),
            approved,
            comments: None,
            suggested_changes: vec![],
            confidence: 1.0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn with_suggestions(mut self, changes: Vec<String>) -> Self {
        self.suggested_changes = changes;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Outcome of a confidence-based branch selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Node the branch was taken from.
    pub node: String,
    pub options: BTreeMap<String, f64>,
    pub chosen: String,
    pub confidence: f64,
    /// Chosen confidence fell below the configured threshold.
    pub low_confidence: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// A request for an external human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub review_id: String,
    /// The gate node that asked for the review.
    pub node: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub status: ReviewStatus,
    /// Where to continue when the review is rejected. `None` fails the workflow.
    #[serde(default)]
    pub on_reject: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PendingReview {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.timeout_at
    }
}

/// Result of one parallel task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        value: serde_json::Value,
        elapsed_ms: u64,
    },
    Error {
        message: String,
        elapsed_ms: u64,
    },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            TaskOutcome::Success { elapsed_ms, .. } | TaskOutcome::Error { elapsed_ms, .. } => {
                *elapsed_ms
            }
        }
    }
}

/// Reference to a committed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub checkpoint_id: String,
    pub node: String,
    pub version: u64,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Where execution continues from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "position", content = "node", rename_all = "snake_case")]
pub enum Cursor {
    /// Nothing has run yet; start at the graph entry.
    Start,
    /// Execute this node next.
    At(String),
    /// This node finished; route from it.
    After(String),
    /// No more nodes.
    Done,
}

/// The state threaded through every operation of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    thread_id: ThreadId,
    stage: Stage,
    version: u64,
    cursor: Cursor,
    context: StateContext,
    errors: Vec<ErrorContext>,
    human_feedback: Vec<HumanFeedback>,
    routing_history: Vec<RoutingDecision>,
    parallel_results: HashMap<String, TaskOutcome>,
    /// Milliseconds per node (latest run).
    node_execution_times: HashMap<String, u64>,
    checkpoints: HashMap<String, CheckpointRef>,
    stage_history: Vec<StageTransition>,
    pending_review: Option<PendingReview>,
    review_history: Vec<PendingReview>,
    retry_counts: HashMap<String, u32>,
    node_visits: HashMap<String, u32>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create a fresh workflow in INIT with a generated thread id.
    pub fn new(context: StateContext) -> Self {
        Self::with_thread_id(ThreadId::new(), context)
    }

    pub fn with_thread_id(thread_id: ThreadId, context: StateContext) -> Self {
        let now = Utc::now();
        Self {
            thread_id,
            stage: Stage::Init,
            version: 0,
            cursor: Cursor::Start,
            context,
            errors: vec![],
            human_feedback: vec![],
            routing_history: vec![],
            parallel_results: HashMap::new(),
            node_execution_times: HashMap::new(),
            checkpoints: HashMap::new(),
            stage_history: vec![],
            pending_review: None,
            review_history: vec![],
            retry_counts: HashMap::new(),
            node_visits: HashMap::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn context(&self) -> &StateContext {
        &self.context
    }

    /// Mutable access to the node data. This is what handlers change.
    pub fn context_mut(&mut self) -> &mut StateContext {
        &mut self.context
    }

    pub fn errors(&self) -> &[ErrorContext] {
        &self.errors
    }

    /// Errors recorded for one node, in order.
    pub fn errors_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a ErrorContext> + 'a {
        self.errors.iter().filter(move |e| e.node == node)
    }

    pub fn human_feedback(&self) -> &[HumanFeedback] {
        &self.human_feedback
    }

    pub fn routing_history(&self) -> &[RoutingDecision] {
        &self.routing_history
    }

    pub fn parallel_results(&self) -> &HashMap<String, TaskOutcome> {
        &self.parallel_results
    }

    pub fn node_execution_times(&self) -> &HashMap<String, u64> {
        &self.node_execution_times
    }

    pub fn checkpoints(&self) -> &HashMap<String, CheckpointRef> {
        &self.checkpoints
    }

    pub fn stage_history(&self) -> &[StageTransition] {
        &self.stage_history
    }

    pub fn pending_review(&self) -> Option<&PendingReview> {
        self.pending_review.as_ref()
    }

    pub fn review_history(&self) -> &[PendingReview] {
        &self.review_history
    }

    pub fn retry_count(&self, node: &str) -> u32 {
        self.retry_counts.get(node).copied().unwrap_or(0)
    }

    pub fn visits(&self, node: &str) -> u32 {
        self.node_visits.get(node).copied().unwrap_or(0)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Error unless the workflow can still be mutated.
    pub fn ensure_mutable(&self) -> Result<()> {
        if self.stage.is_terminal() {
            return Err(WeftError::TerminalState(self.thread_id.clone()));
        }
        Ok(())
    }

    /// Move to `target`, recording the transition.
    pub fn transition(&mut self, target: Stage, reason: Option<String>) -> Result<()> {
        self.ensure_mutable()?;
        if !self.stage.can_transition_to(target) {
            return Err(WeftError::InvalidTransition {
                from: self.stage,
                to: target,
            });
        }
        let now = Utc::now();
        self.stage_history.push(StageTransition {
            from: self.stage,
            to: target,
            at: now,
            reason,
        });
        self.stage = target;
        self.updated_at = now;
        Ok(())
    }

    /// Transition to FAILED with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.transition(Stage::Failed, Some(reason.clone()))?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    pub fn set_cursor(&mut self, cursor: Cursor) -> Result<()> {
        self.ensure_mutable()?;
        self.cursor = cursor;
        self.touch();
        Ok(())
    }

    pub fn push_error(&mut self, error: ErrorContext) -> Result<()> {
        self.ensure_mutable()?;
        self.errors.push(error);
        self.touch();
        Ok(())
    }

    pub fn push_feedback(&mut self, feedback: HumanFeedback) -> Result<()> {
        self.ensure_mutable()?;
        self.human_feedback.push(feedback);
        self.touch();
        Ok(())
    }

    pub fn push_routing(&mut self, decision: RoutingDecision) -> Result<()> {
        self.ensure_mutable()?;
        self.routing_history.push(decision);
        self.touch();
        Ok(())
    }

    /// Merge a fan-in result set, replacing entries with the same name.
    pub fn merge_parallel_results(&mut self, results: HashMap<String, TaskOutcome>) -> Result<()> {
        self.ensure_mutable()?;
        self.parallel_results.extend(results);
        self.touch();
        Ok(())
    }

    pub fn record_execution_time(&mut self, node: impl Into<String>, elapsed_ms: u64) -> Result<()> {
        self.ensure_mutable()?;
        self.node_execution_times.insert(node.into(), elapsed_ms);
        self.touch();
        Ok(())
    }

    pub fn set_retry_count(&mut self, node: impl Into<String>, count: u32) -> Result<()> {
        self.ensure_mutable()?;
        self.retry_counts.insert(node.into(), count);
        self.touch();
        Ok(())
    }

    pub fn clear_retry_count(&mut self, node: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.retry_counts.remove(node);
        self.touch();
        Ok(())
    }

    /// Count a visit to `node` and return the new total.
    pub fn visit(&mut self, node: &str) -> Result<u32> {
        self.ensure_mutable()?;
        let count = self.node_visits.entry(node.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.touch();
        Ok(count)
    }

    /// Install the active review. Fails if one is already active.
    pub fn open_review(&mut self, review: PendingReview) -> Result<()> {
        self.ensure_mutable()?;
        if let Some(active) = &self.pending_review {
            return Err(WeftError::ReviewAlreadyPending {
                thread_id: self.thread_id.clone(),
                review_id: active.review_id.clone(),
            });
        }
        self.pending_review = Some(review);
        self.touch();
        Ok(())
    }

    /// Resolve the active review and move it to the immutable history.
    pub fn close_review(&mut self, review_id: &str, status: ReviewStatus) -> Result<PendingReview> {
        self.ensure_mutable()?;
        match &self.pending_review {
            Some(active) if active.review_id == review_id => {}
            _ => {
                if self.review_history.iter().any(|r| r.review_id == review_id) {
                    return Err(WeftError::ReviewResolved(review_id.to_string()));
                }
                return Err(WeftError::ReviewNotFound(review_id.to_string()));
            }
        }
        let mut review = self
            .pending_review
            .take()
            .ok_or_else(|| WeftError::ReviewNotFound(review_id.to_string()))?;
        let now = Utc::now();
        review.status = status;
        review.resolved_at = Some(now);
        self.review_history.push(review.clone());
        self.updated_at = now;
        Ok(review)
    }

    /// Record a checkpoint at a node boundary, bumping the version.
    pub fn commit_checkpoint(&mut self, node: impl Into<String>) -> CheckpointRef {
        let now = Utc::now();
        self.version += 1;
        let reference = CheckpointRef {
            checkpoint_id: Uuid::new_v4().to_string(),
            node: node.into(),
            version: self.version,
            committed_at: now,
        };
        self.checkpoints
            .insert(reference.checkpoint_id.clone(), reference.clone());
        self.updated_at = now;
        reference
    }

    /// Most recent checkpoint by version.
    pub fn latest_checkpoint(&self) -> Option<&CheckpointRef> {
        self.checkpoints.values().max_by_key(|c| c.version)
    }

    /// Adopt the node data of a state returned by a handler.
    ///
    /// Bookkeeping fields stay owned by the engine; only `context` is taken.
    pub fn absorb(&mut self, returned: WorkflowState) -> Result<()> {
        self.ensure_mutable()?;
        self.context = returned.context;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

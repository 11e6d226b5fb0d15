use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, warn};

use weft_core::config::{RecoveryConfig, RetryPolicy};
use weft_core::error::{NodeError, Result};
use weft_core::state::{ErrorContext, ErrorKind, WorkflowState};

/// Decides whether an error is worth retrying.
pub type Classifier = Arc<dyn Fn(&NodeError) -> bool + Send + Sync>;

/// What the executor should do after a node error.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Run the node again after `delay`. `retry` is the 1-based retry number.
    Retry { retry: u32, delay: Duration },
    /// The node failed for good.
    Fail { reason: String },
}

/// Default classification: transient and timeout errors are recoverable,
/// validation errors are not, untyped errors go by their message.
pub fn is_recoverable(err: &NodeError) -> bool {
    matches!(err.kind(), ErrorKind::Transient | ErrorKind::Timeout)
}

/// Classifies failed node executions and schedules retries.
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    classifier: Classifier,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(is_recoverable),
        }
    }

    /// Replace the recoverability predicate.
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&NodeError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Override the policy for one node or parallel task.
    pub fn with_node_policy(mut self, node: impl Into<String>, policy: RetryPolicy) -> Self {
        self.config.nodes.insert(node.into(), policy);
        self
    }

    pub fn policy_for(&self, node: &str) -> &RetryPolicy {
        self.config.nodes.get(node).unwrap_or(&self.config.default)
    }

    pub fn is_recoverable(&self, err: &NodeError) -> bool {
        (self.classifier)(err)
    }

    /// Delay before retry number `n` (0-based) of `node`.
    pub fn delay_for(&self, node: &str, n: u32) -> Duration {
        let policy = self.policy_for(node);
        let delay = policy.base_delay(n);
        if policy.jitter && !delay.is_zero() {
            // 0.8x to 1.2x
            let factor = 0.8 + rand::random::<f64>() * 0.4;
            Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
        } else {
            delay
        }
    }

    /// Classify an error given how many retries `node` already used.
    ///
    /// Returns the error record to append and the action to take. Does not
    /// touch any state, so parallel branches can keep their own counters.
    pub fn assess(&self, node: &str, err: &NodeError, retries_used: u32) -> (ErrorContext, RecoveryAction) {
        let limit = self.policy_for(node).retry_limit();
        let recoverable = self.is_recoverable(err);
        let now = Utc::now();

        let mut record = ErrorContext {
            node: node.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            attempt: retries_used + 1,
            recoverable,
            next_retry_at: None,
            timestamp: now,
        };

        if recoverable && retries_used < limit {
            let delay = self.delay_for(node, retries_used);
            let offset = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            record.next_retry_at = Some(now + offset);
            return (
                record,
                RecoveryAction::Retry {
                    retry: retries_used + 1,
                    delay,
                },
            );
        }

        let reason = if recoverable {
            format!("node '{}' exhausted {} retries: {}", node, limit, err)
        } else {
            format!("node '{}' failed with non-recoverable error: {}", node, err)
        };
        (record, RecoveryAction::Fail { reason })
    }

    /// Record a node error on the workflow and decide what happens next.
    ///
    /// On retry the stage stays PROCESSING and the node's counter goes up.
    /// On failure the workflow moves to FAILED with the reason recorded.
    pub fn handle_error(
        &self,
        state: &mut WorkflowState,
        err: &NodeError,
        node: &str,
    ) -> Result<RecoveryAction> {
        state.ensure_mutable()?;
        let retries_used = state.retry_count(node);
        let (record, action) = self.assess(node, err, retries_used);

        let mut next = state.clone();
        next.push_error(record)?;
        match &action {
            RecoveryAction::Retry { retry, delay } => {
                warn!(
                    thread_id = %next.thread_id(),
                    node,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Scheduling node retry"
                );
                next.set_retry_count(node, *retry)?;
            }
            RecoveryAction::Fail { reason } => {
                error!(thread_id = %next.thread_id(), node, %reason, "Node failed permanently");
                next.fail(reason.clone())?;
            }
        }
        *state = next;
        Ok(action)
    }

    /// Reset the retry counter after a successful run of `node`.
    pub fn record_success(&self, state: &mut WorkflowState, node: &str) -> Result<()> {
        if state.retry_count(node) > 0 {
            state.clear_retry_count(node)?;
        }
        Ok(())
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

/// Fail a workflow because the caller cancelled it.
pub fn fail_cancelled(state: &mut WorkflowState, node: &str) -> Result<()> {
    let mut next = state.clone();
    next.push_error(ErrorContext {
        node: node.to_string(),
        kind: ErrorKind::Cancellation,
        message: "cancelled by caller".to_string(),
        attempt: 0,
        recoverable: false,
        next_retry_at: None,
        timestamp: Utc::now(),
    })?;
    next.fail("cancelled")?;
    *state = next;
    Ok(())
}

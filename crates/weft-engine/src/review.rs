use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use weft_core::config::{ReviewConfig, TimeoutAction};
use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::state::{
    Cursor, ErrorContext, ErrorKind, HumanFeedback, PendingReview, ReviewStatus, Stage, ThreadId,
    WorkflowState,
};

/// Reviewer id recorded on feedback synthesized by a timeout.
pub const TIMEOUT_REVIEWER: &str = "system:timeout";

/// Suspends workflows until a human decision arrives.
///
/// The review itself lives on the workflow state, which is what gets
/// persisted; the gate keeps an index of active reviews across threads.
pub struct HumanReviewGate {
    config: ReviewConfig,
    active: Mutex<HashMap<ThreadId, PendingReview>>,
    event_bus: Arc<EventBus>,
}

impl HumanReviewGate {
    pub fn new(config: ReviewConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.default_timeout_secs)
    }

    /// Open a review on `state` and move it to AWAITING_HUMAN.
    ///
    /// Either both happen or neither does.
    pub async fn request_review(
        &self,
        state: &mut WorkflowState,
        node: &str,
        reason: &str,
        timeout: Option<Duration>,
        on_reject: Option<String>,
    ) -> Result<PendingReview> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let now = Utc::now();
        let timeout_at = now
            + chrono::Duration::from_std(timeout)
                .map_err(|e| WeftError::Config(format!("review timeout out of range: {}", e)))?;

        let review = PendingReview {
            review_id: Uuid::new_v4().to_string(),
            node: node.to_string(),
            reason: reason.to_string(),
            requested_at: now,
            timeout_at,
            status: ReviewStatus::Pending,
            on_reject,
            resolved_at: None,
        };

        let mut next = state.clone();
        next.open_review(review.clone())?;
        next.transition(Stage::AwaitingHuman, Some(format!("review requested at {}", node)))?;
        *state = next;

        self.active
            .lock()
            .await
            .insert(state.thread_id().clone(), review.clone());

        info!(
            thread_id = %state.thread_id(),
            node,
            review_id = %review.review_id,
            timeout_at = %review.timeout_at,
            "Human review requested"
        );
        self.event_bus.publish(WorkflowEvent::ReviewRequested {
            thread_id: state.thread_id().clone(),
            review_id: review.review_id.clone(),
            reason: review.reason.clone(),
        });

        Ok(review)
    }

    /// Apply a reviewer's decision and resume the workflow.
    ///
    /// Approval continues after the gate node. Rejection continues at the
    /// review's `on_reject` node, or fails the workflow when there is none.
    pub async fn submit_feedback(
        &self,
        state: &mut WorkflowState,
        review_id: &str,
        mut feedback: HumanFeedback,
    ) -> Result<PendingReview> {
        let now = Utc::now();
        feedback.timestamp = now;
        self.submit_feedback_at(state, review_id, now, feedback).await
    }

    async fn submit_feedback_at(
        &self,
        state: &mut WorkflowState,
        review_id: &str,
        now: DateTime<Utc>,
        mut feedback: HumanFeedback,
    ) -> Result<PendingReview> {
        state.ensure_mutable()?;
        let review = active_review(state, review_id)?;
        if state.stage() != Stage::AwaitingHuman {
            return Err(WeftError::NotAwaitingReview {
                thread_id: state.thread_id().clone(),
                stage: state.stage(),
            });
        }
        if !(0.0..=1.0).contains(&feedback.confidence) {
            return Err(WeftError::InvalidConfidence {
                subject: format!("feedback on review {}", review_id),
                value: feedback.confidence,
            });
        }
        if review.is_expired(now) {
            return Err(WeftError::ReviewExpired(review_id.to_string()));
        }

        feedback.review_id = review_id.to_string();
        let approved = feedback.approved;
        let status = if approved {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Rejected
        };

        let mut next = state.clone();
        next.push_feedback(feedback)?;
        let closed = next.close_review(review_id, status)?;
        if approved {
            resume_after(&mut next, &closed)?;
        } else {
            apply_rejection(&mut next, &closed, "rejected by reviewer", "human_review_rejected")?;
        }
        *state = next;

        info!(
            thread_id = %state.thread_id(),
            review_id,
            status = %closed.status,
            stage = %state.stage(),
            "Human review resolved"
        );
        self.publish_resolved(state.thread_id(), &closed);
        Ok(closed)
    }

    /// Resolve the active review if its deadline has passed.
    ///
    /// Returns `true` only on the call that resolved it; later calls, calls
    /// on non-suspended workflows, and calls before the deadline are no-ops.
    pub async fn check_timeout(&self, state: &mut WorkflowState) -> Result<bool> {
        self.check_timeout_at(state, Utc::now()).await
    }

    pub async fn check_timeout_at(
        &self,
        state: &mut WorkflowState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if state.is_terminal() || state.stage() != Stage::AwaitingHuman {
            return Ok(false);
        }
        let review = match state.pending_review() {
            Some(review) if review.is_expired(now) => review.clone(),
            _ => return Ok(false),
        };

        let mut next = state.clone();
        match self.config.on_timeout {
            TimeoutAction::Fail => {
                next.push_error(ErrorContext {
                    node: review.node.clone(),
                    kind: ErrorKind::Timeout,
                    message: format!("review {} expired at {}", review.review_id, review.timeout_at),
                    attempt: 1,
                    recoverable: false,
                    next_retry_at: None,
                    timestamp: now,
                })?;
                next.close_review(&review.review_id, ReviewStatus::TimedOut)?;
                next.fail("human_review_timeout")?;
            }
            TimeoutAction::AutoApprove => {
                next.push_feedback(synthetic_feedback(&review, true))?;
                let closed = next.close_review(&review.review_id, ReviewStatus::TimedOut)?;
                resume_after(&mut next, &closed)?;
            }
            TimeoutAction::AutoReject => {
                next.push_feedback(synthetic_feedback(&review, false))?;
                let closed = next.close_review(&review.review_id, ReviewStatus::TimedOut)?;
                apply_rejection(&mut next, &closed, "auto-rejected on timeout", "human_review_timeout")?;
            }
        }
        *state = next;

        warn!(
            thread_id = %state.thread_id(),
            review_id = %review.review_id,
            action = ?self.config.on_timeout,
            stage = %state.stage(),
            "Human review timed out"
        );
        let mut closed = review;
        closed.status = ReviewStatus::TimedOut;
        self.publish_resolved(state.thread_id(), &closed);
        Ok(true)
    }

    /// List all active reviews.
    pub async fn pending_reviews(&self) -> Vec<(ThreadId, PendingReview)> {
        self.active
            .lock()
            .await
            .iter()
            .map(|(thread, review)| (thread.clone(), review.clone()))
            .collect()
    }

    /// Find an active review by prefix match on its id.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<(ThreadId, String)> {
        let active = self.active.lock().await;
        for (thread, review) in active.iter() {
            if review.review_id.starts_with(prefix) {
                return Some((thread.clone(), review.review_id.clone()));
            }
        }
        None
    }

    /// Drop the index entry for `thread_id`.
    ///
    /// Resolving a review leaves its entry in place; callers release it once
    /// the resolved state is committed.
    pub async fn release(&self, thread_id: &ThreadId) {
        self.active.lock().await.remove(thread_id);
    }

    /// Re-index a review from a persisted state, e.g. after a restart.
    pub async fn restore(&self, state: &WorkflowState) {
        if state.stage() != Stage::AwaitingHuman {
            return;
        }
        if let Some(review) = state.pending_review() {
            self.active
                .lock()
                .await
                .insert(state.thread_id().clone(), review.clone());
        }
    }

    fn publish_resolved(&self, thread_id: &ThreadId, review: &PendingReview) {
        self.event_bus.publish(WorkflowEvent::ReviewResolved {
            thread_id: thread_id.clone(),
            review_id: review.review_id.clone(),
            status: review.status,
        });
    }
}

fn active_review(state: &WorkflowState, review_id: &str) -> Result<PendingReview> {
    match state.pending_review() {
        Some(review) if review.review_id == review_id => Ok(review.clone()),
        _ => {
            if state.review_history().iter().any(|r| r.review_id == review_id) {
                Err(WeftError::ReviewResolved(review_id.to_string()))
            } else {
                Err(WeftError::ReviewNotFound(review_id.to_string()))
            }
        }
    }
}

fn resume_after(state: &mut WorkflowState, review: &PendingReview) -> Result<()> {
    state.transition(
        Stage::Processing,
        Some(format!("review {} {}", review.review_id, review.status)),
    )?;
    state.set_cursor(Cursor::After(review.node.clone()))
}

fn apply_rejection(
    state: &mut WorkflowState,
    review: &PendingReview,
    message: &str,
    fail_reason: &str,
) -> Result<()> {
    state.push_error(ErrorContext {
        node: review.node.clone(),
        kind: ErrorKind::HumanRejection,
        message: format!("review {} {}", review.review_id, message),
        attempt: 1,
        recoverable: review.on_reject.is_some(),
        next_retry_at: None,
        timestamp: Utc::now(),
    })?;
    match &review.on_reject {
        Some(target) => {
            state.transition(
                Stage::Processing,
                Some(format!("review {} rejected, continuing at {}", review.review_id, target)),
            )?;
            state.set_cursor(Cursor::At(target.clone()))
        }
        None => state.fail(fail_reason),
    }
}

fn synthetic_feedback(review: &PendingReview, approved: bool) -> HumanFeedback {
    let feedback = if approved {
        HumanFeedback::approve(&review.review_id, TIMEOUT_REVIEWER)
    } else {
        HumanFeedback::reject(&review.review_id, TIMEOUT_REVIEWER)
    };
    feedback
        .with_comments(format!("no decision before {}", review.timeout_at))
        .with_confidence(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::StateContext;

    fn gate(on_timeout: TimeoutAction) -> HumanReviewGate {
        HumanReviewGate::new(
            ReviewConfig {
                default_timeout_secs: 3600,
                on_timeout,
            },
            Arc::new(EventBus::default()),
        )
    }

    fn processing_state() -> WorkflowState {
        let mut state = WorkflowState::new(StateContext::new());
        state.transition(Stage::Processing, None).unwrap();
        state
    }

    #[tokio::test]
    async fn test_request_review_suspends() {
        let gate = gate(TimeoutAction::Fail);
        let mut rx = gate.event_bus.subscribe();
        let mut state = processing_state();

        let review = gate
            .request_review(&mut state, "review", "check the draft", None, None)
            .await
            .unwrap();
        assert_eq!(state.stage(), Stage::AwaitingHuman);
        assert_eq!(state.pending_review().unwrap().review_id, review.review_id);
        assert_eq!(
            (review.timeout_at - review.requested_at).num_seconds(),
            3600
        );
        assert_eq!(gate.pending_reviews().await.len(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::ReviewRequested { .. }
        ));
    }

    #[tokio::test]
    async fn test_second_request_rejected_without_side_effects() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let first = gate
            .request_review(&mut state, "review", "first", None, None)
            .await
            .unwrap();

        let err = gate
            .request_review(&mut state, "review", "second", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::ReviewAlreadyPending { .. }));
        assert_eq!(state.pending_review().unwrap().review_id, first.review_id);
        assert_eq!(state.stage_history().len(), 2);
    }

    #[tokio::test]
    async fn test_approval_resumes_after_gate() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", None, None)
            .await
            .unwrap();

        let feedback = HumanFeedback::approve("ignored", "reviewer-1").with_comments("looks good");
        let closed = gate
            .submit_feedback(&mut state, &review.review_id, feedback)
            .await
            .unwrap();

        assert_eq!(closed.status, ReviewStatus::Approved);
        assert_eq!(state.stage(), Stage::Processing);
        assert_eq!(state.cursor(), &Cursor::After("review".into()));
        assert_eq!(state.human_feedback()[0].review_id, review.review_id);
        assert!(state.pending_review().is_none());
        assert_eq!(gate.pending_reviews().await.len(), 1);
        gate.release(state.thread_id()).await;
        assert!(gate.pending_reviews().await.is_empty());

        let again = gate
            .submit_feedback(
                &mut state,
                &review.review_id,
                HumanFeedback::approve("", "reviewer-2"),
            )
            .await
            .unwrap_err();
        assert!(matches!(again, WeftError::ReviewResolved(_)));
    }

    #[tokio::test]
    async fn test_rejection_routes_to_recovery_node() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", None, Some("regenerate".into()))
            .await
            .unwrap();

        gate.submit_feedback(
            &mut state,
            &review.review_id,
            HumanFeedback::reject("", "reviewer-1").with_suggestions(vec!["shorter".into()]),
        )
        .await
        .unwrap();

        assert_eq!(state.stage(), Stage::Processing);
        assert_eq!(state.cursor(), &Cursor::At("regenerate".into()));
        assert_eq!(state.errors()[0].kind, ErrorKind::HumanRejection);
    }

    #[tokio::test]
    async fn test_rejection_without_recovery_fails() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", None, None)
            .await
            .unwrap();

        gate.submit_feedback(&mut state, &review.review_id, HumanFeedback::reject("", "r"))
            .await
            .unwrap();
        assert_eq!(state.stage(), Stage::Failed);
        assert_eq!(state.failure_reason(), Some("human_review_rejected"));
    }

    #[tokio::test]
    async fn test_invalid_feedback_rejected() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", None, None)
            .await
            .unwrap();

        let err = gate
            .submit_feedback(
                &mut state,
                &review.review_id,
                HumanFeedback::approve("", "r").with_confidence(1.5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::InvalidConfidence { .. }));

        let err = gate
            .submit_feedback(&mut state, "unknown", HumanFeedback::approve("", "r"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::ReviewNotFound(_)));
        assert_eq!(state.stage(), Stage::AwaitingHuman);
        assert!(state.human_feedback().is_empty());
    }

    #[tokio::test]
    async fn test_late_feedback_rejected() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", Some(Duration::from_secs(60)), None)
            .await
            .unwrap();

        let late = review.timeout_at + chrono::Duration::seconds(1);
        let err = gate
            .submit_feedback_at(&mut state, &review.review_id, late, HumanFeedback::approve("", "r"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::ReviewExpired(_)));
        assert_eq!(state.stage(), Stage::AwaitingHuman);
    }

    #[tokio::test]
    async fn test_timeout_is_idempotent() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", Some(Duration::from_secs(60)), None)
            .await
            .unwrap();

        let before = review.timeout_at - chrono::Duration::seconds(1);
        assert!(!gate.check_timeout_at(&mut state, before).await.unwrap());
        assert_eq!(state.stage(), Stage::AwaitingHuman);

        let after = review.timeout_at + chrono::Duration::seconds(1);
        assert!(gate.check_timeout_at(&mut state, after).await.unwrap());
        assert_eq!(state.stage(), Stage::Failed);
        assert_eq!(state.failure_reason(), Some("human_review_timeout"));
        let snapshot = state.clone();

        assert!(!gate.check_timeout_at(&mut state, after).await.unwrap());
        assert!(!gate.check_timeout(&mut state).await.unwrap());
        assert_eq!(state, snapshot);
        assert_eq!(state.review_history()[0].status, ReviewStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_timeout_auto_approve() {
        let gate = gate(TimeoutAction::AutoApprove);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", Some(Duration::from_secs(1)), None)
            .await
            .unwrap();

        let after = review.timeout_at + chrono::Duration::seconds(5);
        assert!(gate.check_timeout_at(&mut state, after).await.unwrap());
        assert_eq!(state.stage(), Stage::Processing);
        assert_eq!(state.cursor(), &Cursor::After("review".into()));
        let feedback = &state.human_feedback()[0];
        assert!(feedback.approved);
        assert_eq!(feedback.reviewer_id, TIMEOUT_REVIEWER);
        assert_eq!(state.review_history()[0].status, ReviewStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_timeout_auto_reject_uses_recovery_node() {
        let gate = gate(TimeoutAction::AutoReject);
        let mut state = processing_state();
        let review = gate
            .request_review(
                &mut state,
                "review",
                "check",
                Some(Duration::from_secs(1)),
                Some("regenerate".into()),
            )
            .await
            .unwrap();

        let after = review.timeout_at + chrono::Duration::seconds(5);
        assert!(gate.check_timeout_at(&mut state, after).await.unwrap());
        assert_eq!(state.cursor(), &Cursor::At("regenerate".into()));
        assert!(!state.human_feedback()[0].approved);
    }

    #[tokio::test]
    async fn test_find_by_prefix_and_restore() {
        let gate = gate(TimeoutAction::Fail);
        let mut state = processing_state();
        let review = gate
            .request_review(&mut state, "review", "check", None, None)
            .await
            .unwrap();

        let (thread, id) = gate.find_by_prefix(&review.review_id[..8]).await.unwrap();
        assert_eq!(&thread, state.thread_id());
        assert_eq!(id, review.review_id);
        assert!(gate.find_by_prefix("zzzz-not-a-uuid").await.is_none());

        let fresh = HumanReviewGate::new(ReviewConfig::default(), Arc::new(EventBus::default()));
        fresh.restore(&state).await;
        assert_eq!(fresh.pending_reviews().await.len(), 1);
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{ErrorKind, Stage, ThreadId};

#[derive(Debug, Error)]
pub enum WeftError {
    // State machine errors
    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Workflow {0} is terminal and cannot be mutated")]
    TerminalState(ThreadId),

    // Graph errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("No handler registered for node: {0}")]
    HandlerNotFound(String),

    #[error("Graph validation failed: {0}")]
    Graph(String),

    // Routing errors
    #[error("No route candidates for node: {0}")]
    NoRoute(String),

    #[error("Invalid confidence for {subject}: {value}")]
    InvalidConfidence { subject: String, value: f64 },

    // Review errors
    #[error("Review {review_id} already pending for thread {thread_id}")]
    ReviewAlreadyPending { thread_id: ThreadId, review_id: String },

    #[error("Review not found: {0}")]
    ReviewNotFound(String),

    #[error("Review already resolved: {0}")]
    ReviewResolved(String),

    #[error("Review expired before feedback arrived: {0}")]
    ReviewExpired(String),

    #[error("Workflow {thread_id} is not awaiting review (stage {stage})")]
    NotAwaitingReview { thread_id: ThreadId, stage: Stage },

    // Engine errors
    #[error("Thread not found: {0}")]
    ThreadNotFound(ThreadId),

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Workflow driver failed: {0}")]
    Runtime(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Checkpoint store error: {0}")]
    Store(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;

/// Error raised by a node handler or a parallel task.
///
/// Handlers pick the variant; the recovery policy decides what it means.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum NodeError {
    /// Temporary failure (rate limit, dropped connection, ...).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Input or business-rule violation. Retrying cannot help.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The handler did not finish in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Anything else; classified by message.
    #[error("{0}")]
    Other(String),
}

impl NodeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The kind recorded in `ErrorContext`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Validation(_) => ErrorKind::Permanent,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Other(msg) => {
                if looks_transient(msg) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Validation(m) | Self::Timeout(m) | Self::Other(m) => m,
        }
    }
}

/// Heuristic for untyped errors coming out of HTTP/LLM clients.
pub fn looks_transient(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.split(|c: char| !c.is_ascii_alphanumeric())
        .any(is_retryable_status)
        || msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection")
        || msg.contains("temporarily")
}

/// `429` or any `5xx` status code, as a standalone token.
fn is_retryable_status(token: &str) -> bool {
    match token.as_bytes() {
        [b'4', b'2', b'9'] => true,
        [b'5', d1, d2] => d1.is_ascii_digit() && d2.is_ascii_digit(),
        _ => false,
    }
}

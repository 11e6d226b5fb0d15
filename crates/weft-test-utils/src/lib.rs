//! Scripted handlers, tasks, and stores for exercising weft workflows.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use weft_core::error::{NodeError, Result, WeftError};
use weft_core::state::{ThreadId, WorkflowState};
use weft_core::traits::{CheckpointStore, NodeHandler, ParallelTask};

/// Sets `key = value` in the context and counts invocations.
pub struct SetHandler {
    key: String,
    value: serde_json::Value,
    calls: AtomicU32,
}

impl SetHandler {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            value,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeHandler for SetHandler {
    fn run(&self, mut state: WorkflowState) -> BoxFuture<'_, std::result::Result<WorkflowState, NodeError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        state.context_mut().set(self.key.clone(), self.value.clone());
        Box::pin(async move { Ok(state) })
    }
}

/// Fails with a transient error for the first `failures` calls, then sets
/// `key = "ok"`.
pub struct FlakyHandler {
    key: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(key: impl Into<String>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeHandler for FlakyHandler {
    fn run(&self, mut state: WorkflowState) -> BoxFuture<'_, std::result::Result<WorkflowState, NodeError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = call <= self.failures;
        if !fail {
            state.context_mut().set_str(self.key.clone(), "ok");
        }
        Box::pin(async move {
            if fail {
                Err(NodeError::transient(format!("503 on call {}", call)))
            } else {
                Ok(state)
            }
        })
    }
}

/// Always fails with the given error.
pub struct FailingHandler {
    error: NodeError,
    calls: AtomicU32,
}

impl FailingHandler {
    pub fn new(error: NodeError) -> Arc<Self> {
        Arc::new(Self {
            error,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeHandler for FailingHandler {
    fn run(&self, _state: WorkflowState) -> BoxFuture<'_, std::result::Result<WorkflowState, NodeError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}

/// Sleeps, then returns a fixed value.
pub struct SleepTask {
    delay: Duration,
    value: serde_json::Value,
}

impl SleepTask {
    pub fn new(delay: Duration, value: serde_json::Value) -> Arc<Self> {
        Arc::new(Self { delay, value })
    }
}

impl ParallelTask for SleepTask {
    fn run(&self, _snapshot: WorkflowState) -> BoxFuture<'_, std::result::Result<serde_json::Value, NodeError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(self.value.clone())
        })
    }
}

/// Sleeps, then panics.
pub struct PanickingTask {
    delay: Duration,
}

impl PanickingTask {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay })
    }
}

impl ParallelTask for PanickingTask {
    fn run(&self, _snapshot: WorkflowState) -> BoxFuture<'_, std::result::Result<serde_json::Value, NodeError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            panic!("task blew up after {:?}", self.delay)
        })
    }
}

/// Panics as soon as it is called, before any future is returned.
pub struct PanicOnCall {
    message: String,
}

impl PanicOnCall {
    pub fn new(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            message: message.into(),
        })
    }
}

impl NodeHandler for PanicOnCall {
    fn run(&self, _state: WorkflowState) -> BoxFuture<'_, std::result::Result<WorkflowState, NodeError>> {
        panic!("{}", self.message)
    }
}

impl ParallelTask for PanicOnCall {
    fn run(&self, _snapshot: WorkflowState) -> BoxFuture<'_, std::result::Result<serde_json::Value, NodeError>> {
        panic!("{}", self.message)
    }
}

/// Delegates to `inner` but rejects every save after the first `allowed`.
pub struct FailingStore {
    inner: Arc<dyn CheckpointStore>,
    allowed: AtomicU32,
    saves: AtomicU32,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn CheckpointStore>, allowed: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            allowed: AtomicU32::new(allowed),
            saves: AtomicU32::new(0),
        })
    }

    /// Accept every save from now on.
    pub fn recover(&self) {
        self.allowed.store(u32::MAX, Ordering::SeqCst);
    }

    /// Save attempts so far, including rejected ones.
    pub fn attempts(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for FailingStore {
    fn save(&self, thread_id: &ThreadId, state: &WorkflowState) -> BoxFuture<'_, Result<()>> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.allowed.load(Ordering::SeqCst) {
            return Box::pin(async move {
                Err(WeftError::Store(format!("disk full on save {}", attempt)))
            });
        }
        self.inner.save(thread_id, state)
    }

    fn load(&self, thread_id: &ThreadId) -> BoxFuture<'_, Result<Option<WorkflowState>>> {
        self.inner.load(thread_id)
    }
}

/// Write `content` to a temp file with the given suffix (e.g. ".toml").
pub fn temp_file(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

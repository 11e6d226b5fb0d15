use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use futures::future::BoxFuture;
use tracing::debug;

use weft_core::error::Result;
use weft_core::state::{ThreadId, WorkflowState};
use weft_core::traits::CheckpointStore;

/// In-process checkpoint store.
///
/// Each thread keeps only its latest snapshot, stored as serialized JSON so
/// that a loaded state never aliases the caller's value. Serialization
/// happens before the lock is taken, so a save either replaces the whole
/// snapshot or leaves the previous one in place.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    snapshots: RwLock<HashMap<ThreadId, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads with a saved snapshot.
    pub fn threads(&self) -> Vec<ThreadId> {
        let mut threads: Vec<_> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        threads.sort();
        threads
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save_sync(&self, thread_id: &ThreadId, state: &WorkflowState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread_id.clone(), json);
        debug!(thread_id = %thread_id, version = state.version(), stage = %state.stage(), "Checkpoint saved");
        Ok(())
    }

    fn load_sync(&self, thread_id: &ThreadId) -> Result<Option<WorkflowState>> {
        let json = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .cloned();
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, thread_id: &ThreadId, state: &WorkflowState) -> BoxFuture<'_, Result<()>> {
        let result = self.save_sync(thread_id, state);
        Box::pin(async move { result })
    }

    fn load(&self, thread_id: &ThreadId) -> BoxFuture<'_, Result<Option<WorkflowState>>> {
        let result = self.load_sync(thread_id);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::state::{HumanFeedback, Stage};
    use weft_core::StateContext;

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let store = MemoryCheckpointStore::new();
        let mut state = WorkflowState::new(StateContext::new());
        state.context_mut().set_str("topic", "rust");
        state.transition(Stage::Processing, None).unwrap();
        state.visit("draft").unwrap();
        state
            .push_feedback(HumanFeedback::approve("r1", "reviewer").with_comments("ok"))
            .unwrap();
        state.commit_checkpoint("draft");

        store.save(state.thread_id(), &state).await.unwrap();
        let loaded = store.load(state.thread_id()).await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load(&ThreadId::from("nope")).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_snapshot() {
        let store = MemoryCheckpointStore::new();
        let mut state = WorkflowState::with_thread_id(ThreadId::from("t1"), StateContext::new());
        store.save(state.thread_id(), &state).await.unwrap();

        state.transition(Stage::Processing, None).unwrap();
        state.commit_checkpoint("a");
        store.save(state.thread_id(), &state).await.unwrap();

        let loaded = store.load(&ThreadId::from("t1")).await.unwrap().unwrap();
        assert_eq!(loaded.stage(), Stage::Processing);
        assert_eq!(loaded.version(), 1);
        assert_eq!(store.threads(), vec![ThreadId::from("t1")]);
    }
}

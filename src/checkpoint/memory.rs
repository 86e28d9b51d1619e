//! 内存检查点存储（测试与单进程演示用，进程退出即丢失）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointError, CheckpointId, CheckpointMeta, CheckpointStore};

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    sessions: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointId, CheckpointError> {
        checkpoint.verify()?;
        let mut sessions = self.sessions.write().await;
        let history = sessions.entry(checkpoint.session_id.clone()).or_default();
        if let Some(latest) = history.last() {
            if checkpoint.step <= latest.step {
                return Err(CheckpointError::Conflict {
                    session_id: checkpoint.session_id.clone(),
                    step: checkpoint.step,
                    latest: latest.step,
                });
            }
        }
        history.push(checkpoint.clone());
        Ok(checkpoint.id())
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .and_then(|h| h.last().cloned()))
    }

    async fn load(&self, session_id: &str, step: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .and_then(|h| h.iter().find(|c| c.step == step).cloned()))
    }

    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|h| h.iter().map(Checkpoint::meta).collect())
            .unwrap_or_default())
    }

    async fn sessions(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::TaskState;
    use crate::memory::{Message, MessageLog};

    fn checkpoint(session: &str, step: u64, messages: usize) -> Checkpoint {
        let mut log = MessageLog::new();
        for i in 0..messages {
            log.append(Message::user(format!("m{i}")));
        }
        let mut state = TaskState::new(session);
        state.log_len = log.len() as u64;
        Checkpoint::new(step, state, log)
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("s1", 0, 1)).await.unwrap();
        store.save(&checkpoint("s1", 1, 2)).await.unwrap();

        let latest = store.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.step, 1);
        assert_eq!(latest.log.len(), 2);
        assert!(store.load_latest("missing").await.unwrap().is_none());

        // 被取代的检查点仍可读取
        let first = store.load("s1", 0).await.unwrap().unwrap();
        assert_eq!(first.log.len(), 1);
        assert_eq!(store.history("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_monotonic_step_rejected() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("s1", 3, 1)).await.unwrap();
        let err = store.save(&checkpoint("s1", 3, 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Conflict { latest: 3, .. }));
        let err = store.save(&checkpoint("s1", 2, 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Conflict { .. }));
        assert_eq!(store.load_latest("s1").await.unwrap().unwrap().step, 3);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("a", 0, 1)).await.unwrap();
        store.save(&checkpoint("b", 0, 1)).await.unwrap();
        assert_eq!(store.sessions().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}

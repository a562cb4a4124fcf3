use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::StateStore;
use crate::workflow::{SessionId, WorkflowSnapshot};
use crate::Result;

/// In-process store. Contents are lost when the store is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<SessionId, WorkflowSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.session_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<WorkflowSnapshot>> {
        Ok(self.snapshots.read().await.get(&session_id).cloned())
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool> {
        Ok(self.snapshots.write().await.remove(&session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        Ok(self.snapshots.read().await.keys().copied().collect())
    }
}

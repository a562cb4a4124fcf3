//! Durable storage for workflow snapshots.
//!
//! The orchestrator mirrors every snapshot mutation through a [`StateStore`].
//! Writes are last-write-wins per session id. Two implementations ship with
//! the crate: [`MemoryStore`] for tests and embedding, and [`FileStore`],
//! which keeps one JSON document per session on disk.

mod file;
mod memory;

pub use file::{FileStore, SNAPSHOT_VERSION};
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::workflow::{SessionId, WorkflowSnapshot};
use crate::Result;

/// Storage backend for workflow snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Write the snapshot, replacing any earlier copy for the same session.
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()>;

    /// Read a snapshot; `None` if the session was never saved or was deleted.
    async fn load(&self, session_id: SessionId) -> Result<Option<WorkflowSnapshot>>;

    /// Remove a snapshot. Returns false if there was nothing to remove.
    async fn delete(&self, session_id: SessionId) -> Result<bool>;

    /// Ids of every stored session, in no particular order.
    async fn list(&self) -> Result<Vec<SessionId>>;

    /// Load every stored snapshot, oldest first.
    ///
    /// Snapshots that fail to load are logged and skipped.
    async fn load_all(&self) -> Result<Vec<WorkflowSnapshot>> {
        let mut snapshots = Vec::new();
        for id in self.list().await? {
            match self.load(id).await {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }
}

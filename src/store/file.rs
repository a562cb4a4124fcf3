use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::StateStore;
use crate::config::EngineConfig;
use crate::workflow::{SessionId, WorkflowSnapshot};
use crate::{Error, Result};

/// Envelope format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    snapshot: &'a WorkflowSnapshot,
}

#[derive(Deserialize)]
struct Envelope {
    snapshot: WorkflowSnapshot,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Store keeping one `<session-id>.json` file per session in a directory.
///
/// Each write goes to a temporary file that is then renamed over the
/// previous copy, so a reader never sees a partially written snapshot.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the configured sessions directory.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(config.sessions_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    fn decode(path: &Path, contents: &str) -> Result<WorkflowSnapshot> {
        let probe: VersionProbe = serde_json::from_str(contents)?;
        if probe.version != SNAPSHOT_VERSION {
            return Err(Error::Persistence(format!(
                "unsupported snapshot version {} in {}",
                probe.version,
                path.display()
            )));
        }
        let envelope: Envelope = serde_json::from_str(contents)?;
        Ok(envelope.snapshot)
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let contents = serde_json::to_string_pretty(&EnvelopeRef {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            snapshot,
        })?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(snapshot.session_id);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        tracing::trace!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<WorkflowSnapshot>> {
        let path = self.path(session_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(&path, &contents).map(Some)
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool> {
        match tokio::fs::remove_file(self.path(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<SessionId>().ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::workflow::Phase;
use crate::{Error, Result};

/// Default delay between scheduling rounds of one session.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Default number of times a failed task is re-scheduled before it is marked Failed.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 3;

/// Default number of save retries before a workflow is failed.
pub const DEFAULT_PERSIST_MAX_RETRIES: u32 = 5;

/// Default number of events kept in the bus history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Engine configuration, loaded from `~/.maestro/maestro.toml`.
///
/// Every field has a default so a partial file (or no file) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between scheduling rounds, in milliseconds.
    pub tick_interval_ms: u64,
    /// Re-schedules allowed per task after retryable failures.
    pub max_task_retries: u32,
    /// Save retries before the workflow is marked Failed.
    pub persist_max_retries: u32,
    /// First backoff delay between save retries, in milliseconds.
    pub persist_backoff_base_ms: u64,
    /// Upper bound on the backoff delay, in milliseconds.
    pub persist_backoff_max_ms: u64,
    /// Number of events retained by the event bus.
    pub history_capacity: usize,
    /// Phases that wait for human sign-off after their tasks finish.
    pub approval_phases: Vec<Phase>,
    /// Where the file store keeps session snapshots.
    pub state_dir: Option<String>,
    /// Per-worker overrides of the declared instance limit, keyed by worker name.
    pub instance_limits: BTreeMap<String, usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_task_retries: DEFAULT_MAX_TASK_RETRIES,
            persist_max_retries: DEFAULT_PERSIST_MAX_RETRIES,
            persist_backoff_base_ms: 100,
            persist_backoff_max_ms: 5_000,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            approval_phases: vec![Phase::Review],
            state_dir: None,
            instance_limits: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.log"))
    }

    /// Directory holding persisted session snapshots.
    pub fn sessions_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::maestro_dir()?.join("sessions")),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn requires_approval(&self, phase: Phase) -> bool {
        self.approval_phases.contains(&phase)
    }

    /// Instance limit for a worker, honoring configured overrides.
    pub fn instance_limit(&self, worker: &str, declared: usize) -> usize {
        self.instance_limits.get(worker).copied().unwrap_or(declared)
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_task_retries(mut self, retries: u32) -> Self {
        self.max_task_retries = retries;
        self
    }

    pub fn with_approval_phases(mut self, phases: Vec<Phase>) -> Self {
        self.approval_phases = phases;
        self
    }

    pub fn with_persist_retries(mut self, retries: u32, base: Duration) -> Self {
        self.persist_max_retries = retries;
        self.persist_backoff_base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        tracing::debug!(path = %path.display(), "loading engine config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        tracing::debug!(?config, "engine config loaded");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::maestro_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "engine config saved");
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

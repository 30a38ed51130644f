use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Sqlite,
}

impl QueueBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub approval: ApprovalSettings,
    #[serde(default)]
    pub runs: RunSettings,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    #[serde(default = "default_reclaim_interval_seconds")]
    pub reclaim_interval_seconds: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            capacity: default_queue_capacity(),
            sqlite_path: None,
            lock_timeout_seconds: default_lock_timeout_seconds(),
            reclaim_interval_seconds: default_reclaim_interval_seconds(),
        }
    }
}

impl QueueSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_min_poll_ms")]
    pub min_poll_ms: u64,
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            min_poll_ms: default_min_poll_ms(),
            max_poll_ms: default_max_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApprovalSettings {
    #[serde(default = "default_true")]
    pub allow_requester: bool,
    #[serde(default)]
    pub approvers: BTreeSet<String>,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            allow_requester: true,
            approvers: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunSettings {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl RunSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobDefinition {
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Settings(
                "`queue.capacity` must be greater than zero".to_string(),
            ));
        }
        if self.queue.lock_timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "`queue.lock_timeout_seconds` must be greater than zero".to_string(),
            ));
        }
        if self.queue.reclaim_interval_seconds == 0 {
            return Err(ConfigError::Settings(
                "`queue.reclaim_interval_seconds` must be greater than zero".to_string(),
            ));
        }
        if self.queue.backend == QueueBackend::Sqlite && self.queue.sqlite_path.is_none() {
            return Err(ConfigError::Settings(
                "`queue.sqlite_path` is required when `queue.backend` is `sqlite`".to_string(),
            ));
        }

        if self.workers.count == 0 {
            return Err(ConfigError::Settings(
                "`workers.count` must be greater than zero".to_string(),
            ));
        }
        if self.workers.min_poll_ms == 0 || self.workers.min_poll_ms > self.workers.max_poll_ms {
            return Err(ConfigError::Settings(
                "`workers.min_poll_ms` must be positive and not exceed `workers.max_poll_ms`"
                    .to_string(),
            ));
        }

        if !self.approval.allow_requester && self.approval.approvers.is_empty() {
            return Err(ConfigError::Settings(
                "`approval` must allow the requester or list at least one approver".to_string(),
            ));
        }
        if self.approval.approvers.iter().any(|a| a.trim().is_empty()) {
            return Err(ConfigError::Settings(
                "`approval.approvers` entries must be non-empty".to_string(),
            ));
        }

        if self.runs.timeout_seconds == Some(0) {
            return Err(ConfigError::Settings(
                "`runs.timeout_seconds` must be greater than zero when set".to_string(),
            ));
        }

        for (key, job) in &self.jobs {
            if key.trim().is_empty() || key.chars().any(char::is_whitespace) {
                return Err(ConfigError::Settings(format!(
                    "job key `{key}` must be a single non-empty token"
                )));
            }
            if job
                .command
                .first()
                .map(|program| program.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::Settings(format!(
                    "job `{key}` must declare a non-empty `command`"
                )));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    64
}

fn default_lock_timeout_seconds() -> u64 {
    300
}

fn default_reclaim_interval_seconds() -> u64 {
    30
}

fn default_worker_count() -> usize {
    4
}

fn default_min_poll_ms() -> u64 {
    100
}

fn default_max_poll_ms() -> u64 {
    1000
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::registry::WorkerKind;
use crate::{mlog_debug, Result};

/// Name of the per-repository state directory.
pub const STATE_DIR_NAME: &str = ".maestro";

/// Default command used to run a task step.
pub const DEFAULT_COMMAND: &str = "claude -p";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub command: Option<String>,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub locks: LockSection,
    #[serde(default)]
    pub workspaces: WorkspaceSection,
    #[serde(default)]
    pub workers: WorkerSection,
    #[serde(default)]
    pub convergence: ConvergenceSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub concurrency: usize,
    pub task_timeout_secs: u64,
    pub max_task_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub worker_grace_period_secs: u64,
    pub supervision_interval_ms: u64,
    /// How long an interrupted executor gets to wind down after its
    /// cancellation token fires.
    pub cancel_grace_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            concurrency: 4,
            task_timeout_secs: 1800,
            max_task_retries: 3,
            retry_backoff_ms: 250,
            max_retry_backoff_ms: 5000,
            worker_grace_period_secs: 300,
            supervision_interval_ms: 1000,
            cancel_grace_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub ttl_secs: u64,
    pub critical_paths: Vec<String>,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            critical_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSection {
    pub worktree_dir: Option<String>,
    pub base_branch: Option<String>,
    pub preserve_failed: bool,
    pub ttl_secs: u64,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            worktree_dir: None,
            base_branch: None,
            preserve_failed: true,
            ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats: u32,
    pub eviction_after_secs: u64,
    pub pool: Vec<WorkerEntry>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            missed_heartbeats: 3,
            eviction_after_secs: 3600,
            pool: Vec::new(),
        }
    }
}

impl WorkerSection {
    /// Time without a heartbeat after which a worker is considered offline.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * u64::from(self.missed_heartbeats.max(1)))
    }
}

/// A statically configured worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub id: String,
    #[serde(default = "default_worker_kind")]
    pub kind: WorkerKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

fn default_worker_kind() -> WorkerKind {
    WorkerKind::Automated
}

fn default_max_concurrent_tasks() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceSection {
    pub max_iterations: u32,
    pub convergence_window: u32,
    /// Stop a goal early after this many strictly worsening scores. Off
    /// unless configured.
    pub divergence_window: Option<usize>,
}

impl Default for ConvergenceSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            convergence_window: 2,
            divergence_window: None,
        }
    }
}

impl Config {
    pub fn state_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(STATE_DIR_NAME)
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        Self::state_dir(repo_root).join("maestro.toml")
    }

    pub fn locks_dir(repo_root: &Path) -> PathBuf {
        Self::state_dir(repo_root).join("locks")
    }

    pub fn reports_dir(repo_root: &Path) -> PathBuf {
        Self::state_dir(repo_root).join("reports")
    }

    pub fn worktrees_dir(&self, repo_root: &Path) -> PathBuf {
        match &self.workspaces.worktree_dir {
            Some(dir) => expand_tilde(dir),
            None => Self::state_dir(repo_root).join("worktrees"),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = Self::config_path(repo_root);
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        mlog_debug!(
            "Config loaded: concurrency={}, critical_paths={:?}, command={:?}",
            config.orchestrator.concurrency,
            config.locks.critical_paths,
            config.command
        );
        Ok(config)
    }

    pub fn save(&self, repo_root: &Path) -> Result<()> {
        let state_dir = Self::state_dir(repo_root);
        if !state_dir.exists() {
            fs::create_dir_all(&state_dir)?;
        }
        let path = Self::config_path(repo_root);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self, repo_root: &Path) -> Result<()> {
        for dir in [
            Self::state_dir(repo_root),
            Self::locks_dir(repo_root),
            Self::reports_dir(repo_root),
            self.worktrees_dir(repo_root),
        ] {
            if !dir.exists() {
                mlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
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

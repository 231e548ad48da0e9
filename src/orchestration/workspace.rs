//! Isolated workspaces, one exclusive checkout per in-flight task.
//!
//! Branch names and workspace locations are pure functions of the task id,
//! so a second live workspace for the same task is detectable: `provision`
//! refuses it with [`Error::WorkspaceConflict`]. That refusal is the
//! duplicate-execution guard and is never retried.
//!
//! Merges into the base branch are serialized by a per-manager mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::git::{GitOps, MergeResult};
use crate::util::{blocking, chrono_duration};
use crate::{mlog_debug, mlog_warn};

/// Deterministic branch name for a task.
pub fn branch_name_for(task: &TaskId) -> String {
    format!("maestro/task/{}", task.slug())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch_name: String,
    /// Branch the work is merged back into.
    pub base_branch: String,
    /// Commit the workspace was created from.
    pub base_commit: String,
    pub created_at: DateTime<Utc>,
    /// Set once the workspace is kept for inspection; `None` while active.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Workspace {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The task's work landed on the base branch.
    Merged { commit: String },
    /// The task produced no changes.
    NothingToMerge,
}

#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Create a fresh workspace for `task` from `from_ref` (the base branch
    /// when `None`).
    async fn provision(&self, task: &TaskId, from_ref: Option<&str>) -> Result<Workspace>;

    /// Commit the workspace and merge it into its base branch. A conflict
    /// fails with the retryable [`Error::MergeConflict`] and leaves the base
    /// untouched.
    async fn commit_and_merge(&self, task: &TaskId, message: &str) -> Result<MergeOutcome>;

    /// Remove the workspace. Destroying an unknown task is a no-op.
    async fn destroy(&self, task: &TaskId) -> Result<()>;

    /// Keep a failed task's workspace around for `ttl`.
    async fn preserve(&self, task: &TaskId, ttl: Duration) -> Result<()>;

    async fn get(&self, task: &TaskId) -> Option<Workspace>;

    async fn live(&self) -> Vec<Workspace>;
}

/// Checks the duplicate guard against an existing entry. Expired preserved
/// workspaces are handed back to the caller for cleanup.
fn check_existing(
    existing: Option<&Workspace>,
    task: &TaskId,
    now: DateTime<Utc>,
) -> Result<Option<Workspace>> {
    match existing {
        Some(ws) if ws.is_expired_at(now) => Ok(Some(ws.clone())),
        Some(ws) => Err(Error::WorkspaceConflict {
            task: task.clone(),
            path: ws.path.display().to_string(),
        }),
        None => Ok(None),
    }
}

/// Workspace manager that never touches disk. Used for dry runs and tests;
/// merge conflicts can be scripted per task.
pub struct InMemoryWorkspaceManager {
    root: PathBuf,
    base_branch: String,
    workspaces: Mutex<HashMap<TaskId, Workspace>>,
    merge_lock: Mutex<()>,
    merged: Mutex<Vec<TaskId>>,
    destroyed: Mutex<Vec<TaskId>>,
    scripted_conflicts: Mutex<HashMap<TaskId, u32>>,
    merge_delay: Duration,
    merging: AtomicBool,
    overlapping_merges: AtomicUsize,
    peak_live: AtomicUsize,
    generation: AtomicUsize,
}

impl Default for InMemoryWorkspaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkspaceManager {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/virtual/workspaces"),
            base_branch: "main".to_string(),
            workspaces: Mutex::new(HashMap::new()),
            merge_lock: Mutex::new(()),
            merged: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            scripted_conflicts: Mutex::new(HashMap::new()),
            merge_delay: Duration::ZERO,
            merging: AtomicBool::new(false),
            overlapping_merges: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    /// Hold the merge mutex for `delay` on every merge.
    pub fn with_merge_delay(mut self, delay: Duration) -> Self {
        self.merge_delay = delay;
        self
    }

    /// Make the next `times` merges of `task` conflict.
    pub async fn simulate_conflicts(&self, task: &TaskId, times: u32) {
        self.scripted_conflicts
            .lock()
            .await
            .insert(task.clone(), times);
    }

    /// Tasks merged so far, in merge order.
    pub async fn merged(&self) -> Vec<TaskId> {
        self.merged.lock().await.clone()
    }

    pub async fn destroyed(&self) -> Vec<TaskId> {
        self.destroyed.lock().await.clone()
    }

    /// Merges that ran while another merge was in progress.
    pub fn overlapping_merges(&self) -> usize {
        self.overlapping_merges.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live workspaces.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceManager for InMemoryWorkspaceManager {
    async fn provision(&self, task: &TaskId, from_ref: Option<&str>) -> Result<Workspace> {
        let now = Utc::now();
        let mut workspaces = self.workspaces.lock().await;
        if let Some(stale) = check_existing(workspaces.get(task), task, now)? {
            mlog_debug!("Replacing expired workspace {}", stale.path.display());
            workspaces.remove(task);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let workspace = Workspace {
            task_id: task.clone(),
            path: self.root.join(task.slug()),
            branch_name: branch_name_for(task),
            base_branch: from_ref.unwrap_or(&self.base_branch).to_string(),
            base_commit: format!("{:07x}", generation),
            created_at: now,
            expires_at: None,
        };
        workspaces.insert(task.clone(), workspace.clone());
        self.peak_live.fetch_max(workspaces.len(), Ordering::SeqCst);
        mlog_debug!("Provisioned in-memory workspace for {}", task);
        Ok(workspace)
    }

    async fn commit_and_merge(&self, task: &TaskId, _message: &str) -> Result<MergeOutcome> {
        if !self.workspaces.lock().await.contains_key(task) {
            return Err(Error::WorkspaceNotFound(task.clone()));
        }

        let _guard = self.merge_lock.lock().await;
        if self.merging.swap(true, Ordering::SeqCst) {
            self.overlapping_merges.fetch_add(1, Ordering::SeqCst);
        }
        if !self.merge_delay.is_zero() {
            tokio::time::sleep(self.merge_delay).await;
        }

        let conflict = {
            let mut scripted = self.scripted_conflicts.lock().await;
            match scripted.get_mut(task) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let outcome = if conflict {
            Err(Error::MergeConflict {
                task: task.clone(),
                files: vec![format!("{}/conflicted.txt", task.slug())],
            })
        } else {
            let mut merged = self.merged.lock().await;
            merged.push(task.clone());
            Ok(MergeOutcome::Merged {
                commit: format!("{:07x}", merged.len()),
            })
        };
        self.merging.store(false, Ordering::SeqCst);
        outcome
    }

    async fn destroy(&self, task: &TaskId) -> Result<()> {
        if self.workspaces.lock().await.remove(task).is_some() {
            self.destroyed.lock().await.push(task.clone());
            mlog_debug!("Destroyed in-memory workspace for {}", task);
        }
        Ok(())
    }

    async fn preserve(&self, task: &TaskId, ttl: Duration) -> Result<()> {
        let mut workspaces = self.workspaces.lock().await;
        let workspace = workspaces
            .get_mut(task)
            .ok_or_else(|| Error::WorkspaceNotFound(task.clone()))?;
        workspace.expires_at = Some(Utc::now() + chrono_duration(ttl));
        Ok(())
    }

    async fn get(&self, task: &TaskId) -> Option<Workspace> {
        self.workspaces.lock().await.get(task).cloned()
    }

    async fn live(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.workspaces.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        all
    }
}

/// Git worktree backed workspaces.
///
/// Each task gets branch `maestro/task/<slug>` checked out at
/// `<worktree_dir>/<slug>`. Merges happen in memory on the object database;
/// the user's checkout is only refreshed when it sits on the base branch.
pub struct GitWorkspaceManager {
    git: Arc<GitOps>,
    worktree_dir: PathBuf,
    base_branch: String,
    stale_after: Duration,
    workspaces: Mutex<HashMap<TaskId, Workspace>>,
    merge_lock: Mutex<()>,
}

impl GitWorkspaceManager {
    pub fn new(
        repo_root: &Path,
        worktree_dir: PathBuf,
        base_branch: Option<String>,
        stale_after: Duration,
    ) -> Result<Self> {
        let git = GitOps::new(repo_root)?;
        let base_branch = match base_branch {
            Some(branch) => branch,
            None => git.current_branch()?,
        };
        if !git.branch_exists(&base_branch)? {
            return Err(Error::Validation(format!(
                "Base branch {} does not exist",
                base_branch
            )));
        }
        mlog_debug!(
            "GitWorkspaceManager base={} worktrees={}",
            base_branch,
            worktree_dir.display()
        );
        Ok(Self {
            git: Arc::new(git),
            worktree_dir,
            base_branch,
            stale_after,
            workspaces: Mutex::new(HashMap::new()),
            merge_lock: Mutex::new(()),
        })
    }

    pub fn from_config(repo_root: &Path, config: &Config) -> Result<Self> {
        Self::new(
            repo_root,
            config.worktrees_dir(repo_root),
            config.workspaces.base_branch.clone(),
            Duration::from_secs(config.workspaces.ttl_secs),
        )
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// A worktree directory left by an earlier process counts as a live
    /// workspace until it is older than the preservation TTL.
    fn leftover_is_stale(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age >= self.stale_after)
            .unwrap_or(true)
    }

    async fn remove(&self, workspace_path: PathBuf, branch: String) -> Result<()> {
        let git = Arc::clone(&self.git);
        blocking(move || {
            git.remove_worktree(&workspace_path)?;
            git.delete_branch(&branch)
        })
        .await
    }
}

#[async_trait]
impl WorkspaceManager for GitWorkspaceManager {
    async fn provision(&self, task: &TaskId, from_ref: Option<&str>) -> Result<Workspace> {
        let now = Utc::now();
        let path = self.worktree_dir.join(task.slug());
        let branch = branch_name_for(task);
        let mut workspaces = self.workspaces.lock().await;

        if let Some(stale) = check_existing(workspaces.get(task), task, now)? {
            workspaces.remove(task);
            self.remove(stale.path, stale.branch_name).await?;
        } else if path.exists() {
            if !self.leftover_is_stale(&path) {
                return Err(Error::WorkspaceConflict {
                    task: task.clone(),
                    path: path.display().to_string(),
                });
            }
            mlog_warn!("Removing stale leftover workspace {}", path.display());
            self.remove(path.clone(), branch.clone()).await?;
        }

        let base_branch = from_ref.unwrap_or(&self.base_branch).to_string();
        let git = Arc::clone(&self.git);
        let (b, p, base) = (branch.clone(), path.clone(), base_branch.clone());
        let base_commit = blocking(move || {
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
            git.create_worktree(&b, &p, Some(&base))
        })
        .await?;

        let workspace = Workspace {
            task_id: task.clone(),
            path,
            branch_name: branch,
            base_branch,
            base_commit,
            created_at: now,
            expires_at: None,
        };
        workspaces.insert(task.clone(), workspace.clone());
        mlog_debug!(
            "Provisioned workspace {} on {}",
            workspace.path.display(),
            workspace.branch_name
        );
        Ok(workspace)
    }

    async fn commit_and_merge(&self, task: &TaskId, message: &str) -> Result<MergeOutcome> {
        let workspace = self
            .get(task)
            .await
            .ok_or_else(|| Error::WorkspaceNotFound(task.clone()))?;

        let git = Arc::clone(&self.git);
        let (path, msg) = (workspace.path.clone(), message.to_string());
        blocking(move || git.commit_all(&path, &msg)).await?;

        let _guard = self.merge_lock.lock().await;
        let git = Arc::clone(&self.git);
        let (target, source) = (workspace.base_branch.clone(), workspace.branch_name.clone());
        let msg = format!("Merge {} ({})", workspace.branch_name, message);
        let result = blocking(move || git.merge_branch(&target, &source, &msg)).await?;

        match result {
            MergeResult::UpToDate => Ok(MergeOutcome::NothingToMerge),
            MergeResult::FastForward(commit) | MergeResult::Merged(commit) => {
                mlog_debug!(
                    "Merged {} into {} at {}",
                    workspace.branch_name,
                    workspace.base_branch,
                    commit
                );
                Ok(MergeOutcome::Merged { commit })
            }
            MergeResult::Conflicted(files) => Err(Error::MergeConflict {
                task: task.clone(),
                files,
            }),
        }
    }

    async fn destroy(&self, task: &TaskId) -> Result<()> {
        let removed = self.workspaces.lock().await.remove(task);
        match removed {
            Some(workspace) => self.remove(workspace.path, workspace.branch_name).await,
            None => Ok(()),
        }
    }

    async fn preserve(&self, task: &TaskId, ttl: Duration) -> Result<()> {
        let mut workspaces = self.workspaces.lock().await;
        let workspace = workspaces
            .get_mut(task)
            .ok_or_else(|| Error::WorkspaceNotFound(task.clone()))?;
        workspace.expires_at = Some(Utc::now() + chrono_duration(ttl));
        mlog_debug!(
            "Preserving workspace {} until {:?}",
            workspace.path.display(),
            workspace.expires_at
        );
        Ok(())
    }

    async fn get(&self, task: &TaskId) -> Option<Workspace> {
        self.workspaces.lock().await.get(task).cloned()
    }

    async fn live(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.workspaces.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        all
    }
}

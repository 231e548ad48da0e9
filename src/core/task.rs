//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work dispatched to workers. A [`TaskSpec`]
//! is the shape received from the issue tracker; a [`Task`] is the
//! orchestrator's working copy that tracks status, assignment, and result.

use crate::core::goal::Goal;
use crate::error::ErrorKind;
use crate::orchestration::registry::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Identifier of a task, taken verbatim from the external ticket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> String {
        self.0.chars().take(8).collect()
    }

    /// Filesystem and branch safe form of the id.
    ///
    /// Deterministic, so the same task always maps to the same branch and
    /// workspace directory.
    pub fn slug(&self) -> String {
        let slug: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let slug = slug.trim_matches('-').to_string();
        if slug.is_empty() {
            "task".to_string()
        } else {
            slug
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of work a task represents; selects its execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Issue,
    #[default]
    #[serde(alias = "code_gen")]
    Codegen,
    Review,
    Test,
    Deploy,
    Coordinator,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Issue => write!(f, "issue"),
            TaskKind::Codegen => write!(f, "codegen"),
            TaskKind::Review => write!(f, "review"),
            TaskKind::Test => write!(f, "test"),
            TaskKind::Deploy => write!(f, "deploy"),
            TaskKind::Coordinator => write!(f, "coordinator"),
        }
    }
}

/// Dispatch priority within a level. Declared highest first so the derived
/// ordering sorts `Critical` before `Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting to be dispatched.
    #[default]
    Pending,
    /// Locks and a worker have been secured; workspace being provisioned.
    Claimed,
    /// The execution step is running.
    Running,
    /// Task completed and its work was merged.
    Completed,
    /// Task failed.
    Failed {
        /// Classification of the failure.
        kind: ErrorKind,
        /// Error message describing the failure.
        error: String,
    },
    /// Never dispatched because a dependency did not complete.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
    /// Stopped by a cancellation request or deadline.
    Cancelled {
        /// Why the task was cancelled.
        reason: String,
    },
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
            TaskStatus::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed { .. }
                | TaskStatus::Blocked { .. }
                | TaskStatus::Cancelled { .. }
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { kind, error } => write!(f, "failed ({}): {}", kind, error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            TaskStatus::Cancelled { reason } => write!(f, "cancelled: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// A task as delivered by the external ticket collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub title: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default, alias = "affectedPaths")]
    pub affected_paths: Vec<String>,
    #[serde(default, alias = "requiredCapabilities")]
    pub required_capabilities: Vec<String>,
    #[serde(default, alias = "estimatedDurationSecs")]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub goal: Option<Goal>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, title: &str) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.to_string(),
            kind: TaskKind::default(),
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            affected_paths: Vec::new(),
            required_capabilities: Vec::new(),
            estimated_duration_secs: None,
            goal: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|id| TaskId::from(*id)).collect();
        self
    }

    pub fn touching(mut self, paths: &[&str]) -> Self {
        self.affected_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn requiring(mut self, capabilities: &[&str]) -> Self {
        self.required_capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_goal(mut self, goal: Goal) -> Self {
        self.goal = Some(goal);
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Load a batch of task specs from a JSON file (an array of tasks).
    pub fn load_batch(path: &Path) -> crate::Result<Vec<TaskSpec>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub dependencies: Vec<TaskId>,
    pub affected_paths: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub estimated_duration_secs: Option<u64>,
    pub goal: Option<Goal>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub status: TaskStatus,
    pub assigned_worker: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            title: spec.title,
            kind: spec.kind,
            priority: spec.priority,
            dependencies: spec.dependencies,
            affected_paths: spec.affected_paths,
            required_capabilities: spec.required_capabilities,
            estimated_duration_secs: spec.estimated_duration_secs,
            goal: spec.goal,
            metadata: spec.metadata,
            status: TaskStatus::Pending,
            assigned_worker: None,
            started_at: None,
            completed_at: None,
        }
    }
}

impl Task {
    pub fn claim(&mut self, worker: WorkerId) {
        self.status = TaskStatus::Claimed;
        self.assigned_worker = Some(worker);
    }

    /// Transitions status to Running and records the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, kind: ErrorKind, error: &str) {
        self.status = TaskStatus::Failed {
            kind,
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self, reason: &str) {
        self.status = TaskStatus::Cancelled {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Return the task to the queue, dropping its assignment.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.assigned_worker = None;
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending)
    }
}

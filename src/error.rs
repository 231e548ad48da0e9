use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::TaskId;
use crate::orchestration::locks::LockConflict;
use crate::orchestration::registry::WorkerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Circular dependency among tasks: {}", join_ids(.tasks))]
    CircularDependency { tasks: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Lock conflict for task {task}: {}", describe_conflicts(.conflicts))]
    LockConflict {
        task: TaskId,
        conflicts: Vec<LockConflict>,
    },

    #[error("No eligible worker for task {task} after {waited:?}")]
    WorkerUnavailable { task: TaskId, waited: Duration },

    #[error("Worker {worker} went offline while holding task {task}")]
    WorkerOffline { worker: WorkerId, task: TaskId },

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker already registered: {0}")]
    WorkerExists(WorkerId),

    #[error("Workspace for task {task} already exists at {path}")]
    WorkspaceConflict { task: TaskId, path: String },

    #[error("No workspace for task {0}")]
    WorkspaceNotFound(TaskId),

    #[error("Merge conflict for task {task} in: {}", .files.join(", "))]
    MergeConflict { task: TaskId, files: Vec<String> },

    #[error("Goal {goal} not reached after {iterations} iterations")]
    ConvergenceExhausted { goal: String, iterations: u32 },

    #[error("Goal {goal} stopped improving after {iterations} iterations")]
    ConvergenceDiverging { goal: String, iterations: u32 },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// Stable, serializable discriminant of an [`Error`], used in batch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Git,
    Serialization,
    Validation,
    CircularDependency,
    LockConflict,
    WorkerUnavailable,
    WorkerOffline,
    WorkspaceConflict,
    MergeConflict,
    ConvergenceExhausted,
    ConvergenceDiverging,
    ExecutionFailed,
    Timeout,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Io => "io",
            ErrorKind::Git => "git",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Validation => "validation",
            ErrorKind::CircularDependency => "circular_dependency",
            ErrorKind::LockConflict => "lock_conflict",
            ErrorKind::WorkerUnavailable => "worker_unavailable",
            ErrorKind::WorkerOffline => "worker_offline",
            ErrorKind::WorkspaceConflict => "workspace_conflict",
            ErrorKind::MergeConflict => "merge_conflict",
            ErrorKind::ConvergenceExhausted => "convergence_exhausted",
            ErrorKind::ConvergenceDiverging => "convergence_diverging",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Git(_) => ErrorKind::Git,
            Error::Json(_) | Error::TomlParse(_) | Error::TomlSerialize(_) => {
                ErrorKind::Serialization
            }
            Error::Validation(_)
            | Error::UnknownDependency { .. }
            | Error::DuplicateTask(_)
            | Error::WorkerNotFound(_)
            | Error::WorkerExists(_)
            | Error::WorkspaceNotFound(_) => ErrorKind::Validation,
            Error::CircularDependency { .. } => ErrorKind::CircularDependency,
            Error::LockConflict { .. } => ErrorKind::LockConflict,
            Error::WorkerUnavailable { .. } => ErrorKind::WorkerUnavailable,
            Error::WorkerOffline { .. } => ErrorKind::WorkerOffline,
            Error::WorkspaceConflict { .. } => ErrorKind::WorkspaceConflict,
            Error::MergeConflict { .. } => ErrorKind::MergeConflict,
            Error::ConvergenceExhausted { .. } => ErrorKind::ConvergenceExhausted,
            Error::ConvergenceDiverging { .. } => ErrorKind::ConvergenceDiverging,
            Error::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::TaskJoin(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failing task may be re-queued instead of failing for good.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockConflict { .. }
                | Error::WorkerUnavailable { .. }
                | Error::MergeConflict { .. }
                | Error::WorkerOffline { .. }
        )
    }

    /// Whether the error must be surfaced to a human rather than resolved
    /// automatically.
    pub fn needs_escalation(&self) -> bool {
        matches!(
            self,
            Error::ConvergenceExhausted { .. }
                | Error::ConvergenceDiverging { .. }
                | Error::WorkerUnavailable { .. }
                | Error::WorkspaceConflict { .. }
                | Error::MergeConflict { .. }
        )
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_conflicts(conflicts: &[LockConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} (held by {})", c.path, c.holder))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", Error::Validation("bad".to_string())),
            "Validation error: bad"
        );
        let err = Error::CircularDependency {
            tasks: vec![TaskId::from("A"), TaskId::from("B")],
        };
        assert_eq!(format!("{}", err), "Circular dependency among tasks: A, B");
    }

    #[test]
    fn test_lock_conflict_display_names_holders() {
        let err = Error::LockConflict {
            task: TaskId::from("B"),
            conflicts: vec![LockConflict {
                path: "config.json".to_string(),
                holder: TaskId::from("A"),
            }],
        };
        assert_eq!(
            err.to_string(),
            "Lock conflict for task B: config.json (held by A)"
        );
    }

    #[test]
    fn test_retryable_set() {
        let merge = Error::MergeConflict {
            task: TaskId::from("A"),
            files: vec!["src/lib.rs".to_string()],
        };
        assert!(merge.is_retryable());
        assert_eq!(merge.kind(), ErrorKind::MergeConflict);

        let dup = Error::WorkspaceConflict {
            task: TaskId::from("A"),
            path: "/tmp/a".to_string(),
        };
        assert!(!dup.is_retryable());
        assert!(dup.needs_escalation());

        let cycle = Error::CircularDependency { tasks: vec![] };
        assert!(!cycle.is_retryable());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ConvergenceExhausted).unwrap();
        assert_eq!(json, "\"convergence_exhausted\"");
        assert_eq!(ErrorKind::MergeConflict.to_string(), "merge_conflict");
    }
}

//! Batch reports.
//!
//! Every task of a batch ends up in the report with its terminal state and
//! enough detail (error kind, message, iterations, score) to diagnose a run
//! without re-running it. Reports are written as pretty JSON so they can be
//! read by hand.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{TaskId, TaskStatus};
use crate::error::{ErrorKind, Result};
use crate::mlog_debug;
use crate::orchestration::executor::Artifact;
use crate::orchestration::registry::WorkerId;

/// Task counts by state, emitted after every transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl ProgressCounts {
    pub fn record(&mut self, status: &TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Claimed | TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed { .. } => self.failed += 1,
            TaskStatus::Blocked { .. } => self.blocked += 1,
            TaskStatus::Cancelled { .. } => self.cancelled += 1,
        }
    }

    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a TaskStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.record(status);
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.blocked + self.cancelled
    }
}

impl std::fmt::Display for ProgressCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pending, {} running, {} completed, {} failed, {} blocked, {} cancelled",
            self.pending, self.running, self.completed, self.failed, self.blocked, self.cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub title: String,
    pub level: usize,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Dispatches of this task, including retries and reassignments.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Needs a human: exhausted goals, merge conflicts out of retries,
    /// duplicate workspaces, no eligible worker.
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub levels: Vec<Vec<TaskId>>,
    pub tasks: Vec<TaskReport>,
    pub summary: ProgressCounts,
}

impl BatchReport {
    pub fn task(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == *id)
    }

    pub fn status_of(&self, id: &str) -> Option<&TaskStatus> {
        self.task(&TaskId::from(id)).map(|t| &t.status)
    }

    pub fn all_completed(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Completed))
    }

    pub fn escalations(&self) -> Vec<&TaskReport> {
        self.tasks.iter().filter(|t| t.escalated).collect()
    }

    /// Write `<dir>/<batch_id>.json`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.batch_id));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        mlog_debug!("Batch report written to {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Plain-text rendering for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Batch {}{}",
            self.batch_id,
            if self.dry_run { " (dry run)" } else { "" }
        );
        for (index, level) in self.levels.iter().enumerate() {
            let _ = writeln!(out, "Level {}:", index);
            for id in level {
                let Some(task) = self.task(id) else {
                    continue;
                };
                let mut line = format!("  {:<12} {}", task.task_id.as_str(), task.status);
                if let Some(iterations) = task.iterations {
                    let _ = write!(line, " [{} iteration(s)", iterations);
                    if let Some(score) = task.score {
                        let _ = write!(line, ", score {:.3}", score);
                    }
                    line.push(']');
                }
                if task.attempts > 1 {
                    let _ = write!(line, " ({} attempts)", task.attempts);
                }
                if task.escalated {
                    line.push_str(" ESCALATED");
                }
                let _ = writeln!(out, "{}", line);
            }
        }
        let _ = writeln!(out, "Summary: {}", self.summary);
        out
    }
}

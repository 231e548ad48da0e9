//! Per-task retry bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use crate::core::task::TaskId;
use crate::util::backoff;

/// Counts retries per task and computes their backoff.
///
/// Only retryable terminal failures (merge conflicts, worker-offline
/// reassignments) consume the budget. Deferrals for lock conflicts or a
/// missing worker are tracked separately as attempts and never exhaust it.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
    deferrals: HashMap<TaskId, u32>,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryTracker {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            retries: HashMap::new(),
            deferrals: HashMap::new(),
            max_retries,
            base_backoff,
            max_backoff,
        }
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Record a retry. Returns the delay before the next attempt, or `None`
    /// once the budget is spent.
    pub fn retry(&mut self, task_id: &TaskId) -> Option<Duration> {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        if *count >= self.max_retries {
            return None;
        }
        *count += 1;
        Some(backoff(self.base_backoff, self.max_backoff, *count - 1))
    }

    /// Record a deferral and return its backoff.
    pub fn defer(&mut self, task_id: &TaskId) -> Duration {
        let count = self.deferrals.entry(task_id.clone()).or_insert(0);
        let delay = backoff(self.base_backoff, self.max_backoff, *count);
        *count += 1;
        delay
    }

    pub fn get_deferrals(&self, task_id: &TaskId) -> u32 {
        self.deferrals.get(task_id).copied().unwrap_or(0)
    }

    /// Forget the deferral streak once a task gets dispatched.
    pub fn reset_deferrals(&mut self, task_id: &TaskId) {
        self.deferrals.remove(task_id);
    }
}

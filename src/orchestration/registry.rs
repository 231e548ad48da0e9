//! Worker registry.
//!
//! Tracks the pool of human and automated workers, their capabilities and
//! load, and their liveness. A worker that misses heartbeats for longer than
//! the configured timeout goes offline and its tasks are handed back to the
//! caller for reassignment. Tasks of an unregistered worker are queued and
//! handed out by the next sweep the same way. That recovery path is
//! at-least-once: a task may run twice, so results must be de-duplicated by
//! task id.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::WorkerSection;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::util::chrono_duration;
use crate::{mlog_debug, mlog_warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Human,
    Automated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_tasks: usize,
    pub current_tasks: Vec<TaskId>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: &str, kind: WorkerKind) -> Self {
        Self {
            id: WorkerId::from(id),
            kind,
            capabilities: BTreeSet::new(),
            max_concurrent_tasks: 1,
            current_tasks: Vec::new(),
            status: WorkerStatus::Idle,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn automated(id: &str) -> Self {
        Self::new(id, WorkerKind::Automated)
    }

    pub fn human(id: &str) -> Self {
        Self::new(id, WorkerKind::Human)
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn is_eligible_for(&self, task: &Task) -> bool {
        self.status == WorkerStatus::Idle
            && self.current_tasks.len() < self.max_concurrent_tasks
            && self.has_capabilities(&task.required_capabilities)
    }

    /// Busy exactly when at capacity; offline is sticky until a heartbeat.
    fn refresh_status(&mut self) {
        if self.status == WorkerStatus::Offline {
            return;
        }
        self.status = if self.current_tasks.len() >= self.max_concurrent_tasks {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };
    }
}

/// A task taken away from a worker that went offline or was unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedTask {
    pub task: TaskId,
    pub worker: WorkerId,
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Worker>>,
    /// Tasks of unregistered workers, waiting for the next sweep.
    unregistered: Mutex<Vec<OrphanedTask>>,
    heartbeat_timeout: Duration,
    eviction_after: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration, eviction_after: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            unregistered: Mutex::new(Vec::new()),
            heartbeat_timeout,
            eviction_after,
        }
    }

    pub fn from_config(section: &WorkerSection) -> Self {
        Self::new(
            section.heartbeat_timeout(),
            Duration::from_secs(section.eviction_after_secs),
        )
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub async fn register(&self, mut worker: Worker) -> Result<()> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker.id) {
            return Err(Error::WorkerExists(worker.id));
        }
        worker.last_heartbeat = Utc::now();
        worker.status = WorkerStatus::Idle;
        worker.refresh_status();
        mlog_debug!(
            "Worker registered: {} ({:?}, capabilities={:?}, max={})",
            worker.id,
            worker.kind,
            worker.capabilities,
            worker.max_concurrent_tasks
        );
        workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    /// Remove a worker, returning the tasks it was holding. Those tasks are
    /// also reported as orphans by the next [`Self::sweep_offline`].
    pub async fn unregister(&self, id: &WorkerId) -> Result<Vec<TaskId>> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .remove(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        if !worker.current_tasks.is_empty() {
            mlog_warn!(
                "Worker {} unregistered while holding {:?}; tasks will be reassigned",
                id,
                worker.current_tasks
            );
            self.unregistered
                .lock()
                .await
                .extend(worker.current_tasks.iter().map(|task| OrphanedTask {
                    task: task.clone(),
                    worker: worker.id.clone(),
                }));
        }
        Ok(worker.current_tasks)
    }

    pub async fn heartbeat(&self, id: &WorkerId) -> Result<()> {
        self.heartbeat_at(id, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, id: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        worker.last_heartbeat = now;
        if worker.status == WorkerStatus::Offline {
            mlog_warn!("Worker {} is back online", id);
            worker.status = WorkerStatus::Idle;
        }
        worker.refresh_status();
        Ok(())
    }

    /// Workers that could take `task` right now, least-loaded first, then by id.
    pub async fn find_eligible(&self, task: &Task) -> Vec<Worker> {
        let workers = self.workers.read().await;
        let mut eligible: Vec<Worker> = workers
            .values()
            .filter(|w| w.is_eligible_for(task))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.current_tasks
                .len()
                .cmp(&b.current_tasks.len())
                .then_with(|| a.id.cmp(&b.id))
        });
        eligible
    }

    pub async fn assign(&self, task: &TaskId, worker_id: &WorkerId) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::WorkerNotFound(worker_id.clone()))?;
        if worker.status != WorkerStatus::Idle
            || worker.current_tasks.len() >= worker.max_concurrent_tasks
        {
            return Err(Error::WorkerUnavailable {
                task: task.clone(),
                waited: Duration::ZERO,
            });
        }
        Self::attach(worker, task);
        Ok(())
    }

    /// Pick the best eligible worker and assign `task` to it in one step, so
    /// two dispatchers cannot race for the same free slot.
    pub async fn assign_eligible(&self, task: &Task) -> Option<WorkerId> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .values_mut()
            .filter(|w| w.is_eligible_for(task))
            .min_by(|a, b| {
                a.current_tasks
                    .len()
                    .cmp(&b.current_tasks.len())
                    .then_with(|| a.id.cmp(&b.id))
            })?;
        Self::attach(worker, &task.id);
        Some(worker.id.clone())
    }

    fn attach(worker: &mut Worker, task: &TaskId) {
        if !worker.current_tasks.contains(task) {
            worker.current_tasks.push(task.clone());
        }
        worker.refresh_status();
        mlog_debug!(
            "Task {} assigned to {} ({}/{})",
            task,
            worker.id,
            worker.current_tasks.len(),
            worker.max_concurrent_tasks
        );
    }

    /// Detach `task` from whichever worker holds it.
    pub async fn release(&self, task: &TaskId) -> Option<WorkerId> {
        let mut workers = self.workers.write().await;
        for worker in workers.values_mut() {
            if let Some(pos) = worker.current_tasks.iter().position(|t| t == task) {
                worker.current_tasks.remove(pos);
                worker.refresh_status();
                mlog_debug!("Task {} released from {}", task, worker.id);
                return Some(worker.id.clone());
            }
        }
        None
    }

    pub async fn worker_of(&self, task: &TaskId) -> Option<WorkerId> {
        let workers = self.workers.read().await;
        workers
            .values()
            .find(|w| w.current_tasks.contains(task))
            .map(|w| w.id.clone())
    }

    pub async fn get(&self, id: &WorkerId) -> Option<Worker> {
        self.workers.read().await.get(id).cloned()
    }

    /// All workers sorted by id.
    pub async fn workers(&self) -> Vec<Worker> {
        let workers = self.workers.read().await;
        let mut all: Vec<Worker> = workers.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Whether any live worker has the capabilities, busy or not.
    pub async fn has_capable_worker(&self, required: &[String]) -> bool {
        let workers = self.workers.read().await;
        workers
            .values()
            .any(|w| w.status != WorkerStatus::Offline && w.has_capabilities(required))
    }

    pub async fn sweep_offline(&self) -> Vec<OrphanedTask> {
        self.sweep_offline_at(Utc::now()).await
    }

    /// Mark workers whose heartbeat is overdue as offline and collect their
    /// tasks, together with those left behind by unregistered workers.
    /// Workers offline past the eviction period are dropped.
    pub async fn sweep_offline_at(&self, now: DateTime<Utc>) -> Vec<OrphanedTask> {
        let timeout = chrono_duration(self.heartbeat_timeout);
        let eviction = chrono_duration(self.eviction_after);
        let mut workers = self.workers.write().await;
        let mut orphans: Vec<OrphanedTask> = self.unregistered.lock().await.drain(..).collect();

        for worker in workers.values_mut() {
            if worker.status == WorkerStatus::Offline || now - worker.last_heartbeat <= timeout {
                continue;
            }
            mlog_warn!(
                "Worker {} missed heartbeats since {}; marking offline",
                worker.id,
                worker.last_heartbeat
            );
            worker.status = WorkerStatus::Offline;
            for task in worker.current_tasks.drain(..) {
                mlog_warn!(
                    "Reassigning task {} from offline worker {} (at-least-once execution)",
                    task,
                    worker.id
                );
                orphans.push(OrphanedTask {
                    task,
                    worker: worker.id.clone(),
                });
            }
        }

        workers.retain(|id, w| {
            let evict =
                w.status == WorkerStatus::Offline && now - w.last_heartbeat > timeout + eviction;
            if evict {
                mlog_debug!("Evicting offline worker {}", id);
            }
            !evict
        });

        orphans.sort_by(|a, b| a.task.cmp(&b.task));
        orphans
    }
}

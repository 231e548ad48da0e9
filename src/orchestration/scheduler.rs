//! Level-synchronized orchestrator.
//!
//! [`Orchestrator::execute`] walks the DAG one level at a time. Inside a
//! level it keeps at most `concurrency` attempts in flight in a [`JoinSet`]
//! and dispatches the next queued task as soon as any attempt finishes.
//!
//! A dispatch acquires the task's locks, claims a worker and provisions a
//! workspace, in that order. A task that cannot get its locks or a worker
//! goes into a backoff queue; the loop sleeps on `select!` until an attempt
//! finishes, a deferral comes due, the supervision tick fires or a
//! cancellation arrives.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::dag::TaskDAG;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::orchestration::convergence::{
    ConvergenceController, ConvergenceOutcome, Feedback, IterationRunner,
};
use crate::orchestration::executor::{
    Artifact, ExecutionRequest, ExecutionResult, ExecutorSet, TaskExecutor,
};
use crate::orchestration::locks::ResourceLockManager;
use crate::orchestration::registry::{WorkerId, WorkerRegistry};
use crate::orchestration::retry::RetryTracker;
use crate::orchestration::workspace::{MergeOutcome, Workspace, WorkspaceManager};
use crate::report::{BatchReport, ProgressCounts, TaskReport};
use crate::util::backoff;
use crate::{mlog, mlog_debug, mlog_error, mlog_trace, mlog_warn};

/// Runtime knobs for one orchestrator, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub task_timeout: Duration,
    pub lock_ttl: Duration,
    pub max_task_retries: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// How long a task may wait when no registered worker has its
    /// capabilities before it is escalated.
    pub worker_grace_period: Duration,
    pub supervision_interval: Duration,
    /// How long an interrupted executor may take to wind down after its
    /// cancellation token fires before it is dropped.
    pub cancel_grace: Duration,
    pub preserve_failed: bool,
    pub workspace_ttl: Duration,
    /// Applied to goals that leave their own limits unset.
    pub max_iterations: u32,
    pub convergence_window: u32,
    pub divergence_window: Option<usize>,
    pub reports_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        let orchestrator = &config.orchestrator;
        Self {
            task_timeout: Duration::from_secs(orchestrator.task_timeout_secs),
            lock_ttl: Duration::from_secs(config.locks.ttl_secs),
            max_task_retries: orchestrator.max_task_retries,
            retry_backoff: Duration::from_millis(orchestrator.retry_backoff_ms),
            max_retry_backoff: Duration::from_millis(orchestrator.max_retry_backoff_ms),
            worker_grace_period: Duration::from_secs(orchestrator.worker_grace_period_secs),
            supervision_interval: Duration::from_millis(orchestrator.supervision_interval_ms),
            cancel_grace: Duration::from_millis(orchestrator.cancel_grace_ms),
            preserve_failed: config.workspaces.preserve_failed,
            workspace_ttl: Duration::from_secs(config.workspaces.ttl_secs),
            max_iterations: config.convergence.max_iterations,
            convergence_window: config.convergence.convergence_window,
            divergence_window: config.convergence.divergence_window,
            reports_dir: None,
            dry_run: false,
        }
    }
}

/// Events emitted after every state transition, for external observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    LevelStarted {
        level: usize,
        tasks: Vec<TaskId>,
    },
    LevelFinished {
        level: usize,
    },
    TaskStarted {
        task_id: TaskId,
        worker: WorkerId,
        attempt: u32,
    },
    /// Locks or a worker were not available; the task waits in the backoff
    /// queue.
    TaskDeferred {
        task_id: TaskId,
        reason: String,
    },
    /// A retryable failure sent the task back to the queue.
    TaskRequeued {
        task_id: TaskId,
        reason: String,
        delay: Duration,
    },
    TaskCompleted {
        task_id: TaskId,
        score: Option<f64>,
    },
    TaskFailed {
        task_id: TaskId,
        kind: ErrorKind,
        error: String,
    },
    TaskBlocked {
        task_id: TaskId,
        reason: String,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },
    Progress(ProgressCounts),
    AllComplete(ProgressCounts),
}

/// Cancels tasks of a running (or not yet started) batch.
#[derive(Clone, Default)]
pub struct CancelHandle {
    batch: CancellationToken,
    tasks: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    wake: Arc<Notify>,
}

impl CancelHandle {
    /// Cancel one task. A queued task is marked cancelled when the loop next
    /// looks at it; a running one has its executor signalled, its locks
    /// released and its workspace destroyed without merging.
    pub async fn cancel(&self, task: &TaskId) {
        self.tasks
            .lock()
            .await
            .entry(task.clone())
            .or_insert_with(|| self.batch.child_token())
            .cancel();
        self.wake.notify_one();
    }

    pub fn cancel_all(&self) {
        self.batch.cancel();
        self.wake.notify_one();
    }

    pub fn is_batch_cancelled(&self) -> bool {
        self.batch.is_cancelled()
    }

    async fn token_for(&self, task: &TaskId) -> CancellationToken {
        self.tasks
            .lock()
            .await
            .entry(task.clone())
            .or_insert_with(|| self.batch.child_token())
            .clone()
    }
}

pub struct Orchestrator {
    locks: Arc<ResourceLockManager>,
    workspaces: Arc<dyn WorkspaceManager>,
    workers: Arc<WorkerRegistry>,
    executors: ExecutorSet,
    config: OrchestratorConfig,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(
        locks: Arc<ResourceLockManager>,
        workspaces: Arc<dyn WorkspaceManager>,
        workers: Arc<WorkerRegistry>,
        executors: ExecutorSet,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            locks,
            workspaces,
            workers,
            executors,
            config,
            events: None,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            // Nobody listening is fine.
            let _ = tx.send(event);
        }
    }

    /// Run every task of `dag` and report each one's terminal state.
    ///
    /// Level `k + 1` starts only once every task of level `k` is terminal.
    /// Task-local failures never abort siblings; dependents of a task that
    /// did not complete are marked blocked and never dispatched.
    pub async fn execute(&self, dag: &TaskDAG, concurrency: usize) -> Result<BatchReport> {
        let started_at = Utc::now();
        let batch_id = batch_id(started_at);
        let concurrency = concurrency.max(1);
        mlog!(
            "Batch {} starting: {} tasks in {} levels, concurrency {}{}",
            batch_id,
            dag.task_count(),
            dag.levels().len(),
            concurrency,
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        let mut run = BatchRun::new(self, dag).await;
        if self.config.dry_run {
            return Ok(run.report(batch_id, started_at, true));
        }

        for (level, ids) in dag.levels().iter().enumerate() {
            run.run_level(level, ids, concurrency).await;
        }
        run.fail_stragglers();

        let report = run.report(batch_id, started_at, false);
        mlog!("Batch {} finished: {}", report.batch_id, report.summary);
        for escalation in report.escalations() {
            mlog_warn!(
                "Task {} needs attention: {}",
                escalation.task_id,
                escalation.message.as_deref().unwrap_or("no detail")
            );
        }
        if let Some(dir) = &self.config.reports_dir {
            if let Err(e) = report.save(dir) {
                mlog_warn!("Failed to write batch report to {}: {}", dir.display(), e);
            }
        }
        self.emit(SchedulerEvent::AllComplete(report.summary));
        Ok(report)
    }
}

fn batch_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Per-task bookkeeping for one batch.
struct TaskRecord {
    task: Task,
    level: usize,
    token: CancellationToken,
    attempts: u32,
    error_kind: Option<ErrorKind>,
    message: Option<String>,
    score: Option<f64>,
    iterations: Option<u32>,
    worker: Option<WorkerId>,
    branch: Option<String>,
    escalated: bool,
    summary: Option<String>,
    artifacts: Vec<Artifact>,
    first_started_at: Option<DateTime<Utc>>,
    /// Set while no registered worker can take the task.
    waiting_since: Option<Instant>,
}

impl TaskRecord {
    fn new(task: Task, level: usize, token: CancellationToken) -> Self {
        Self {
            task,
            level,
            token,
            attempts: 0,
            error_kind: None,
            message: None,
            score: None,
            iterations: None,
            worker: None,
            branch: None,
            escalated: false,
            summary: None,
            artifacts: Vec::new(),
            first_started_at: None,
            waiting_since: None,
        }
    }

    fn to_report(&self) -> TaskReport {
        let finished_at = self.task.completed_at;
        let duration_ms = match (self.first_started_at, finished_at) {
            (Some(start), Some(end)) => u64::try_from((end - start).num_milliseconds()).ok(),
            _ => None,
        };
        TaskReport {
            task_id: self.task.id.clone(),
            title: self.task.title.clone(),
            level: self.level,
            status: self.task.status.clone(),
            error_kind: self.error_kind,
            message: self.message.clone(),
            started_at: self.first_started_at,
            finished_at,
            duration_ms,
            score: self.score,
            iterations: self.iterations,
            attempts: self.attempts,
            worker: self.worker.clone(),
            branch: self.branch.clone(),
            escalated: self.escalated,
            summary: self.summary.clone(),
            artifacts: self.artifacts.clone(),
        }
    }
}

/// Why a task sits in the backoff queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    /// Locks or a worker; retried early whenever an attempt finishes.
    Resources,
    /// Requeued after a retryable failure; honours its full backoff.
    Retry,
}

struct Deferral {
    not_before: Instant,
    task: TaskId,
    wait: Wait,
}

enum Dispatch {
    Started(Box<Attempt>),
    Deferred(Duration),
    Finished,
}

struct BatchRun<'a> {
    orch: &'a Orchestrator,
    dag: &'a TaskDAG,
    records: HashMap<TaskId, TaskRecord>,
    retries: RetryTracker,
}

impl<'a> BatchRun<'a> {
    async fn new(orch: &'a Orchestrator, dag: &'a TaskDAG) -> BatchRun<'a> {
        let mut records = HashMap::with_capacity(dag.task_count());
        for task in dag.tasks() {
            let level = dag.level_of(&task.id).unwrap_or(0);
            let token = orch.cancel.token_for(&task.id).await;
            records.insert(task.id.clone(), TaskRecord::new(task.clone(), level, token));
        }
        let config = &orch.config;
        Self {
            orch,
            dag,
            records,
            retries: RetryTracker::new(
                config.max_task_retries,
                config.retry_backoff,
                config.max_retry_backoff,
            ),
        }
    }

    async fn run_level(&mut self, level: usize, ids: &[TaskId], concurrency: usize) {
        let orch = self.orch;
        mlog!("Level {} started with {} task(s)", level, ids.len());
        orch.emit(SchedulerEvent::LevelStarted {
            level,
            tasks: ids.to_vec(),
        });

        // Stable sort keeps input order within a priority.
        let mut ordered = ids.to_vec();
        ordered.sort_by_key(|id| self.records.get(id).map(|r| r.task.priority));

        let mut queue = VecDeque::new();
        for id in ordered {
            if self.is_cancelled(&id) {
                let reason = self.cancel_reason();
                self.mark_cancelled(&id, reason, ErrorKind::Cancelled);
            } else if let Some(reason) = self.blocking_reason(&id) {
                self.block(&id, &reason);
            } else {
                queue.push_back(id);
            }
        }

        let mut deferred: Vec<Deferral> = Vec::new();
        let mut in_flight: JoinSet<AttemptOutcome> = JoinSet::new();
        let mut spawned: HashMap<task::Id, TaskId> = HashMap::new();
        let mut running: HashMap<TaskId, Running> = HashMap::new();
        let period = orch.config.supervision_interval.max(Duration::from_millis(1));
        let mut supervision = interval_at(Instant::now() + period, period);
        supervision.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.sweep_cancelled(&mut queue, &mut deferred);

            let now = Instant::now();
            let mut waiting = Vec::with_capacity(deferred.len());
            for deferral in deferred.drain(..) {
                if deferral.not_before <= now {
                    queue.push_back(deferral.task);
                } else {
                    waiting.push(deferral);
                }
            }
            deferred = waiting;

            while in_flight.len() < concurrency {
                let Some(id) = queue.pop_front() else {
                    break;
                };
                match self.dispatch(&id).await {
                    Dispatch::Started(attempt) => {
                        running.insert(
                            id.clone(),
                            Running {
                                worker: attempt.worker.clone(),
                                token: attempt.attempt_token.clone(),
                            },
                        );
                        let handle = spawn_attempt(&mut in_flight, *attempt);
                        spawned.insert(handle.id(), id);
                    }
                    Dispatch::Deferred(delay) => deferred.push(Deferral {
                        not_before: Instant::now() + delay,
                        task: id,
                        wait: Wait::Resources,
                    }),
                    Dispatch::Finished => {}
                }
            }

            if in_flight.is_empty() && queue.is_empty() && deferred.is_empty() {
                break;
            }

            let next_due = deferred.iter().map(|d| d.not_before).min();
            tokio::select! {
                Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    if let Some((task, delay)) = self.joined(joined, &mut spawned, &mut running).await {
                        deferred.push(Deferral {
                            not_before: Instant::now() + delay,
                            task,
                            wait: Wait::Retry,
                        });
                    }
                    // Freed locks and workers may unblock waiting tasks.
                    let now = Instant::now();
                    for deferral in deferred.iter_mut().filter(|d| d.wait == Wait::Resources) {
                        deferral.not_before = deferral.not_before.min(now);
                    }
                }
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
                _ = supervision.tick() => self.supervise(&running).await,
                _ = orch.cancel.wake.notified() => {}
            }
        }

        mlog!(
            "Level {} finished: {}",
            level,
            ProgressCounts::from_statuses(
                ids.iter().filter_map(|id| self.records.get(id)).map(|r| &r.task.status)
            )
        );
        orch.emit(SchedulerEvent::LevelFinished { level });
    }

    async fn dispatch(&mut self, id: &TaskId) -> Dispatch {
        let orch = self.orch;
        let Some(task) = self.records.get(id).map(|r| r.task.clone()) else {
            return Dispatch::Finished;
        };

        let grant = orch
            .locks
            .try_acquire(id, &task.affected_paths, orch.config.lock_ttl)
            .await;
        if !grant.granted {
            let reason = Error::LockConflict {
                task: id.clone(),
                conflicts: grant.conflicts,
            }
            .to_string();
            return self.defer(id, reason);
        }

        let Some(worker) = orch.workers.assign_eligible(&task).await else {
            orch.locks.release(id).await;
            if orch.workers.has_capable_worker(&task.required_capabilities).await {
                // Capable workers exist but are busy; keep waiting.
                if let Some(record) = self.records.get_mut(id) {
                    record.waiting_since = None;
                }
                return self.defer(id, "all capable workers are busy".to_string());
            }
            let waited = self
                .records
                .get_mut(id)
                .map(|r| r.waiting_since.get_or_insert_with(Instant::now).elapsed())
                .unwrap_or_default();
            if waited >= orch.config.worker_grace_period {
                let err = Error::WorkerUnavailable {
                    task: id.clone(),
                    waited,
                };
                self.fail(id, &err, true);
                return Dispatch::Finished;
            }
            return self.defer(id, "no eligible worker".to_string());
        };

        let workspace = match orch.workspaces.provision(id, None).await {
            Ok(workspace) => workspace,
            Err(e) => {
                orch.locks.release(id).await;
                orch.workers.release(id).await;
                if matches!(e, Error::WorkspaceConflict { .. }) {
                    mlog_error!("Refusing to run task {} twice: {}", id, e);
                }
                let escalate = e.needs_escalation();
                self.fail(id, &e, escalate);
                return Dispatch::Finished;
            }
        };

        self.retries.reset_deferrals(id);
        let Some(record) = self.records.get_mut(id) else {
            return Dispatch::Finished;
        };
        record.waiting_since = None;
        record.attempts += 1;
        record.worker = Some(worker.clone());
        record.branch = Some(workspace.branch_name.clone());
        record.task.claim(worker.clone());
        record.task.start();
        record.first_started_at.get_or_insert_with(Utc::now);
        let attempt = record.attempts;
        let task_token = record.token.clone();
        let attempt_token = task_token.child_token();
        let task = record.task.clone();

        mlog_debug!("Task {} -> running on {} (attempt {})", id, worker, attempt);
        orch.emit(SchedulerEvent::TaskStarted {
            task_id: id.clone(),
            worker: worker.clone(),
            attempt,
        });
        self.emit_progress();

        let config = &orch.config;
        Dispatch::Started(Box::new(Attempt {
            executor: orch.executors.for_kind(task.kind),
            locks: Arc::clone(&orch.locks),
            workspaces: Arc::clone(&orch.workspaces),
            task,
            workspace,
            worker,
            task_token,
            attempt_token,
            deadline: deadline_after(config.task_timeout),
            cancel_grace: config.cancel_grace,
            lock_ttl: config.lock_ttl,
            retry_backoff: config.retry_backoff,
            max_retry_backoff: config.max_retry_backoff,
            max_iterations: config.max_iterations,
            convergence_window: config.convergence_window,
            divergence_window: config.divergence_window,
        }))
    }

    /// Settle one joined attempt. Returns the task and its delay when it
    /// goes back into the queue.
    async fn joined(
        &mut self,
        joined: std::result::Result<(task::Id, AttemptOutcome), JoinError>,
        spawned: &mut HashMap<task::Id, TaskId>,
        running: &mut HashMap<TaskId, Running>,
    ) -> Option<(TaskId, Duration)> {
        match joined {
            Ok((handle, outcome)) => {
                spawned.remove(&handle);
                running.remove(&outcome.task_id);
                let task = outcome.task_id.clone();
                self.finish(outcome).await.map(|delay| (task, delay))
            }
            Err(e) => {
                match spawned.remove(&e.id()) {
                    Some(task) => {
                        running.remove(&task);
                        self.abandon(&task, e).await;
                    }
                    None => mlog_error!("Unknown task attempt did not finish cleanly: {}", e),
                }
                None
            }
        }
    }

    /// The attempt's tokio task died without an outcome. Free what it held
    /// and fail the task so the level can still finish.
    async fn abandon(&mut self, id: &TaskId, err: JoinError) {
        mlog_error!("Attempt for task {} did not finish cleanly: {}", id, err);
        self.discard_workspace(id).await;
        self.release(id).await;
        self.fail(id, &Error::TaskJoin(err.to_string()), true);
    }

    fn defer(&mut self, id: &TaskId, reason: String) -> Dispatch {
        let delay = self.retries.defer(id);
        mlog_debug!("Deferring task {} for {:?}: {}", id, delay, reason);
        self.orch.emit(SchedulerEvent::TaskDeferred {
            task_id: id.clone(),
            reason,
        });
        Dispatch::Deferred(delay)
    }

    /// Handle a finished attempt. Returns the delay when the task goes back
    /// into the queue.
    async fn finish(&mut self, outcome: AttemptOutcome) -> Option<Duration> {
        let id = outcome.task_id;
        if let Some(record) = self.records.get_mut(&id) {
            if outcome.score.is_some() {
                record.score = outcome.score;
            }
            if outcome.iterations.is_some() {
                record.iterations = outcome.iterations;
            }
            if let Some(result) = outcome.result {
                record.summary = Some(result.summary).filter(|s| !s.is_empty());
                record.artifacts = result.artifacts;
            }
        }

        match outcome.end {
            AttemptEnd::Completed => {
                self.discard_workspace(&id).await;
                self.release(&id).await;
                if let Some(record) = self.records.get_mut(&id) {
                    record.task.complete();
                }
                mlog_debug!("Task {} -> completed", id);
                self.orch.emit(SchedulerEvent::TaskCompleted {
                    task_id: id.clone(),
                    score: outcome.score,
                });
                self.emit_progress();
                None
            }
            AttemptEnd::Failed(err) => {
                if err.is_retryable() {
                    if let Some(delay) = self.retries.retry(&id) {
                        self.discard_workspace(&id).await;
                        self.release(&id).await;
                        self.requeue(&id, err.to_string(), delay);
                        return Some(delay);
                    }
                }
                self.keep_failed_workspace(&id).await;
                self.release(&id).await;
                let escalate = err.needs_escalation();
                self.fail(&id, &err, escalate);
                None
            }
            AttemptEnd::Cancelled => {
                self.discard_workspace(&id).await;
                self.release(&id).await;
                let reason = self.cancel_reason();
                self.mark_cancelled(&id, reason, ErrorKind::Cancelled);
                None
            }
            AttemptEnd::TimedOut => {
                self.discard_workspace(&id).await;
                self.release(&id).await;
                let timeout = self.orch.config.task_timeout;
                mlog_warn!("Task {}: {}", id, Error::Timeout(timeout));
                let reason = format!("timed out after {:?}", timeout);
                self.mark_cancelled(&id, &reason, ErrorKind::Timeout);
                None
            }
            AttemptEnd::WorkerLost => {
                // Partial work is discarded; the next attempt starts from a
                // fresh workspace.
                self.discard_workspace(&id).await;
                self.release(&id).await;
                let err = Error::WorkerOffline {
                    worker: outcome.worker,
                    task: id.clone(),
                };
                mlog_warn!("{}; partial work discarded, task runs again (at-least-once)", err);
                if let Some(delay) = self.retries.retry(&id) {
                    self.requeue(&id, err.to_string(), delay);
                    return Some(delay);
                }
                self.fail(&id, &err, true);
                None
            }
        }
    }

    async fn supervise(&self, running: &HashMap<TaskId, Running>) {
        for orphan in self.orch.workers.sweep_offline().await {
            // The task may already run again elsewhere.
            let Some(attempt) = running.get(&orphan.task).filter(|r| r.worker == orphan.worker)
            else {
                continue;
            };
            mlog_warn!(
                "Aborting task {}: worker {} is gone",
                orphan.task,
                orphan.worker
            );
            attempt.token.cancel();
        }
        self.orch.locks.reclaim_expired().await;
    }

    async fn release(&self, id: &TaskId) {
        self.orch.locks.release(id).await;
        self.orch.workers.release(id).await;
    }

    async fn discard_workspace(&self, id: &TaskId) {
        if let Err(e) = self.orch.workspaces.destroy(id).await {
            mlog_warn!("Failed to destroy workspace of task {}: {}", id, e);
        }
    }

    async fn keep_failed_workspace(&self, id: &TaskId) {
        let config = &self.orch.config;
        if !config.preserve_failed {
            self.discard_workspace(id).await;
            return;
        }
        if let Err(e) = self.orch.workspaces.preserve(id, config.workspace_ttl).await {
            mlog_warn!("Failed to preserve workspace of task {}: {}", id, e);
            self.discard_workspace(id).await;
        }
    }

    fn sweep_cancelled(&mut self, queue: &mut VecDeque<TaskId>, deferred: &mut Vec<Deferral>) {
        let mut cancelled = Vec::new();
        queue.retain(|id| {
            let hit = self.is_cancelled(id);
            if hit {
                cancelled.push(id.clone());
            }
            !hit
        });
        deferred.retain(|d| {
            let hit = self.is_cancelled(&d.task);
            if hit {
                cancelled.push(d.task.clone());
            }
            !hit
        });
        if cancelled.is_empty() {
            return;
        }
        let reason = self.cancel_reason();
        for id in cancelled {
            self.mark_cancelled(&id, reason, ErrorKind::Cancelled);
        }
    }

    fn is_cancelled(&self, id: &TaskId) -> bool {
        self.records
            .get(id)
            .map(|r| r.token.is_cancelled())
            .unwrap_or(false)
    }

    fn cancel_reason(&self) -> &'static str {
        if self.orch.cancel.is_batch_cancelled() {
            "batch cancelled"
        } else {
            "cancelled by request"
        }
    }

    /// First dependency that did not complete, if any.
    fn blocking_reason(&self, id: &TaskId) -> Option<String> {
        self.dag.dependencies_of(id).into_iter().find_map(|dep| {
            let status = &self.records.get(&dep.id)?.task.status;
            (!matches!(status, TaskStatus::Completed))
                .then(|| format!("dependency {} {}", dep.id, status.label()))
        })
    }

    fn block(&mut self, id: &TaskId, reason: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.task.block(reason);
            record.message = Some(reason.to_string());
        }
        mlog_debug!("Task {} -> blocked ({})", id, reason);
        self.orch.emit(SchedulerEvent::TaskBlocked {
            task_id: id.clone(),
            reason: reason.to_string(),
        });
        self.emit_progress();
    }

    fn mark_cancelled(&mut self, id: &TaskId, reason: &str, kind: ErrorKind) {
        if let Some(record) = self.records.get_mut(id) {
            record.task.cancel(reason);
            record.error_kind = Some(kind);
            record.message = Some(reason.to_string());
        }
        mlog_debug!("Task {} -> cancelled ({})", id, reason);
        self.orch.emit(SchedulerEvent::TaskCancelled {
            task_id: id.clone(),
            reason: reason.to_string(),
        });
        self.emit_progress();
    }

    fn requeue(&mut self, id: &TaskId, reason: String, delay: Duration) {
        if let Some(record) = self.records.get_mut(id) {
            record.task.requeue();
        }
        mlog_debug!("Task {} -> pending, retry in {:?}: {}", id, delay, reason);
        self.orch.emit(SchedulerEvent::TaskRequeued {
            task_id: id.clone(),
            reason,
            delay,
        });
        self.emit_progress();
    }

    fn fail(&mut self, id: &TaskId, err: &Error, escalated: bool) {
        let kind = err.kind();
        let message = err.to_string();
        if let Some(record) = self.records.get_mut(id) {
            record.task.fail(kind, &message);
            record.error_kind = Some(kind);
            record.message = Some(message.clone());
            record.escalated = escalated;
        }
        mlog_debug!("Task {} -> failed ({}): {}", id, kind, message);
        if escalated {
            mlog_warn!("Escalating task {}: {}", id, message);
        }
        self.orch.emit(SchedulerEvent::TaskFailed {
            task_id: id.clone(),
            kind,
            error: message,
        });
        self.emit_progress();
    }

    fn emit_progress(&self) {
        let counts = ProgressCounts::from_statuses(self.records.values().map(|r| &r.task.status));
        mlog_trace!("Progress: {}", counts);
        self.orch.emit(SchedulerEvent::Progress(counts));
    }

    /// Anything still open after the last level is a scheduler bug; surface
    /// it instead of reporting the task as pending.
    fn fail_stragglers(&mut self) {
        for record in self.records.values_mut() {
            if !record.task.is_finished() {
                let message = "task never reached a terminal state";
                mlog_error!("Task {}: {}", record.task.id, message);
                record.task.fail(ErrorKind::Internal, message);
                record.error_kind = Some(ErrorKind::Internal);
                record.message = Some(message.to_string());
            }
        }
    }

    fn report(&self, batch_id: String, started_at: DateTime<Utc>, dry_run: bool) -> BatchReport {
        let tasks: Vec<TaskReport> = self
            .dag
            .tasks()
            .into_iter()
            .filter_map(|task| self.records.get(&task.id))
            .map(TaskRecord::to_report)
            .collect();
        let summary = ProgressCounts::from_statuses(tasks.iter().map(|t| &t.status));
        BatchReport {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            levels: self.dag.levels().to_vec(),
            tasks,
            summary,
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

fn spawn_attempt(in_flight: &mut JoinSet<AttemptOutcome>, attempt: Attempt) -> task::AbortHandle {
    let task_id = attempt.task.id.clone();
    let worker = attempt.worker.clone();
    in_flight.spawn(async move {
        match AssertUnwindSafe(attempt.run()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                mlog_error!("Executor for task {} panicked", task_id);
                AttemptOutcome {
                    task_id,
                    worker,
                    end: AttemptEnd::Failed(Error::ExecutionFailed(
                        "executor panicked".to_string(),
                    )),
                    result: None,
                    score: None,
                    iterations: None,
                }
            }
        }
    })
}

/// A dispatched attempt as seen by the level loop.
struct Running {
    worker: WorkerId,
    token: CancellationToken,
}

enum AttemptEnd {
    Completed,
    Failed(Error),
    /// Cancelled through the [`CancelHandle`].
    Cancelled,
    TimedOut,
    /// The worker went offline mid-task.
    WorkerLost,
}

struct AttemptOutcome {
    task_id: TaskId,
    worker: WorkerId,
    end: AttemptEnd,
    result: Option<ExecutionResult>,
    score: Option<f64>,
    iterations: Option<u32>,
}

/// What the execution step produced before merging.
struct Executed {
    result: ExecutionResult,
    convergence: Option<ConvergenceOutcome>,
}

/// One dispatch of one task, run on its own tokio task.
struct Attempt {
    task: Task,
    workspace: Workspace,
    worker: WorkerId,
    executor: Arc<dyn TaskExecutor>,
    locks: Arc<ResourceLockManager>,
    workspaces: Arc<dyn WorkspaceManager>,
    task_token: CancellationToken,
    /// Child of `task_token`; also cancelled when the worker goes offline
    /// or the deadline passes.
    attempt_token: CancellationToken,
    deadline: Instant,
    cancel_grace: Duration,
    lock_ttl: Duration,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
    max_iterations: u32,
    convergence_window: u32,
    divergence_window: Option<usize>,
}

impl Attempt {
    async fn run(self) -> AttemptOutcome {
        let renewal = tokio::spawn(renew_locks(
            Arc::clone(&self.locks),
            self.task.id.clone(),
            self.lock_ttl,
            self.attempt_token.clone(),
        ));

        let execution = self.execute();
        tokio::pin!(execution);
        let executed = tokio::select! {
            biased;
            _ = self.attempt_token.cancelled() => {
                self.wind_down(execution.as_mut()).await;
                Err(self.interruption())
            }
            _ = sleep_until(self.deadline) => {
                self.attempt_token.cancel();
                self.wind_down(execution.as_mut()).await;
                Err(AttemptEnd::TimedOut)
            }
            executed = &mut execution => executed.map_err(|e| {
                if self.attempt_token.is_cancelled() {
                    self.interruption()
                } else {
                    AttemptEnd::Failed(e)
                }
            }),
        };

        let outcome = match executed {
            Err(end) => self.outcome(end, None, None, None),
            Ok(Executed {
                result,
                convergence,
            }) => {
                let score = convergence.as_ref().and_then(|c| c.score);
                let iterations = convergence.as_ref().map(|c| c.iterations);
                let end = match convergence.map(ConvergenceOutcome::into_result) {
                    Some(Err(e)) => AttemptEnd::Failed(e),
                    _ if !result.success => AttemptEnd::Failed(Error::ExecutionFailed(
                        result
                            .error
                            .clone()
                            .unwrap_or_else(|| "execution reported failure".to_string()),
                    )),
                    _ => self.merge().await,
                };
                self.outcome(end, Some(result), score, iterations)
            }
        };

        renewal.abort();
        outcome
    }

    fn outcome(
        &self,
        end: AttemptEnd,
        result: Option<ExecutionResult>,
        score: Option<f64>,
        iterations: Option<u32>,
    ) -> AttemptOutcome {
        AttemptOutcome {
            task_id: self.task.id.clone(),
            worker: self.worker.clone(),
            end,
            result,
            score,
            iterations,
        }
    }

    /// Give an interrupted execution up to `cancel_grace` to observe its
    /// cancelled token and return before it is dropped.
    async fn wind_down<F: Future>(&self, execution: Pin<&mut F>) {
        if timeout(self.cancel_grace, execution).await.is_err() {
            mlog_warn!(
                "Executor for task {} ignored cancellation for {:?}; dropping it",
                self.task.id,
                self.cancel_grace
            );
        }
    }

    fn interruption(&self) -> AttemptEnd {
        if self.task_token.is_cancelled() {
            AttemptEnd::Cancelled
        } else {
            AttemptEnd::WorkerLost
        }
    }

    async fn execute(&self) -> Result<Executed> {
        let Some(goal) = &self.task.goal else {
            let result = self.executor.execute(self.request(1, None)).await?;
            return Ok(Executed {
                result,
                convergence: None,
            });
        };

        let mut goal = goal.clone();
        goal.apply_defaults(self.max_iterations, self.convergence_window);
        let controller =
            ConvergenceController::new(goal)?.with_divergence_window(self.divergence_window);
        let mut runner = TaskIterationRunner { attempt: self };
        let outcome = controller.run(&mut runner).await?;
        if outcome.converged() {
            // Iterations drop their locks; the merge needs them back.
            self.acquire_locks().await?;
        }
        Ok(Executed {
            result: outcome.last_result.clone().unwrap_or_default(),
            convergence: Some(outcome),
        })
    }

    /// Merge while the locks are still held.
    async fn merge(&self) -> AttemptEnd {
        let message = format!("{}: {}", self.task.id, self.task.title);
        match self.workspaces.commit_and_merge(&self.task.id, &message).await {
            Ok(MergeOutcome::Merged { commit }) => {
                mlog_debug!("Task {} merged as {}", self.task.id, commit);
                AttemptEnd::Completed
            }
            Ok(MergeOutcome::NothingToMerge) => {
                mlog_debug!("Task {} produced no changes", self.task.id);
                AttemptEnd::Completed
            }
            Err(e) => AttemptEnd::Failed(e),
        }
    }

    fn request(&self, iteration: u32, feedback: Option<Feedback>) -> ExecutionRequest {
        ExecutionRequest {
            task: self.task.clone(),
            workspace: self.workspace.clone(),
            worker: self.worker.clone(),
            iteration,
            feedback,
            cancel: self.attempt_token.clone(),
        }
    }

    /// Wait (with backoff) until the task's full lock set is granted.
    async fn acquire_locks(&self) -> Result<()> {
        let mut waits = 0;
        loop {
            let grant = self
                .locks
                .try_acquire(&self.task.id, &self.task.affected_paths, self.lock_ttl)
                .await;
            if grant.granted {
                return Ok(());
            }
            let delay = backoff(self.retry_backoff, self.max_retry_backoff, waits);
            waits = waits.saturating_add(1);
            mlog_debug!(
                "Task {} waiting {:?} to re-acquire its locks",
                self.task.id,
                delay
            );
            tokio::select! {
                _ = self.attempt_token.cancelled() => {
                    return Err(Error::Cancelled(format!(
                        "task {} cancelled while waiting for locks",
                        self.task.id
                    )));
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

/// Runs goal iterations for an [`Attempt`], re-acquiring the task's locks
/// for every iteration after the first.
struct TaskIterationRunner<'a> {
    attempt: &'a Attempt,
}

#[async_trait]
impl<'a> IterationRunner for TaskIterationRunner<'a> {
    async fn run_iteration(
        &mut self,
        iteration: u32,
        feedback: Option<&Feedback>,
    ) -> Result<ExecutionResult> {
        let attempt = self.attempt;
        if iteration > 1 {
            attempt.acquire_locks().await?;
        }
        let result = attempt
            .executor
            .execute(attempt.request(iteration, feedback.cloned()))
            .await;
        attempt.locks.release(&attempt.task.id).await;
        result
    }
}

/// Keep the task's locks alive while it runs.
async fn renew_locks(
    locks: Arc<ResourceLockManager>,
    task: TaskId,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let renewed = locks.renew(&task, ttl).await;
                mlog_trace!("Renewed {} lock(s) for task {}", renewed, task);
            }
        }
    }
}

//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted executor that records every call and its timing
//! - An orchestrator harness over the in-memory workspace manager
//! - Predefined task sets

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use maestro::core::{TaskGraphBuilder, TaskId, TaskSpec};
use maestro::orchestration::{
    ExecutionRequest, ExecutionResult, ExecutorSet, Feedback, InMemoryWorkspaceManager,
    Orchestrator, OrchestratorConfig, ResourceLockManager, SchedulerEvent, TaskExecutor, Worker,
    WorkerId, WorkerRegistry,
};
use maestro::{BatchReport, Error};

/// Effectively forever for a test; such calls end only by cancellation.
pub const HANG: Duration = Duration::from_secs(3600);

/// One recorded executor call.
#[derive(Debug, Clone)]
pub struct Call {
    pub task: TaskId,
    pub worker: WorkerId,
    pub iteration: u32,
    pub feedback: Option<Feedback>,
    pub started: Instant,
    pub finished: Instant,
    pub cancelled: bool,
}

impl Call {
    pub fn overlaps(&self, other: &Call) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// Fake execution step.
///
/// Per task it can script a sequence of results and delays; once a script
/// runs dry the task's fallback (or a plain success) is used.
pub struct ScriptedExecutor {
    delay: Duration,
    delays: Mutex<HashMap<TaskId, VecDeque<Duration>>>,
    results: Mutex<HashMap<TaskId, VecDeque<ExecutionResult>>>,
    fallback: Mutex<HashMap<TaskId, ExecutionResult>>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            delays: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            fallback: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Delays for the next calls of `task`, in order.
    pub fn delays(self, task: &str, delays: &[Duration]) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(TaskId::from(task), delays.iter().copied().collect());
        self
    }

    /// Make every call of `task` run until cancelled.
    pub fn hang(self, task: &str) -> Self {
        self.delays(task, &[HANG; 16])
    }

    /// Results for the next calls of `task`, in order.
    pub fn results(self, task: &str, results: Vec<ExecutionResult>) -> Self {
        self.results
            .lock()
            .unwrap()
            .insert(TaskId::from(task), results.into());
        self
    }

    /// Result for every call of `task` not covered by [`Self::results`].
    pub fn always(self, task: &str, result: ExecutionResult) -> Self {
        self.fallback
            .lock()
            .unwrap()
            .insert(TaskId::from(task), result);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> Vec<Call> {
        let id = TaskId::from(task);
        self.calls().into_iter().filter(|c| c.task == id).collect()
    }

    /// Highest number of simultaneous calls.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_delay(&self, task: &TaskId) -> Duration {
        self.delays
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(|d| d.pop_front())
            .unwrap_or(self.delay)
    }

    fn next_result(&self, task: &TaskId) -> ExecutionResult {
        if let Some(result) = self
            .results
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(|r| r.pop_front())
        {
            return result;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(task)
            .cloned()
            .unwrap_or_else(|| ExecutionResult::success(&format!("{} done", task)))
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> maestro::Result<ExecutionResult> {
        let task = request.task.id.clone();
        let delay = self.next_delay(&task);
        let started = Instant::now();
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        let finished = tokio::select! {
            _ = request.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            task: task.clone(),
            worker: request.worker.clone(),
            iteration: request.iteration,
            feedback: request.feedback.clone(),
            started,
            finished: Instant::now(),
            cancelled: !finished,
        });

        if !finished {
            return Err(Error::Cancelled(format!("task {} cancelled", task)));
        }
        Ok(self.next_result(&task))
    }
}

/// Orchestrator settings tuned for fast tests.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        task_timeout: Duration::from_secs(30),
        lock_ttl: Duration::from_secs(30),
        retry_backoff: Duration::from_millis(5),
        max_retry_backoff: Duration::from_millis(40),
        supervision_interval: Duration::from_millis(20),
        ..OrchestratorConfig::default()
    }
}

pub struct HarnessOptions {
    pub config: OrchestratorConfig,
    pub heartbeat_timeout: Duration,
    pub critical_paths: Vec<String>,
    pub merge_delay: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            config: fast_config(),
            heartbeat_timeout: Duration::from_secs(60),
            critical_paths: Vec::new(),
            merge_delay: Duration::ZERO,
        }
    }
}

/// Orchestrator wired to in-memory services.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub locks: Arc<ResourceLockManager>,
    pub workers: Arc<WorkerRegistry>,
    pub workspaces: Arc<InMemoryWorkspaceManager>,
    pub executor: Arc<ScriptedExecutor>,
    pub events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl Harness {
    pub async fn new(workers: Vec<Worker>, executor: ScriptedExecutor) -> Self {
        Self::with_options(workers, executor, HarnessOptions::default()).await
    }

    pub async fn with_options(
        workers: Vec<Worker>,
        executor: ScriptedExecutor,
        options: HarnessOptions,
    ) -> Self {
        let locks =
            Arc::new(ResourceLockManager::new().with_critical_paths(options.critical_paths));
        let registry = Arc::new(WorkerRegistry::new(
            options.heartbeat_timeout,
            Duration::from_secs(3600),
        ));
        for worker in workers {
            registry.register(worker).await.unwrap();
        }
        let workspaces =
            Arc::new(InMemoryWorkspaceManager::new().with_merge_delay(options.merge_delay));
        let executor = Arc::new(executor);
        let (tx, events) = mpsc::unbounded_channel();

        let orchestrator = Orchestrator::new(
            Arc::clone(&locks),
            workspaces.clone(),
            Arc::clone(&registry),
            ExecutorSet::new(executor.clone()),
            options.config,
        )
        .with_events(tx);

        Self {
            orchestrator,
            locks,
            workers: registry,
            workspaces,
            executor,
            events,
        }
    }

    pub async fn run(&self, specs: Vec<TaskSpec>, concurrency: usize) -> BatchReport {
        let dag = TaskGraphBuilder::build(specs).unwrap();
        self.orchestrator.execute(&dag, concurrency).await.unwrap()
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// `count` single-slot automated workers named `w1..`.
pub fn workers(count: usize) -> Vec<Worker> {
    (1..=count)
        .map(|i| Worker::automated(&format!("w{}", i)))
        .collect()
}

/// `count` tasks with no dependencies and disjoint paths.
pub fn independent_tasks(count: usize) -> Vec<TaskSpec> {
    (1..=count)
        .map(|i| {
            let id = format!("T{}", i);
            let path = format!("src/{}.rs", id.to_lowercase());
            TaskSpec::new(id.as_str(), &format!("task {}", i)).touching(&[path.as_str()])
        })
        .collect()
}

/// A -> {B, C} -> D
pub fn diamond() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("A", "foundation").touching(&["src/a.rs"]),
        TaskSpec::new("B", "left").depends_on(&["A"]).touching(&["src/b.rs"]),
        TaskSpec::new("C", "right").depends_on(&["A"]).touching(&["src/c.rs"]),
        TaskSpec::new("D", "join")
            .depends_on(&["B", "C"])
            .touching(&["src/d.rs"]),
    ]
}

/// Result reporting a single `score` metric.
pub fn scored(score: f64) -> ExecutionResult {
    ExecutionResult::success("iteration").with_metric("score", score)
}

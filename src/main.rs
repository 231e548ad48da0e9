use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use maestro::actors::HeartbeatActor;
use maestro::config::Config;
use maestro::core::{select_with_dependencies, TaskDAG, TaskGraphBuilder, TaskId, TaskSpec};
use maestro::orchestration::{
    list_lock_files, CommandExecutor, ExecutorSet, GitWorkspaceManager, InMemoryWorkspaceManager,
    Orchestrator, OrchestratorConfig, ResourceLockManager, SchedulerEvent, Worker, WorkerId,
    WorkerKind, WorkerRegistry, WorkspaceManager,
};
use maestro::{mlog, mlog_warn, BatchReport, Result};

/// Maestro - parallel task orchestration over isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)\n    MAESTRO_LOG=LEVEL   Log level: error, warn, info, debug or trace"
)]
pub struct Cli {
    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Enable debug logging (writes to .maestro/maestro.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the execution levels of a task batch
    Plan {
        /// JSON file holding an array of tasks
        #[arg(long, short = 't')]
        tasks: PathBuf,

        /// Only these tasks (plus their dependencies)
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        select: Vec<String>,
    },

    /// Execute a task batch
    Run {
        /// JSON file holding an array of tasks
        #[arg(long, short = 't')]
        tasks: PathBuf,

        /// Only these tasks (plus their dependencies)
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        select: Vec<String>,

        /// Maximum tasks in flight (defaults to [orchestrator] concurrency)
        #[arg(long, short = 'c')]
        concurrency: Option<usize>,

        /// Per-task timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Plan only; dispatch nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// List persisted resource locks
    Locks {
        /// Remove expired locks
        #[arg(long)]
        reclaim: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    maestro::log::init_at(&Config::state_dir(&repo), cli.debug);
    if cli.debug {
        mlog!("Maestro starting (debug mode enabled)");
    } else {
        mlog!("Maestro starting");
    }

    match cli.command {
        Command::Plan { tasks, select } => run_plan(&tasks, &select),
        Command::Run {
            tasks,
            select,
            concurrency,
            timeout,
            dry_run,
        } => {
            let report = run_batch(&repo, &tasks, &select, concurrency, timeout, dry_run)?;
            println!("{}", report.render());
            if let Some(path) = maestro::log::log_path() {
                println!("Log: {}", path.display());
            }
            if !report.dry_run && !report.all_completed() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Locks { reclaim } => run_locks(&repo, reclaim),
    }
}

/// Load the batch, narrow it to the selection and build the DAG. Any
/// validation error or cycle aborts before side effects.
fn load_dag(tasks: &Path, select: &[String]) -> Result<TaskDAG> {
    let specs = TaskSpec::load_batch(tasks)?;
    let specs = if select.is_empty() {
        specs
    } else {
        let ids: Vec<TaskId> = select.iter().map(|s| TaskId::from(s.as_str())).collect();
        select_with_dependencies(&specs, &ids)?
    };
    TaskGraphBuilder::build(specs)
}

fn run_plan(tasks: &Path, select: &[String]) -> Result<()> {
    let dag = load_dag(tasks, select)?;
    println!(
        "{} task(s), {} dependency edge(s), {} level(s)",
        dag.task_count(),
        dag.dependency_count(),
        dag.levels().len()
    );
    for (index, level) in dag.levels().iter().enumerate() {
        println!("Level {}:", index);
        for id in level {
            let Some(task) = dag.task(id) else {
                continue;
            };
            let mut line = format!("  {:<12} {}", id.as_str(), task.title);
            if !task.dependencies.is_empty() {
                let deps: Vec<&str> = task.dependencies.iter().map(|d| d.as_str()).collect();
                line.push_str(&format!(" (after {})", deps.join(", ")));
            }
            if task.goal.is_some() {
                line.push_str(" [goal]");
            }
            println!("{}", line);
        }
    }
    Ok(())
}

fn run_batch(
    repo: &Path,
    tasks: &Path,
    select: &[String],
    concurrency: Option<usize>,
    timeout: Option<u64>,
    dry_run: bool,
) -> Result<BatchReport> {
    let mut config = Config::load(repo)?;
    if let Some(secs) = timeout {
        config.orchestrator.task_timeout_secs = secs;
    }
    let concurrency = concurrency.unwrap_or(config.orchestrator.concurrency).max(1);
    mlog!(
        "Run command: tasks={}, select={:?}, concurrency={}, dry_run={}",
        tasks.display(),
        select,
        concurrency,
        dry_run
    );

    let dag = load_dag(tasks, select)?;
    config.ensure_dirs(repo)?;

    let mut settings = OrchestratorConfig::from_config(&config);
    settings.dry_run = dry_run;
    settings.reports_dir = Some(Config::reports_dir(repo));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let locks = Arc::new(
            ResourceLockManager::from_lock_dir(&Config::locks_dir(repo))?
                .with_critical_paths(config.locks.critical_paths.clone()),
        );
        let workers = Arc::new(WorkerRegistry::from_config(&config.workers));
        let managed = register_workers(&workers, &config, &dag, concurrency).await?;
        let heartbeat = HeartbeatActor::new(Arc::clone(&workers), managed)
            .with_interval(Duration::from_secs(config.workers.heartbeat_interval_secs))
            .spawn();

        let (workspaces, executor): (Arc<dyn WorkspaceManager>, CommandExecutor) = if dry_run {
            (
                Arc::new(InMemoryWorkspaceManager::new()),
                CommandExecutor::with_program(PathBuf::from(config.effective_command()), Vec::new()),
            )
        } else {
            (
                Arc::new(GitWorkspaceManager::from_config(repo, &config)?),
                CommandExecutor::from_command_line(config.effective_command())?,
            )
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(
            locks,
            workspaces,
            workers,
            ExecutorSet::new(Arc::new(executor)),
            settings,
        )
        .with_events(tx);

        let cancel = orchestrator.cancel_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                mlog_warn!("Interrupted; cancelling batch");
                eprintln!("Interrupted; cancelling remaining tasks...");
                cancel.cancel_all();
            }
        });
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });

        let report = orchestrator.execute(&dag, concurrency).await;
        // Closes the event channel so the printer drains and exits.
        drop(orchestrator);
        let _ = printer.await;
        heartbeat.shutdown();
        report
    })
}

/// Register the configured pool, or `concurrency` managed workers that
/// cover every capability the batch asks for. Returns the workers whose
/// heartbeats this process pumps.
async fn register_workers(
    registry: &WorkerRegistry,
    config: &Config,
    dag: &TaskDAG,
    concurrency: usize,
) -> Result<Vec<WorkerId>> {
    let mut managed = Vec::new();

    if !config.workers.pool.is_empty() {
        for entry in &config.workers.pool {
            let capabilities: Vec<&str> = entry.capabilities.iter().map(String::as_str).collect();
            let worker = Worker::new(&entry.id, entry.kind)
                .with_capabilities(&capabilities)
                .with_max_concurrent_tasks(entry.max_concurrent_tasks);
            registry.register(worker).await?;
            if matches!(entry.kind, WorkerKind::Automated) {
                managed.push(WorkerId::from(entry.id.as_str()));
            }
        }
        return Ok(managed);
    }

    let capabilities: BTreeSet<String> = dag
        .tasks()
        .into_iter()
        .flat_map(|task| task.required_capabilities.iter().cloned())
        .collect();
    let capabilities: Vec<&str> = capabilities.iter().map(String::as_str).collect();
    for index in 1..=concurrency {
        let id = format!("worker-{}", index);
        registry
            .register(Worker::automated(&id).with_capabilities(&capabilities))
            .await?;
        managed.push(WorkerId::from(id));
    }
    Ok(managed)
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::LevelStarted { level, tasks } => {
            println!("== level {} ({} task(s))", level, tasks.len())
        }
        SchedulerEvent::TaskStarted {
            task_id,
            worker,
            attempt,
        } => {
            if *attempt > 1 {
                println!("   start    {} on {} (attempt {})", task_id, worker, attempt)
            } else {
                println!("   start    {} on {}", task_id, worker)
            }
        }
        SchedulerEvent::TaskCompleted { task_id, score } => match score {
            Some(score) => println!("   done     {} (score {:.3})", task_id, score),
            None => println!("   done     {}", task_id),
        },
        SchedulerEvent::TaskFailed {
            task_id,
            kind,
            error,
        } => println!("   failed   {} [{}] {}", task_id, kind, error),
        SchedulerEvent::TaskBlocked { task_id, reason } => {
            println!("   blocked  {} ({})", task_id, reason)
        }
        SchedulerEvent::TaskCancelled { task_id, reason } => {
            println!("   cancel   {} ({})", task_id, reason)
        }
        SchedulerEvent::TaskRequeued {
            task_id,
            reason,
            delay,
        } => println!("   retry    {} in {:?}: {}", task_id, delay, reason),
        SchedulerEvent::TaskDeferred { .. }
        | SchedulerEvent::LevelFinished { .. }
        | SchedulerEvent::Progress(_)
        | SchedulerEvent::AllComplete(_) => {}
    }
}

fn run_locks(repo: &Path, reclaim: bool) -> Result<()> {
    let dir = Config::locks_dir(repo);
    mlog!("Locks command: dir={}, reclaim={}", dir.display(), reclaim);

    if reclaim {
        let rt = tokio::runtime::Runtime::new()?;
        let reclaimed = rt.block_on(async {
            let manager = ResourceLockManager::from_lock_dir(&dir)?;
            Ok::<_, maestro::Error>(manager.reclaim_expired().await)
        })?;
        println!("Reclaimed {} expired lock(s)", reclaimed.len());
        for lock in &reclaimed {
            println!("  {} (held by {})", lock.resource_path, lock.holder_task_id);
        }
    }

    let locks = list_lock_files(&dir)?;
    if locks.is_empty() {
        println!("No resource locks held");
        return Ok(());
    }
    let now = Utc::now();
    for lock in locks {
        println!(
            "{:<40} {:<12} acquired {} expires {}{}",
            lock.resource_path,
            lock.holder_task_id.as_str(),
            lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
            lock.expires_at.format("%Y-%m-%d %H:%M:%S"),
            if lock.is_expired_at(now) { " (expired)" } else { "" }
        );
    }
    Ok(())
}

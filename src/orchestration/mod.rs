//! Orchestration layer.
//!
//! The stateful services the scheduler coordinates (resource locks, worker
//! registry, workspaces), the execution and convergence seams, and the
//! [`Orchestrator`] that drives a DAG through them.

pub mod convergence;
pub mod executor;
pub mod locks;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod workspace;

pub use convergence::{
    evaluate, ConvergenceController, ConvergenceOutcome, ConvergenceState, CriterionFailure,
    Feedback, IterationResult, IterationRunner,
};
pub use executor::{
    Artifact, CommandExecutor, ExecutionRequest, ExecutionResult, ExecutorSet, TaskExecutor,
};
pub use locks::{
    list_lock_files, Lock, LockConflict, LockGrant, ResourceLockManager, CRITICAL_SECTION,
};
pub use registry::{OrphanedTask, Worker, WorkerId, WorkerKind, WorkerRegistry, WorkerStatus};
pub use retry::RetryTracker;
pub use scheduler::{CancelHandle, Orchestrator, OrchestratorConfig, SchedulerEvent};
pub use workspace::{
    branch_name_for, GitWorkspaceManager, InMemoryWorkspaceManager, MergeOutcome, Workspace,
    WorkspaceManager,
};

//! Core domain models for the orchestrator.
//!
//! Tasks, quality goals, and the leveled dependency DAG built from them.

pub mod dag;
pub mod goal;
pub mod task;

pub use dag::{select_with_dependencies, TaskDAG, TaskGraphBuilder};
pub use goal::{Comparison, Criterion, Goal};
pub use task::{Task, TaskId, TaskKind, TaskPriority, TaskSpec, TaskStatus};

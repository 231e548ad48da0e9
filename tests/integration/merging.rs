//! Merge conflicts and the serialized merge step.

use std::time::Duration;

use maestro::core::{TaskId, TaskSpec, TaskStatus};
use maestro::orchestration::{OrchestratorConfig, SchedulerEvent};
use maestro::ErrorKind;

use crate::fixtures::{
    fast_config, independent_tasks, workers, Harness, HarnessOptions, ScriptedExecutor,
};

/// A conflicting merge sends the task back through the queue with a fresh
/// workspace until it lands.
#[tokio::test]
async fn test_merge_conflict_is_retried() {
    let mut harness = Harness::new(workers(1), ScriptedExecutor::new(Duration::from_millis(5))).await;
    harness
        .workspaces
        .simulate_conflicts(&TaskId::from("T1"), 2)
        .await;

    let report = harness.run(independent_tasks(1), 1).await;

    let task = report.task(&TaskId::from("T1")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{}", report.render());
    assert_eq!(task.attempts, 3);
    assert!(!task.escalated);
    assert_eq!(harness.executor.calls_for("T1").len(), 3);

    let requeues = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskRequeued { .. }))
        .count();
    assert_eq!(requeues, 2);
    assert_eq!(harness.workspaces.merged().await, vec![TaskId::from("T1")]);
}

#[tokio::test]
async fn test_merge_conflict_out_of_retries_escalates() {
    let config = OrchestratorConfig {
        max_task_retries: 1,
        ..fast_config()
    };
    let harness = Harness::with_options(
        workers(1),
        ScriptedExecutor::new(Duration::from_millis(5)),
        HarnessOptions {
            config,
            ..HarnessOptions::default()
        },
    )
    .await;
    harness
        .workspaces
        .simulate_conflicts(&TaskId::from("T1"), 5)
        .await;

    let report = harness.run(independent_tasks(1), 1).await;

    let task = report.task(&TaskId::from("T1")).unwrap();
    assert_eq!(task.error_kind, Some(ErrorKind::MergeConflict));
    assert!(task.escalated);
    assert_eq!(task.attempts, 2);
    assert!(task.message.as_deref().unwrap_or("").contains("conflicted.txt"));
    assert!(harness.workspaces.merged().await.is_empty());
}

#[tokio::test]
async fn test_merges_never_overlap() {
    let harness = Harness::with_options(
        workers(4),
        ScriptedExecutor::new(Duration::from_millis(10)),
        HarnessOptions {
            merge_delay: Duration::from_millis(30),
            ..HarnessOptions::default()
        },
    )
    .await;

    let report = harness.run(independent_tasks(4), 4).await;
    assert!(report.all_completed());
    assert_eq!(harness.workspaces.overlapping_merges(), 0);
    assert_eq!(harness.workspaces.merged().await.len(), 4);
    assert_eq!(harness.workspaces.peak_live(), 4);
}

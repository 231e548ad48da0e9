//! Level ordering and bounded parallelism.

use std::time::Duration;

use maestro::core::{TaskGraphBuilder, TaskId, TaskPriority, TaskSpec, TaskStatus};
use maestro::orchestration::ExecutionResult;
use maestro::{Error, ErrorKind};

use crate::fixtures::{diamond, independent_tasks, workers, Harness, ScriptedExecutor};

/// Scenario A: B and C wait for A, D waits for both, B and C overlap.
#[tokio::test]
async fn test_diamond_runs_level_by_level() {
    let harness = Harness::new(
        workers(2),
        ScriptedExecutor::new(Duration::from_millis(60)),
    )
    .await;

    let report = harness.run(diamond(), 2).await;
    assert!(report.all_completed(), "{}", report.render());
    assert_eq!(
        report.levels,
        vec![
            vec![TaskId::from("A")],
            vec![TaskId::from("B"), TaskId::from("C")],
            vec![TaskId::from("D")],
        ]
    );

    let call = |id: &str| harness.executor.calls_for(id).remove(0);
    let (a, b, c, d) = (call("A"), call("B"), call("C"), call("D"));
    assert!(b.started >= a.finished);
    assert!(c.started >= a.finished);
    assert!(d.started >= b.finished && d.started >= c.finished);
    assert!(b.overlaps(&c), "B and C should run concurrently");
    assert_eq!(harness.executor.peak(), 2);
}

#[tokio::test]
async fn test_concurrency_cap_is_respected() {
    let harness = Harness::new(
        workers(6),
        ScriptedExecutor::new(Duration::from_millis(50)),
    )
    .await;

    let report = harness.run(independent_tasks(6), 3).await;
    assert_eq!(report.summary.completed, 6);
    assert_eq!(harness.executor.peak(), 3);
}

/// A finished slot is refilled immediately instead of waiting for the
/// whole batch of in-flight tasks.
#[tokio::test]
async fn test_dispatch_streams_into_free_slots() {
    let executor = ScriptedExecutor::new(Duration::from_millis(20))
        .delays("T1", &[Duration::from_millis(300)]);
    let harness = Harness::new(workers(2), executor).await;

    let report = harness.run(independent_tasks(4), 2).await;
    assert!(report.all_completed());

    let long = harness.executor.calls_for("T1").remove(0);
    let last = harness.executor.calls_for("T4").remove(0);
    assert!(
        last.finished <= long.finished,
        "T4 should run while T1 is still going"
    );
}

#[tokio::test]
async fn test_priority_orders_the_level_queue() {
    let harness = Harness::new(workers(1), ScriptedExecutor::new(Duration::ZERO)).await;
    let specs = vec![
        TaskSpec::new("low", "low").with_priority(TaskPriority::Low),
        TaskSpec::new("first-medium", "m1"),
        TaskSpec::new("critical", "c").with_priority(TaskPriority::Critical),
        TaskSpec::new("second-medium", "m2"),
    ];

    harness.run(specs, 1).await;
    let order: Vec<String> = harness
        .executor
        .calls()
        .into_iter()
        .map(|c| c.task.to_string())
        .collect();
    assert_eq!(order, vec!["critical", "first-medium", "second-medium", "low"]);
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents_only() {
    let executor = ScriptedExecutor::new(Duration::ZERO)
        .always("A", ExecutionResult::failure("compile error"));
    let harness = Harness::new(workers(2), executor).await;
    let specs = vec![
        TaskSpec::new("A", "breaks"),
        TaskSpec::new("B", "needs A").depends_on(&["A"]),
        TaskSpec::new("C", "independent"),
        TaskSpec::new("D", "needs B").depends_on(&["B"]),
    ];

    let report = harness.run(specs, 2).await;

    let a = report.task(&TaskId::from("A")).unwrap();
    assert_eq!(a.error_kind, Some(ErrorKind::ExecutionFailed));
    assert!(a.message.as_deref().unwrap().contains("compile error"));
    assert!(!a.escalated);
    assert_eq!(report.status_of("C"), Some(&TaskStatus::Completed));
    for id in ["B", "D"] {
        assert!(
            matches!(report.status_of(id), Some(TaskStatus::Blocked { .. })),
            "{} should be blocked",
            id
        );
    }
    assert_eq!(report.summary.blocked, 2);
    assert_eq!(report.summary.failed, 1);
    assert!(harness.executor.calls_for("B").is_empty());
    assert!(harness.executor.calls_for("D").is_empty());
    assert!(harness.workspaces.merged().await.iter().all(|t| t.as_str() == "C"));
}

/// Scenario B: a cycle is rejected before anything runs.
#[test]
fn test_cycle_is_rejected_before_dispatch() {
    let err = TaskGraphBuilder::build(vec![
        TaskSpec::new("A", "a").depends_on(&["B"]),
        TaskSpec::new("B", "b").depends_on(&["A"]),
    ])
    .unwrap_err();

    match err {
        Error::CircularDependency { tasks } => {
            assert_eq!(tasks, vec![TaskId::from("A"), TaskId::from("B")]);
        }
        other => panic!("expected a cycle error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_batch_reports_nothing() {
    let harness = Harness::new(workers(1), ScriptedExecutor::new(Duration::ZERO)).await;
    let report = harness.run(Vec::new(), 4).await;
    assert!(report.tasks.is_empty());
    assert!(report.levels.is_empty());
    assert_eq!(report.summary.total(), 0);
}

//! Goal-tracked tasks driven through the convergence loop.

use std::time::Duration;

use maestro::core::{Criterion, Goal, TaskId, TaskSpec, TaskStatus};
use maestro::orchestration::{OrchestratorConfig, WorkspaceManager};
use maestro::ErrorKind;

use crate::fixtures::{fast_config, scored, workers, Harness, HarnessOptions, ScriptedExecutor};

fn quality(max: u32, window: u32) -> Goal {
    Goal::new("quality")
        .criterion("score", Criterion::at_least(0.8))
        .with_max_iterations(max)
        .with_convergence_window(window)
}

fn with_config(config: OrchestratorConfig) -> HarnessOptions {
    HarnessOptions {
        config,
        ..HarnessOptions::default()
    }
}

#[tokio::test]
async fn test_goal_converges_with_feedback() {
    let executor = ScriptedExecutor::new(Duration::from_millis(5)).results(
        "G",
        vec![scored(0.3), scored(0.6), scored(0.9), scored(0.95)],
    );
    let harness = Harness::new(workers(1), executor).await;
    let spec = TaskSpec::new("G", "tune").with_goal(quality(6, 2));

    let report = harness.run(vec![spec], 1).await;

    let task = report.task(&TaskId::from("G")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{}", report.render());
    assert_eq!(task.iterations, Some(4));
    let score = task.score.unwrap();
    assert!((score - 0.15).abs() < 1e-9, "score {}", score);

    let calls = harness.executor.calls_for("G");
    assert_eq!(calls.len(), 4);
    assert_eq!(
        calls.iter().map(|c| c.iteration).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert!(calls[0].feedback.is_none());
    let feedback = calls[1].feedback.as_ref().unwrap();
    assert_eq!(feedback.iteration, 1);
    assert_eq!(feedback.failures[0].metric, "score");
    assert_eq!(feedback.failures[0].actual, Some(0.3));
    // Passing iterations carry no feedback forward.
    assert!(calls[3].feedback.is_none());

    assert_eq!(harness.workspaces.merged().await, vec![TaskId::from("G")]);
}

#[tokio::test]
async fn test_exhausted_goal_escalates_and_keeps_workspace() {
    let config = OrchestratorConfig {
        divergence_window: None,
        ..fast_config()
    };
    let executor = ScriptedExecutor::new(Duration::from_millis(5))
        .results("G", vec![scored(0.1), scored(0.2), scored(0.3)]);
    let harness = Harness::with_options(workers(1), executor, with_config(config)).await;
    let spec = TaskSpec::new("G", "tune").with_goal(quality(3, 2));

    let report = harness.run(vec![spec], 1).await;

    let task = report.task(&TaskId::from("G")).unwrap();
    assert_eq!(task.error_kind, Some(ErrorKind::ConvergenceExhausted));
    assert!(task.escalated);
    assert_eq!(task.iterations, Some(3));
    assert_eq!(harness.executor.calls_for("G").len(), 3);

    assert!(harness.workspaces.merged().await.is_empty());
    let kept = harness.workspaces.get(&TaskId::from("G")).await.unwrap();
    assert!(kept.expires_at.is_some());
}

/// A flat score never trips an early stop unless divergence detection is
/// configured; the goal runs its whole budget.
#[tokio::test]
async fn test_flat_scores_exhaust_budget_at_default_config() {
    let executor = ScriptedExecutor::new(Duration::from_millis(5)).always("G", scored(0.1));
    let harness = Harness::new(workers(1), executor).await;
    let spec = TaskSpec::new("G", "tune").with_goal(quality(5, 2));

    let report = harness.run(vec![spec], 1).await;

    let task = report.task(&TaskId::from("G")).unwrap();
    assert_eq!(task.error_kind, Some(ErrorKind::ConvergenceExhausted));
    assert!(task.escalated);
    assert_eq!(task.iterations, Some(5));
    assert_eq!(harness.executor.calls_for("G").len(), 5);
}

#[tokio::test]
async fn test_falling_scores_stop_early() {
    let config = OrchestratorConfig {
        divergence_window: Some(2),
        ..fast_config()
    };
    let executor = ScriptedExecutor::new(Duration::from_millis(5)).results(
        "G",
        vec![scored(0.5), scored(0.4), scored(0.3), scored(0.9), scored(0.9)],
    );
    let harness = Harness::with_options(workers(1), executor, with_config(config)).await;
    let spec = TaskSpec::new("G", "tune").with_goal(quality(10, 2));

    let report = harness.run(vec![spec], 1).await;

    let task = report.task(&TaskId::from("G")).unwrap();
    assert_eq!(task.error_kind, Some(ErrorKind::ConvergenceDiverging));
    assert!(task.escalated);
    assert_eq!(task.iterations, Some(3));
    assert_eq!(harness.executor.calls_for("G").len(), 3);
}

/// A goal without its own budget takes the configured one.
#[tokio::test]
async fn test_config_budget_applies_to_goals_without_one() {
    let config = OrchestratorConfig {
        max_iterations: 2,
        divergence_window: None,
        ..fast_config()
    };
    let executor = ScriptedExecutor::new(Duration::from_millis(5)).always("G", scored(0.1));
    let harness = Harness::with_options(workers(1), executor, with_config(config)).await;
    let goal = Goal::new("quality").criterion("score", Criterion::at_least(0.8));
    let spec = TaskSpec::new("G", "tune").with_goal(goal);

    let report = harness.run(vec![spec], 1).await;

    let task = report.task(&TaskId::from("G")).unwrap();
    assert_eq!(task.error_kind, Some(ErrorKind::ConvergenceExhausted));
    assert_eq!(task.iterations, Some(2));
}

/// Locks are dropped between iterations and re-acquired before the next
/// one, so a sibling on the same path can slip in but never overlaps.
#[tokio::test]
async fn test_iterations_reacquire_locks() {
    let executor = ScriptedExecutor::new(Duration::from_millis(40))
        .results("G", vec![scored(0.3), scored(0.9), scored(0.9)]);
    let harness = Harness::new(workers(2), executor).await;
    let specs = vec![
        TaskSpec::new("G", "tune")
            .touching(&["src/shared.rs"])
            .with_goal(quality(5, 2)),
        TaskSpec::new("S", "sibling").touching(&["src/shared.rs"]),
    ];

    let report = harness.run(specs, 2).await;
    assert!(report.all_completed(), "{}", report.render());

    let g_calls = harness.executor.calls_for("G");
    assert_eq!(g_calls.len(), 3);
    let s_call = harness.executor.calls_for("S").remove(0);
    for call in &g_calls {
        assert!(!call.overlaps(&s_call), "S ran during G iteration {}", call.iteration);
    }
    assert!(harness.locks.snapshot().await.is_empty());
}

//! Resource lock serialization across concurrently dispatched tasks.

use std::time::Duration;

use maestro::core::TaskSpec;
use maestro::orchestration::{SchedulerEvent, WorkspaceManager};

use crate::fixtures::{workers, Harness, HarnessOptions, ScriptedExecutor};

/// Scenario C: two tasks on the same path never run at the same time.
#[tokio::test]
async fn test_shared_path_serializes_tasks() {
    let mut harness = Harness::new(
        workers(2),
        ScriptedExecutor::new(Duration::from_millis(80)),
    )
    .await;
    let specs = vec![
        TaskSpec::new("A", "edit config").touching(&["config.json"]),
        TaskSpec::new("B", "edit config too").touching(&["./config.json"]),
    ];

    let report = harness.run(specs, 2).await;
    assert!(report.all_completed(), "{}", report.render());

    let a = harness.executor.calls_for("A").remove(0);
    let b = harness.executor.calls_for("B").remove(0);
    assert!(!a.overlaps(&b), "A and B held config.json together");
    assert!(b.started >= a.finished);

    let deferred: Vec<_> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskDeferred { task_id, reason } => Some((task_id, reason)),
            _ => None,
        })
        .collect();
    assert!(!deferred.is_empty());
    assert!(deferred.iter().all(|(id, _)| id.as_str() == "B"));
    assert!(deferred[0].1.contains("config.json (held by A)"));
}

#[tokio::test]
async fn test_disjoint_paths_run_in_parallel() {
    let harness = Harness::new(
        workers(2),
        ScriptedExecutor::new(Duration::from_millis(80)),
    )
    .await;
    let specs = vec![
        TaskSpec::new("A", "frontend").touching(&["web/app.ts"]),
        TaskSpec::new("B", "backend").touching(&["src/server.rs"]),
    ];

    harness.run(specs, 2).await;
    let a = harness.executor.calls_for("A").remove(0);
    let b = harness.executor.calls_for("B").remove(0);
    assert!(a.overlaps(&b));
}

/// Critical paths serialize every task that touches any of them.
#[tokio::test]
async fn test_critical_paths_serialize_across_paths() {
    let options = HarnessOptions {
        critical_paths: vec!["Cargo.toml".to_string(), "package.json".to_string()],
        ..HarnessOptions::default()
    };
    let harness = Harness::with_options(
        workers(3),
        ScriptedExecutor::new(Duration::from_millis(60)),
        options,
    )
    .await;
    let specs = vec![
        TaskSpec::new("rust-deps", "bump crates").touching(&["Cargo.toml"]),
        TaskSpec::new("js-deps", "bump packages").touching(&["package.json"]),
        TaskSpec::new("docs", "docs").touching(&["README.md"]),
    ];

    let report = harness.run(specs, 3).await;
    assert!(report.all_completed());

    let rust = harness.executor.calls_for("rust-deps").remove(0);
    let js = harness.executor.calls_for("js-deps").remove(0);
    let docs = harness.executor.calls_for("docs").remove(0);
    assert!(!rust.overlaps(&js));
    assert!(docs.overlaps(&rust) || docs.overlaps(&js));
}

#[tokio::test]
async fn test_no_locks_survive_the_batch() {
    let harness = Harness::new(
        workers(2),
        ScriptedExecutor::new(Duration::from_millis(10)),
    )
    .await;
    let specs = vec![
        TaskSpec::new("A", "a").touching(&["x", "y"]),
        TaskSpec::new("B", "b").touching(&["y", "z"]).depends_on(&["A"]),
        TaskSpec::new("C", "c").touching(&["x", "z"]),
    ];

    let report = harness.run(specs, 2).await;
    assert!(report.all_completed());
    assert!(harness.locks.snapshot().await.is_empty());
    assert!(harness.workspaces.live().await.is_empty());
}

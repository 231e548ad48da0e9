//! Worker loss, cancellation, timeouts and escalations.

use std::sync::Arc;
use std::time::Duration;

use maestro::actors::HeartbeatActor;
use maestro::core::{TaskId, TaskSpec, TaskStatus};
use maestro::orchestration::{
    OrchestratorConfig, SchedulerEvent, WorkerId, WorkerStatus, WorkspaceManager,
};
use maestro::ErrorKind;

use crate::fixtures::{
    fast_config, independent_tasks, workers, Harness, HarnessOptions, ScriptedExecutor, HANG,
};

fn options(config: OrchestratorConfig) -> HarnessOptions {
    HarnessOptions {
        config,
        ..HarnessOptions::default()
    }
}

/// Scenario D: the worker holding T stops heartbeating; T runs again on
/// another worker and lands exactly once.
#[tokio::test]
async fn test_offline_worker_task_is_reassigned() {
    let executor = ScriptedExecutor::new(Duration::from_millis(20)).delays("T", &[HANG]);
    let mut harness = Harness::with_options(
        workers(2),
        executor,
        HarnessOptions {
            heartbeat_timeout: Duration::from_millis(100),
            ..HarnessOptions::default()
        },
    )
    .await;
    // Only w2 is kept alive; w1 goes silent as soon as it is registered.
    let heartbeat = HeartbeatActor::new(Arc::clone(&harness.workers), vec![WorkerId::from("w2")])
        .with_interval(Duration::from_millis(20))
        .spawn();

    let report = harness
        .run(vec![TaskSpec::new("T", "survive").touching(&["src/t.rs"])], 1)
        .await;
    heartbeat.shutdown();

    let task = report.task(&TaskId::from("T")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{}", report.render());
    assert_eq!(task.attempts, 2);
    assert_eq!(task.worker, Some(WorkerId::from("w2")));

    let calls = harness.executor.calls_for("T");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].worker, WorkerId::from("w1"));
    assert!(calls[0].cancelled);
    assert_eq!(calls[1].worker, WorkerId::from("w2"));

    let w1 = harness.workers.get(&WorkerId::from("w1")).await.unwrap();
    assert_eq!(w1.status, WorkerStatus::Offline);
    assert!(w1.current_tasks.is_empty());

    assert_eq!(harness.workspaces.merged().await, vec![TaskId::from("T")]);
    assert!(harness.drain_events().iter().any(|e| matches!(
        e,
        SchedulerEvent::TaskRequeued { reason, .. } if reason.contains("offline")
    )));
}

/// Unregistering a worker mid-task hands the task back just like a missed
/// heartbeat would.
#[tokio::test]
async fn test_unregistered_worker_task_is_reassigned() {
    let executor = ScriptedExecutor::new(Duration::from_millis(20)).delays("T", &[HANG]);
    let harness = Harness::new(workers(2), executor).await;
    let registry = Arc::clone(&harness.workers);

    let (report, _) = tokio::join!(
        harness.run(vec![TaskSpec::new("T", "survive").touching(&["src/t.rs"])], 1),
        async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            let orphaned = registry.unregister(&WorkerId::from("w1")).await.unwrap();
            assert_eq!(orphaned, vec![TaskId::from("T")]);
        }
    );

    let task = report.task(&TaskId::from("T")).unwrap();
    assert_eq!(task.status, TaskStatus::Completed, "{}", report.render());
    assert_eq!(task.attempts, 2);
    assert_eq!(task.worker, Some(WorkerId::from("w2")));

    let calls = harness.executor.calls_for("T");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].worker, WorkerId::from("w1"));
    assert!(calls[0].cancelled);
    assert_eq!(calls[1].worker, WorkerId::from("w2"));

    assert!(harness.workers.get(&WorkerId::from("w1")).await.is_none());
    assert_eq!(harness.workspaces.merged().await, vec![TaskId::from("T")]);
    assert!(harness.locks.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_cancel_running_task_blocks_dependents() {
    let executor = ScriptedExecutor::new(Duration::from_millis(30)).hang("A");
    let harness = Harness::new(workers(2), executor).await;
    let specs = vec![
        TaskSpec::new("A", "long").touching(&["src/a.rs"]),
        TaskSpec::new("C", "short").touching(&["src/c.rs"]),
        TaskSpec::new("B", "after A").depends_on(&["A"]),
    ];
    let cancel = harness.orchestrator.cancel_handle();

    let (report, _) = tokio::join!(harness.run(specs, 2), async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel(&TaskId::from("A")).await;
    });

    match report.status_of("A") {
        Some(TaskStatus::Cancelled { reason }) => assert_eq!(reason, "cancelled by request"),
        other => panic!("unexpected status for A: {:?}", other),
    }
    assert_eq!(report.status_of("C"), Some(&TaskStatus::Completed));
    match report.status_of("B") {
        Some(TaskStatus::Blocked { reason }) => assert!(reason.contains("A")),
        other => panic!("unexpected status for B: {:?}", other),
    }

    assert_eq!(harness.workspaces.merged().await, vec![TaskId::from("C")]);
    assert!(harness.workspaces.destroyed().await.contains(&TaskId::from("A")));
    assert!(harness.locks.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_cancel_all_stops_remaining_levels() {
    let executor = ScriptedExecutor::new(Duration::from_millis(20)).hang("T1");
    let harness = Harness::new(workers(2), executor).await;
    let mut specs = independent_tasks(2);
    specs.push(TaskSpec::new("T3", "later").depends_on(&["T2"]));
    let cancel = harness.orchestrator.cancel_handle();

    let (report, _) = tokio::join!(harness.run(specs, 2), async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel_all();
    });

    assert_eq!(report.status_of("T2"), Some(&TaskStatus::Completed));
    for id in ["T1", "T3"] {
        match report.status_of(id) {
            Some(TaskStatus::Cancelled { reason }) => assert_eq!(reason, "batch cancelled"),
            other => panic!("unexpected status for {}: {:?}", id, other),
        }
    }
    assert!(harness.executor.calls_for("T3").is_empty());
    assert_eq!(report.summary.cancelled, 2);
}

#[tokio::test]
async fn test_timeout_cancels_only_the_slow_task() {
    let config = OrchestratorConfig {
        task_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let executor = ScriptedExecutor::new(Duration::from_millis(20)).hang("T1");
    let harness = Harness::with_options(workers(2), executor, options(config)).await;

    let report = harness.run(independent_tasks(2), 2).await;

    let slow = report.task(&TaskId::from("T1")).unwrap();
    assert!(matches!(
        &slow.status,
        TaskStatus::Cancelled { reason } if reason.starts_with("timed out after")
    ));
    assert_eq!(slow.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(report.status_of("T2"), Some(&TaskStatus::Completed));
    assert!(harness.executor.calls_for("T1")[0].cancelled);
    assert_eq!(harness.workspaces.merged().await, vec![TaskId::from("T2")]);
}

#[tokio::test]
async fn test_no_capable_worker_escalates_after_grace() {
    let config = OrchestratorConfig {
        worker_grace_period: Duration::from_millis(50),
        ..fast_config()
    };
    let harness = Harness::with_options(
        workers(2),
        ScriptedExecutor::new(Duration::from_millis(10)),
        options(config),
    )
    .await;
    let specs = vec![
        TaskSpec::new("train", "needs a gpu").requiring(&["gpu"]),
        TaskSpec::new("lint", "anyone").touching(&["src/lib.rs"]),
    ];

    let report = harness.run(specs, 2).await;

    let train = report.task(&TaskId::from("train")).unwrap();
    assert_eq!(train.error_kind, Some(ErrorKind::WorkerUnavailable));
    assert!(train.escalated);
    assert_eq!(train.attempts, 0);
    assert!(harness.executor.calls_for("train").is_empty());
    assert_eq!(report.status_of("lint"), Some(&TaskStatus::Completed));
}

/// Busy workers are not missing workers: waiting for a free slot never
/// trips the grace period.
#[tokio::test]
async fn test_busy_workers_do_not_escalate() {
    let config = OrchestratorConfig {
        worker_grace_period: Duration::ZERO,
        ..fast_config()
    };
    let harness = Harness::with_options(
        workers(1),
        ScriptedExecutor::new(Duration::from_millis(30)),
        options(config),
    )
    .await;

    let report = harness.run(independent_tasks(3), 3).await;
    assert!(report.all_completed(), "{}", report.render());
    assert!(report.escalations().is_empty());
    assert_eq!(harness.executor.peak(), 1);
}

#[tokio::test]
async fn test_duplicate_workspace_is_refused() {
    let harness = Harness::new(workers(1), ScriptedExecutor::new(Duration::from_millis(10))).await;
    harness
        .workspaces
        .provision(&TaskId::from("T1"), None)
        .await
        .unwrap();

    let report = harness.run(independent_tasks(1), 1).await;

    let task = report.task(&TaskId::from("T1")).unwrap();
    assert_eq!(task.error_kind, Some(ErrorKind::WorkspaceConflict));
    assert!(task.escalated);
    assert!(harness.executor.calls().is_empty());
    assert!(harness.locks.snapshot().await.is_empty());
}

//! Persisted batch reports.

use std::time::Duration;

use tempfile::TempDir;

use maestro::core::{TaskId, TaskSpec, TaskStatus};
use maestro::orchestration::{ExecutionResult, OrchestratorConfig};
use maestro::{BatchReport, ErrorKind};

use crate::fixtures::{fast_config, workers, Harness, HarnessOptions, ScriptedExecutor};

#[tokio::test]
async fn test_report_records_every_terminal_state() {
    let dir = TempDir::new().unwrap();
    let config = OrchestratorConfig {
        task_timeout: Duration::from_millis(100),
        reports_dir: Some(dir.path().to_path_buf()),
        ..fast_config()
    };
    let executor = ScriptedExecutor::new(Duration::from_millis(10))
        .always("broken", ExecutionResult::failure("tests failed"))
        .hang("slow");
    let harness = Harness::with_options(
        workers(3),
        executor,
        HarnessOptions {
            config,
            ..HarnessOptions::default()
        },
    )
    .await;
    let specs = vec![
        TaskSpec::new("ok", "fine").touching(&["src/ok.rs"]),
        TaskSpec::new("broken", "fails").touching(&["src/broken.rs"]),
        TaskSpec::new("slow", "times out").touching(&["src/slow.rs"]),
        TaskSpec::new("after", "needs broken").depends_on(&["ok", "broken"]),
    ];

    let report = harness.run(specs, 3).await;
    assert_eq!(report.summary.completed, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.cancelled, 1);
    assert_eq!(report.summary.blocked, 1);
    assert_eq!(report.summary.total(), 4);

    let path = dir.path().join(format!("{}.json", report.batch_id));
    let loaded = BatchReport::load(&path).unwrap();
    assert_eq!(loaded.batch_id, report.batch_id);
    assert_eq!(loaded.levels, report.levels);

    let ok = loaded.task(&TaskId::from("ok")).unwrap();
    assert_eq!(ok.status, TaskStatus::Completed);
    assert_eq!(ok.branch.as_deref(), Some("maestro/task/ok"));
    assert!(ok.duration_ms.is_some());

    let broken = loaded.task(&TaskId::from("broken")).unwrap();
    assert_eq!(broken.error_kind, Some(ErrorKind::ExecutionFailed));
    assert!(broken.message.as_deref().unwrap().contains("tests failed"));

    let slow = loaded.task(&TaskId::from("slow")).unwrap();
    assert_eq!(slow.error_kind, Some(ErrorKind::Timeout));

    match &loaded.task(&TaskId::from("after")).unwrap().status {
        TaskStatus::Blocked { reason } => assert_eq!(reason, "dependency broken failed"),
        other => panic!("unexpected status: {:?}", other),
    }
}

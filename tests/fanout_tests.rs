// ABOUTME: Integration tests for the fan-out runners
// ABOUTME: Tests independent and fail-fast batches across in-process and OS-process isolation

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wavefront::engine::{ErrorKind, TaskError};
use wavefront::fanout::{
    CommandSpec, FanOutRunner, ProcessFanOut, TaskFanOut, UnitStatus, WorkUnit,
};
use wavefront::Config;

fn shell(name: &str, script: &str) -> WorkUnit {
    WorkUnit::command(name, CommandSpec::new("sh").args(["-c", script]))
}

fn sleeper(name: &str, millis: u64) -> WorkUnit {
    WorkUnit::from_fn(name, move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(json!(millis))
    })
}

fn failing(name: &str) -> WorkUnit {
    WorkUnit::from_fn(name, |_ctx| async { Err(TaskError::other("unit", "broken")) })
}

#[tokio::test]
async fn test_in_process_independent_mode_reports_real_outcomes() {
    let runner = TaskFanOut::new(Some(2), false);
    let batch = runner
        .run(vec![sleeper("one", 10), failing("two"), sleeper("three", 30)])
        .await;

    assert_eq!(batch.total, 3);
    assert_eq!(batch.results.len(), 3);
    assert_eq!(batch.passed, 2);
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.cancelled, 0);

    let third = batch.result("three").unwrap();
    assert!(!third.is_cancelled());
    assert_eq!(third.value, Some(json!(30)));
    assert!((batch.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_in_process_fail_fast_cancels_siblings() {
    let runner = TaskFanOut::new(None, true);
    let batch = runner
        .run(vec![sleeper("one", 5_000), failing("two"), sleeper("three", 5_000)])
        .await;

    assert!(batch.execution_time < Duration::from_secs(4));
    assert_eq!(batch.failed, 1);
    assert_eq!(batch.cancelled, 2);
    assert_eq!(batch.result("two").unwrap().status, UnitStatus::Failed);
    for name in ["one", "three"] {
        let unit = batch.result(name).unwrap();
        assert!(unit.is_cancelled());
        assert_eq!(unit.error_kind, Some(ErrorKind::Cancelled));
    }
}

#[tokio::test]
async fn test_in_process_fail_fast_cancels_queued_units() {
    let runner = TaskFanOut::new(Some(1), true);
    let batch = runner
        .run(vec![failing("first"), sleeper("second", 1), sleeper("third", 1)])
        .await;

    assert_eq!(batch.failed, 1);
    assert_eq!(batch.cancelled, 2);
    assert_eq!(batch.result("second").unwrap().status, UnitStatus::Cancelled);
}

#[tokio::test]
async fn test_process_independent_mode() {
    let runner = ProcessFanOut::new(Some(2), false);
    let batch = runner
        .run(vec![
            shell("hello", "echo hello"),
            shell("broken", "echo nope >&2; exit 4"),
            shell("world", "echo world"),
        ])
        .await;

    assert_eq!(batch.passed, 2);
    assert_eq!(batch.failed, 1);

    let hello = batch.result("hello").unwrap();
    assert_eq!(hello.value.as_ref().unwrap()["stdout"], json!("hello\n"));

    let broken = batch.result("broken").unwrap();
    assert_eq!(broken.error_kind, Some(ErrorKind::Process));
    assert!(broken.error.as_ref().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_process_fail_fast_lets_started_children_finish() {
    let runner = ProcessFanOut::new(Some(2), true);
    let batch = runner
        .run(vec![
            shell("slow", "sleep 0.3; echo finished"),
            shell("broken", "exit 1"),
            shell("queued", "echo never"),
        ])
        .await;

    let slow = batch.result("slow").unwrap();
    assert_eq!(slow.status, UnitStatus::Passed);
    assert_eq!(slow.value.as_ref().unwrap()["stdout"], json!("finished\n"));

    assert_eq!(batch.result("broken").unwrap().status, UnitStatus::Failed);

    let queued = batch.result("queued").unwrap();
    assert_eq!(queued.status, UnitStatus::Skipped);
    assert_eq!(queued.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(batch.cancelled, 1);
}

#[tokio::test]
async fn test_process_runner_rejects_in_process_actions() {
    let batch = ProcessFanOut::new(Some(1), false)
        .run(vec![sleeper("closure", 1)])
        .await;

    let unit = batch.result("closure").unwrap();
    assert_eq!(unit.status, UnitStatus::Failed);
    assert_eq!(unit.error_kind, Some(ErrorKind::Unsupported));
}

#[tokio::test]
async fn test_process_timeout_kills_child() {
    let runner = ProcessFanOut::new(Some(1), false).with_timeout(Duration::from_millis(100));
    let batch = runner.run(vec![shell("stuck", "sleep 10")]).await;

    let unit = batch.result("stuck").unwrap();
    assert_eq!(unit.error_kind, Some(ErrorKind::Timeout));
    assert!(batch.execution_time < Duration::from_secs(5));
}

#[tokio::test]
async fn test_runners_are_interchangeable() {
    let runners: Vec<Box<dyn FanOutRunner>> = vec![
        Box::new(TaskFanOut::new(Some(2), false)),
        Box::new(ProcessFanOut::new(Some(2), false)),
    ];

    for runner in runners {
        let batch = runner
            .run(vec![shell("ok", "echo same"), shell("ko", "exit 9")])
            .await;

        assert_eq!(batch.total, 2);
        assert_eq!(batch.passed, 1);
        assert_eq!(batch.failed, 1);
        assert_eq!(
            batch.result("ok").unwrap().value.as_ref().unwrap()["stdout"],
            json!("same\n")
        );
    }
}

#[tokio::test]
async fn test_callback_runs_for_cancelled_units_too() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let runner = TaskFanOut::new(None, true).with_callback(move |result| {
        sink.lock().unwrap().push((result.name.clone(), result.status));
        Ok(())
    });

    runner
        .run(vec![sleeper("slow", 5_000), failing("fast")])
        .await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&("fast".to_string(), UnitStatus::Failed)));
    assert!(seen.contains(&("slow".to_string(), UnitStatus::Cancelled)));
}

#[tokio::test]
async fn test_panicking_callback_is_contained() {
    let runner = TaskFanOut::new(None, false).with_callback(|_result| panic!("callback bug"));
    let batch = runner.run(vec![sleeper("a", 1), sleeper("b", 1)]).await;
    assert_eq!(batch.passed, 2);
}

#[test]
fn test_runners_from_config() {
    let config = Config::from_yaml_str("max_concurrency: 4\nworker_pool_size: 2\nfail_fast: true")
        .unwrap();

    let tasks = TaskFanOut::from_config(&config);
    assert_eq!(tasks.max_concurrency(), Some(4));
    assert!(tasks.fail_fast());

    let processes = ProcessFanOut::from_config(&config);
    assert_eq!(processes.max_concurrency(), Some(2));
}

#[test]
fn test_process_pool_defaults_to_available_parallelism() {
    let runner = ProcessFanOut::new(None, false);
    assert!(runner.max_concurrency().unwrap() >= 1);
}

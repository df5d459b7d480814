//! Integration tests for parallel unit execution
//!
//! These tests drive `TestRunController` with the in-memory `MockWorker` and
//! check worker counts, bail/retry accounting and hook metadata.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use testfleet::runner::{AfterTest, BeforeTest};
use testfleet::worker::MockWorker;
use testfleet::{RunConfig, TestRunController, TestUnit, WorkerId};

fn generate_unit(index: usize) -> TestUnit {
    TestUnit::new(
        format!("qwerty-{}.js", index),
        format!("console.log({})", index),
    )
}

fn generate_units(count: usize) -> Vec<TestUnit> {
    (0..count).map(generate_unit).collect()
}

/// Spawned worker count is capped by the limit when units outnumber it.
#[tokio::test]
async fn test_spawns_workers_up_to_limit() {
    let worker = MockWorker::new();
    let controller =
        TestRunController::new(RunConfig::new().with_worker_limit(20), worker.clone());

    let outcome = controller.run_queue(generate_units(40)).await;

    assert!(outcome.is_success());
    assert_eq!(worker.spawned_count(), 20);
    assert_eq!(worker.execution_count(), 40);
}

/// With a generous limit one worker is spawned per unit.
#[tokio::test]
async fn test_spawns_workers_by_unit_count_when_limit_is_higher() {
    let worker = MockWorker::new();
    let controller =
        TestRunController::new(RunConfig::new().with_worker_limit(10), worker.clone());

    controller.run_queue(generate_units(2)).await;

    assert_eq!(worker.spawned_count(), 2);
    let executed: HashSet<String> = worker.executions().into_iter().map(|(p, _)| p).collect();
    assert_eq!(executed.len(), 2);
}

/// Two slots, forty units: both slots stay busy and everything completes.
#[tokio::test]
async fn test_two_workers_sustain_forty_units() {
    let worker = MockWorker::new().with_delay(Duration::from_millis(2));
    let controller =
        TestRunController::new(RunConfig::new().with_worker_limit(2), worker.clone());

    let outcome = controller.run_queue(generate_units(40)).await;

    assert!(outcome.is_success());
    assert_eq!(worker.spawned_count(), 2);
    assert_eq!(worker.peak_concurrency(), 2);
    assert_eq!(worker.execution_count(), 40);
}

/// Busy slots never exceed the limit, even with retries in the mix.
#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let worker = MockWorker::new()
        .with_delay(Duration::from_millis(3))
        .fail_on("qwerty-2.js")
        .fail_on("qwerty-5.js");
    let config = RunConfig::new().with_worker_limit(3).with_retry_count(2);
    let controller = TestRunController::new(config, worker.clone());

    let outcome = controller.run_queue(generate_units(12)).await;

    assert!(worker.peak_concurrency() <= 3);
    assert_eq!(outcome.failures().len(), 2);
    assert_eq!(worker.execution_count(), 12 + 2 * 2);
}

/// The bail flag stops the run at the first failure.
#[tokio::test]
async fn test_bail_fails_instantly() {
    let worker = MockWorker::failing();
    let config = RunConfig::new().with_worker_limit(2).with_bail(true);
    let controller = TestRunController::new(config, worker);

    let outcome = controller.run_queue(generate_units(2)).await;

    assert_eq!(outcome.failures().len(), 1);
    assert!(outcome.bailed());
}

/// After a bail nothing new is dispatched.
#[tokio::test]
async fn test_bail_stops_dispatching() {
    let worker = MockWorker::failing();
    let config = RunConfig::new()
        .with_worker_limit(1)
        .with_bail(true)
        .with_retry_count(3);
    let controller = TestRunController::new(config, worker.clone());

    let outcome = controller.run_queue(generate_units(5)).await;

    assert_eq!(worker.execution_count(), 1);
    assert_eq!(outcome.failures().len(), 1);
    assert_eq!(outcome.failures()[0].unit.path, "qwerty-0.js");
}

/// Attempts still running when the run bails finish but are not reported.
#[tokio::test]
async fn test_in_flight_attempts_discarded_after_bail() {
    let worker = MockWorker::failing().with_delay(Duration::from_millis(5));
    let config = RunConfig::new().with_worker_limit(4).with_bail(true);
    let controller = TestRunController::new(config, worker.clone());

    let outcome = controller.run_queue(generate_units(4)).await;

    assert_eq!(worker.execution_count(), 4);
    assert_eq!(outcome.failures().len(), 1);
    assert_eq!(outcome.attempts(), 1);
}

/// Every failing unit is retried `retry_count` times before it is reported.
#[tokio::test]
async fn test_retries_when_unit_fails() {
    let units_count = 3;
    let retry_count = 5;
    let worker = MockWorker::failing();
    let config = RunConfig::new()
        .with_worker_limit(2)
        .with_retry_delay(Duration::ZERO)
        .with_retry_count(retry_count);
    let controller = TestRunController::new(config, worker.clone());

    let outcome = controller.run_queue(generate_units(units_count)).await;

    // Failures are reported only after the last retry.
    assert_eq!(outcome.failures().len(), units_count);
    assert_eq!(
        worker.execution_count(),
        units_count + units_count * retry_count as usize
    );
    assert_eq!(outcome.attempts(), worker.execution_count());
}

/// A unit waiting out its retry delay does not hold up the others.
#[tokio::test]
async fn test_retry_delay_does_not_block_other_workers() {
    let worker = MockWorker::new()
        .with_delay(Duration::from_millis(5))
        .fail_on("qwerty-0.js");
    let config = RunConfig::new()
        .with_worker_limit(2)
        .with_retry_count(1)
        .with_retry_delay(Duration::from_millis(200));
    let controller = TestRunController::new(config, worker.clone());

    controller.run_queue(generate_units(5)).await;

    let executions = worker.executions();
    assert_eq!(executions.len(), 6);
    assert_eq!(executions.last().unwrap().0, "qwerty-0.js");
}

/// Hook metadata names the worker that actually ran each attempt.
#[tokio::test]
async fn test_process_id_meta_matches_executing_worker() {
    let worker = MockWorker::new();
    let config = RunConfig::new().with_worker_limit(2).with_bail(true);
    let controller = TestRunController::new(config, worker.clone());

    let before = Arc::new(Mutex::new(Vec::new()));
    let after = Arc::new(Mutex::new(Vec::new()));
    let before_sink = Arc::clone(&before);
    let after_sink = Arc::clone(&after);
    controller
        .hooks()
        .before_test
        .read_hook("testPlugin", move |event: &BeforeTest| {
            before_sink
                .lock()
                .unwrap()
                .push((event.unit.path.clone(), event.meta.process_id.clone()));
            Ok(())
        });
    controller
        .hooks()
        .after_test
        .write_hook("testPlugin", move |event: AfterTest| {
            after_sink
                .lock()
                .unwrap()
                .push((event.unit.path.clone(), event.meta.process_id.clone()));
            async move { Ok(event) }
        });

    let outcome = controller.run_queue(generate_units(2)).await;

    assert!(outcome.is_success());
    let executed: HashSet<(String, WorkerId)> = worker.executions().into_iter().collect();
    let before: HashSet<(String, WorkerId)> = before.lock().unwrap().iter().cloned().collect();
    let after: HashSet<(String, WorkerId)> = after.lock().unwrap().iter().cloned().collect();
    assert_eq!(before, executed);
    assert_eq!(after, executed);
}

/// Retries report the worker of each individual attempt.
#[tokio::test]
async fn test_process_id_meta_on_retries() {
    let worker = MockWorker::failing();
    let config = RunConfig::new().with_worker_limit(3).with_retry_count(2);
    let controller = TestRunController::new(config, worker.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    controller
        .hooks()
        .after_test
        .read_hook("testPlugin", move |event: &AfterTest| {
            sink.lock()
                .unwrap()
                .push((event.unit.path.clone(), event.meta.process_id.clone()));
            Ok(())
        });

    controller.run_queue(generate_units(2)).await;

    let mut seen = seen.lock().unwrap().clone();
    let mut executed = worker.executions();
    seen.sort();
    executed.sort();
    assert_eq!(seen.len(), 6);
    assert_eq!(seen, executed);
}

/// The afterTest hook sees the worker error, and so does the outcome.
#[tokio::test]
async fn test_after_test_receives_error_instance() {
    let worker = MockWorker::failing();
    let config = RunConfig::new().with_worker_limit(1).with_bail(true);
    let controller = TestRunController::new(config, worker.clone());

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    controller
        .hooks()
        .after_test
        .write_hook("testPlugin", move |event: AfterTest| {
            sink.lock().unwrap().push(event.error.clone());
            async move { Ok(event) }
        });

    let outcome = controller.run_queue(generate_units(1)).await;

    assert_eq!(*errors.lock().unwrap(), vec![Some(worker.error_instance())]);
    assert_eq!(outcome.failures().len(), 1);
    assert_eq!(outcome.failures()[0].error, worker.error_instance());
}

/// A slow afterTest write hook finishes before its slot takes the next unit.
#[tokio::test]
async fn test_after_test_write_hook_awaited_before_slot_reuse() {
    let worker = MockWorker::new();
    let controller =
        TestRunController::new(RunConfig::new().with_worker_limit(1), worker.clone());

    let log = Arc::new(Mutex::new(Vec::new()));
    let before_log = Arc::clone(&log);
    let after_log = Arc::clone(&log);
    controller
        .hooks()
        .before_test
        .read_hook("order", move |event: &BeforeTest| {
            before_log
                .lock()
                .unwrap()
                .push(format!("before {}", event.unit.path));
            Ok(())
        });
    controller
        .hooks()
        .after_test
        .write_hook("order", move |event: AfterTest| {
            let log = Arc::clone(&after_log);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push(format!("after {}", event.unit.path));
                Ok(event)
            }
        });

    controller.run_queue(generate_units(2)).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "before qwerty-0.js",
            "after qwerty-0.js",
            "before qwerty-1.js",
            "after qwerty-1.js",
        ]
    );
}

//! In-memory worker used by tests and examples.
//!
//! Records how many instances were spawned, every execution and which
//! worker ran it, and the peak number of concurrently executing units.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{TestWorker, WorkerInstance};
use crate::error::WorkerError;
use crate::unit::{TestError, TestUnit, WorkerId};

/// Message carried by every failure the mock produces.
pub const MOCK_ERROR_MESSAGE: &str = "mock worker failure";

#[derive(Debug, Default)]
struct MockState {
    spawned: AtomicUsize,
    killed: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    executions: Mutex<Vec<(String, WorkerId)>>,
    failing_paths: Mutex<HashSet<String>>,
}

/// Fake worker factory. Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct MockWorker {
    state: Arc<MockState>,
    fail_all: bool,
    delay: Duration,
    spawn_limit: Option<usize>,
    fail_kill: bool,
}

impl MockWorker {
    /// A worker whose executions always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker whose executions always fail.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Keep each execution busy for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Let only the first `count` spawns succeed.
    pub fn fail_spawn_after(mut self, count: usize) -> Self {
        self.spawn_limit = Some(count);
        self
    }

    /// Make every `kill` report an error.
    pub fn with_failing_kill(mut self) -> Self {
        self.fail_kill = true;
        self
    }

    /// Fail only executions of the unit at `path`.
    pub fn fail_on(self, path: impl Into<String>) -> Self {
        if let Ok(mut paths) = self.state.failing_paths.lock() {
            paths.insert(path.into());
        }
        self
    }

    pub fn spawned_count(&self) -> usize {
        self.state.spawned.load(Ordering::SeqCst)
    }

    pub fn killed_count(&self) -> usize {
        self.state.killed.load(Ordering::SeqCst)
    }

    pub fn execution_count(&self) -> usize {
        self.executions().len()
    }

    /// Highest number of units that were executing at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// `(unit path, worker id)` for every execution, in completion order.
    pub fn executions(&self) -> Vec<(String, WorkerId)> {
        self.state
            .executions
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// The error every failing execution returns.
    pub fn error_instance(&self) -> TestError {
        TestError::new(MOCK_ERROR_MESSAGE)
    }
}

#[async_trait]
impl TestWorker for MockWorker {
    type Instance = MockInstance;

    async fn spawn(&self) -> Result<MockInstance, WorkerError> {
        if let Some(limit) = self.spawn_limit {
            if self.spawned_count() >= limit {
                return Err(WorkerError::Spawn(format!(
                    "mock spawn limit of {} reached",
                    limit
                )));
            }
        }
        let index = self.state.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(MockInstance {
            worker_id: WorkerId::new(format!("mock/{}", index)),
            worker: self.clone(),
        })
    }
}

/// Instance handed out by [`MockWorker`].
#[derive(Debug)]
pub struct MockInstance {
    worker_id: WorkerId,
    worker: MockWorker,
}

#[async_trait]
impl WorkerInstance for MockInstance {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    async fn execute(&self, unit: &TestUnit) -> Result<(), TestError> {
        let state = &self.worker.state;
        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(active, Ordering::SeqCst);

        if self.worker.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.worker.delay).await;
        }

        state.active.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut executions) = state.executions.lock() {
            executions.push((unit.path.clone(), self.worker_id.clone()));
        }

        let fails = self.worker.fail_all
            || state
                .failing_paths
                .lock()
                .map(|paths| paths.contains(&unit.path))
                .unwrap_or(false);
        if fails {
            Err(self.worker.error_instance())
        } else {
            Ok(())
        }
    }

    async fn kill(&self) -> Result<(), WorkerError> {
        self.worker.state.killed.fetch_add(1, Ordering::SeqCst);
        if self.worker.fail_kill {
            return Err(WorkerError::Kill {
                worker_id: self.worker_id.clone(),
                reason: "mock kill failure".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_mock_reports_error_instance() {
        let worker = MockWorker::failing();
        let instance = worker.spawn().await.unwrap();
        let err = instance.execute(&TestUnit::new("a", "")).await.unwrap_err();
        assert_eq!(err, worker.error_instance());
        assert_eq!(worker.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_on_targets_single_path() {
        let worker = MockWorker::new().fail_on("bad");
        let instance = worker.spawn().await.unwrap();
        assert!(instance.execute(&TestUnit::new("good", "")).await.is_ok());
        assert!(instance.execute(&TestUnit::new("bad", "")).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_limit_and_failing_kill() {
        let worker = MockWorker::new().fail_spawn_after(1).with_failing_kill();
        let instance = worker.spawn().await.unwrap();
        assert!(matches!(worker.spawn().await, Err(WorkerError::Spawn(_))));
        assert_eq!(worker.spawned_count(), 1);

        let err = instance.kill().await.unwrap_err();
        assert!(matches!(err, WorkerError::Kill { .. }));
        assert_eq!(worker.killed_count(), 1);
    }

    #[tokio::test]
    async fn test_executions_record_worker_identity() {
        let worker = MockWorker::new();
        let first = worker.spawn().await.unwrap();
        let second = worker.spawn().await.unwrap();
        first.execute(&TestUnit::new("x", "")).await.unwrap();
        second.execute(&TestUnit::new("y", "")).await.unwrap();

        assert_eq!(
            worker.executions(),
            vec![
                ("x".to_string(), WorkerId::from("mock/0")),
                ("y".to_string(), WorkerId::from("mock/1")),
            ]
        );
        assert_eq!(worker.spawned_count(), 2);
    }
}

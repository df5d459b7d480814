//! Worker that runs each unit as a child process.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{TestWorker, WorkerInstance};
use crate::error::WorkerError;
use crate::unit::{TestError, TestUnit, WorkerId};

/// Environment variable carrying the worker id into the child.
pub const WORKER_ID_ENV_VAR: &str = "TESTFLEET_WORKER_ID";

/// Runs `program args... <unit path>` for every unit.
#[derive(Debug)]
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    spawned: AtomicUsize,
}

impl ProcessWorker {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestWorker for ProcessWorker {
    type Instance = ProcessInstance;

    async fn spawn(&self) -> Result<ProcessInstance, WorkerError> {
        let index = self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessInstance {
            worker_id: WorkerId::new(format!("process/{}", index)),
            program: self.program.clone(),
            args: self.args.clone(),
        })
    }
}

/// One logical worker slot backed by short-lived child processes.
#[derive(Debug)]
pub struct ProcessInstance {
    worker_id: WorkerId,
    program: String,
    args: Vec<String>,
}

#[async_trait]
impl WorkerInstance for ProcessInstance {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    async fn execute(&self, unit: &TestUnit) -> Result<(), TestError> {
        debug!(worker_id = %self.worker_id, unit = %unit.path, program = %self.program, "Starting child");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&unit.path)
            .env(WORKER_ID_ENV_VAR, self.worker_id.as_str())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TestError::new(format!("Failed to start {}: {}", self.program, e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim();
        let mut message = format!("{} exited with {}", unit.path, output.status);
        if !detail.is_empty() {
            message.push_str(": ");
            message.push_str(detail);
        }
        Err(TestError::new(message))
    }

    async fn kill(&self) -> Result<(), WorkerError> {
        // Children are owned by their `execute` call and reaped there.
        Ok(())
    }
}

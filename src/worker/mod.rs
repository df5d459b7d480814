//! Worker processes that execute test units.
//!
//! The scheduler never talks to processes directly. It asks a [`TestWorker`]
//! to spawn one [`WorkerInstance`] per slot and sends units to it; how an
//! instance runs a unit (a child process, a remote agent, an in-memory fake)
//! is up to the implementation.

pub mod mock;
pub mod process;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::unit::{TestError, TestUnit, WorkerId};

pub use mock::MockWorker;
pub use process::ProcessWorker;

/// Factory for worker instances.
#[async_trait]
pub trait TestWorker: Send + Sync {
    type Instance: WorkerInstance + 'static;

    /// Start a new worker. Called at most once per slot per run.
    async fn spawn(&self) -> Result<Self::Instance, WorkerError>;
}

/// A running worker able to execute one unit at a time.
#[async_trait]
pub trait WorkerInstance: Send + Sync {
    /// Identity reported to hooks as `processID`.
    fn worker_id(&self) -> &WorkerId;

    /// Execute a unit to completion.
    async fn execute(&self, unit: &TestUnit) -> Result<(), TestError>;

    /// Tear the worker down at the end of a run.
    async fn kill(&self) -> Result<(), WorkerError>;
}

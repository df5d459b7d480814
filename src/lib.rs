//! Parallel test-unit execution across a bounded pool of workers.
//!
//! Two subsystems make up the core of the crate:
//!
//! - **Worker pool scheduler** ([`runner::TestRunController`]): dispatches
//!   test units to a fixed number of worker slots and applies retry and bail
//!   policies to failed attempts.
//! - **Write-access admission queue** ([`write_queue`]): arbitrates exclusive
//!   write slots (screenshot files and the like) between workers that talk to
//!   the controller only through messages.
//!
//! Both expose their lifecycle through typed [`hooks::Hook`] points rather
//! than dedicated subscription APIs.
//!
//! # Example
//!
//! ```ignore
//! use testfleet::config::RunConfig;
//! use testfleet::runner::TestRunController;
//! use testfleet::worker::ProcessWorker;
//!
//! let worker = ProcessWorker::new("node", Vec::<String>::new());
//! let controller = TestRunController::new(RunConfig::new().with_worker_limit(4), worker);
//!
//! let outcome = controller.run_queue(units).await;
//! if !outcome.is_success() {
//!     for failure in outcome.failures() {
//!         eprintln!("{}: {}", failure.unit.path, failure.error);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod runner;
pub mod transport;
pub mod unit;
pub mod worker;
pub mod write_queue;

pub use config::{FleetConfig, RunConfig, WriteQueueConfig};
pub use error::{ConfigError, QueueServerError, TransportError, WorkerError};
pub use hooks::{Hook, HookError, HookHandle};
pub use runner::{RunOutcome, TestRunController};
pub use unit::{TestError, TestUnit, UnitFailure, WorkerId};

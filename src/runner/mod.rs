//! Test run scheduling.
//!
//! - **policy**: pure retry/bail decision for a failed attempt
//! - **controller**: the worker pool that drives units to completion

pub mod controller;
pub mod policy;

pub use controller::{
    AfterTest, BeforeTest, ControllerHooks, RetryCheck, RunOutcome, TestMeta, TestRunController,
};
pub use policy::{decide, RetryDecision};

//! Retry and bail decisions for failed attempts.

/// What the scheduler should do with a unit whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queue the unit again after the retry delay.
    Retry,
    /// Out of attempts; record the failure in the outcome.
    Exhausted,
    /// Stop the whole run.
    Bail,
}

impl RetryDecision {
    pub fn as_label(&self) -> &'static str {
        match self {
            RetryDecision::Retry => "retry",
            RetryDecision::Exhausted => "exhausted",
            RetryDecision::Bail => "bail",
        }
    }
}

/// Decide the fate of a failed attempt.
///
/// `attempt` is zero-based: the first execution of a unit is attempt 0, so a
/// unit gets `retry_count + 1` executions in total before it is exhausted.
/// With `bail` set every failure stops the run.
pub fn decide(bail: bool, attempt: u32, retry_count: u32) -> RetryDecision {
    if bail {
        RetryDecision::Bail
    } else if attempt < retry_count {
        RetryDecision::Retry
    } else {
        RetryDecision::Exhausted
    }
}

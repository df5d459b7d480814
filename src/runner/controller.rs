//! Worker pool scheduler.
//!
//! [`TestRunController::run_queue`] drains a FIFO queue of test units across
//! `worker_limit` slots. Each slot lazily spawns one worker instance and
//! reuses it for every unit it runs. Completions, retry delays and the
//! dispatch step all happen on the caller's task, one event at a time, so
//! the slot table and the pending queue need no locking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::policy::{self, RetryDecision};
use crate::config::RunConfig;
use crate::hooks::{Hook, HookError};
use crate::unit::{TestError, TestUnit, UnitFailure, WorkerId};
use crate::worker::{TestWorker, WorkerInstance};

/// Per-attempt metadata handed to test hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestMeta {
    /// Worker that executes (or executed) the attempt.
    #[serde(rename = "processID")]
    pub process_id: WorkerId,
}

/// Payload of the `beforeTest` hook.
#[derive(Debug, Clone)]
pub struct BeforeTest {
    pub unit: TestUnit,
    pub meta: TestMeta,
    pub attempt: u32,
}

/// Payload of the `afterTest` hook.
#[derive(Debug, Clone)]
pub struct AfterTest {
    pub unit: TestUnit,
    pub error: Option<TestError>,
    pub meta: TestMeta,
    pub attempt: u32,
}

/// Payload of the `shouldNotRetry` hook. Set `skip_retry` to veto a retry.
#[derive(Debug, Clone)]
pub struct RetryCheck {
    pub unit: TestUnit,
    pub error: TestError,
    pub attempt: u32,
    pub skip_retry: bool,
}

/// Hook points exposed by the scheduler.
#[derive(Debug)]
pub struct ControllerHooks {
    /// Write hook over the initial unit list.
    pub before_run: Hook<Vec<TestUnit>>,
    pub before_test: Hook<BeforeTest>,
    /// Awaited before the slot that ran the attempt is reused.
    pub after_test: Hook<AfterTest>,
    pub should_not_retry: Hook<RetryCheck>,
    /// Read hooks observing the final outcome.
    pub after_run: Hook<RunOutcome>,
}

impl Default for ControllerHooks {
    fn default() -> Self {
        Self {
            before_run: Hook::new("beforeRun"),
            before_test: Hook::new("beforeTest"),
            after_test: Hook::new("afterTest"),
            should_not_retry: Hook::new("shouldNotRetry"),
            after_run: Hook::new("afterRun"),
        }
    }
}

/// Result of a run.
///
/// An empty failure list means every unit passed. After a bail the list
/// holds exactly the failure that triggered it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunOutcome {
    failures: Vec<UnitFailure>,
    bailed: bool,
    attempts: usize,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed units in the order their attempts were exhausted.
    pub fn failures(&self) -> &[UnitFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<UnitFailure> {
        self.failures
    }

    pub fn bailed(&self) -> bool {
        self.bailed
    }

    /// Execution attempts whose outcome the run accounted for.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

struct PendingUnit {
    unit: TestUnit,
    attempt: u32,
}

struct WorkerSlot<I> {
    instance: Option<Arc<I>>,
    busy: bool,
}

impl<I> Default for WorkerSlot<I> {
    fn default() -> Self {
        Self {
            instance: None,
            busy: false,
        }
    }
}

enum Event {
    Finished {
        slot: usize,
        unit: TestUnit,
        attempt: u32,
        result: Result<(), TestError>,
    },
    Requeue(PendingUnit),
}

/// Runs test units on a bounded pool of workers.
pub struct TestRunController<W: TestWorker> {
    config: RunConfig,
    worker: W,
    hooks: Arc<ControllerHooks>,
}

impl<W: TestWorker> TestRunController<W> {
    pub fn new(config: RunConfig, worker: W) -> Self {
        if config.worker_limit == 0 {
            warn!("worker_limit is 0, running with a single worker");
        }
        Self {
            config,
            worker,
            hooks: Arc::new(ControllerHooks::default()),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn hooks(&self) -> &ControllerHooks {
        &self.hooks
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    /// Execute every unit and report the ones that failed.
    ///
    /// Never fails: unit errors, hook errors raised during an attempt and
    /// worker spawn errors all end up as failed attempts.
    pub async fn run_queue(&self, units: Vec<TestUnit>) -> RunOutcome {
        let units = match self.hooks.before_run.call(units.clone()).await {
            Ok(units) => units,
            Err(err) => {
                warn!(error = %err, "beforeRun hook failed, using the original queue");
                units
            }
        };

        let worker_limit = self.config.worker_limit.max(1);
        info!(
            units = units.len(),
            worker_limit,
            bail = self.config.bail,
            retry_count = self.config.retry_count,
            "Starting run"
        );

        let mut pending: VecDeque<PendingUnit> = units
            .into_iter()
            .map(|unit| PendingUnit { unit, attempt: 0 })
            .collect();
        let mut slots: Vec<WorkerSlot<W::Instance>> =
            (0..worker_limit).map(|_| WorkerSlot::default()).collect();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Event>> = FuturesUnordered::new();
        let mut outcome = RunOutcome::default();

        loop {
            if !outcome.bailed {
                self.dispatch(&mut slots, &mut pending, &mut in_flight).await;
            }

            let Some(event) = in_flight.next().await else {
                break;
            };

            match event {
                Event::Finished {
                    slot,
                    unit,
                    attempt,
                    result,
                } => {
                    slots[slot].busy = false;
                    if outcome.bailed {
                        debug!(unit = %unit.path, "Discarding attempt finished after bail");
                        continue;
                    }
                    outcome.attempts += 1;

                    let error = match result {
                        Ok(()) => {
                            debug!(unit = %unit.path, attempt, "Unit passed");
                            continue;
                        }
                        Err(error) => error,
                    };

                    let decision = self.decide(&unit, &error, attempt).await;
                    warn!(
                        unit = %unit.path,
                        attempt,
                        error = %error,
                        decision = decision.as_label(),
                        "Unit failed"
                    );
                    match decision {
                        RetryDecision::Retry => {
                            in_flight.push(requeue_after(
                                PendingUnit {
                                    unit,
                                    attempt: attempt + 1,
                                },
                                self.config.retry_delay,
                            ));
                        }
                        RetryDecision::Exhausted => {
                            outcome.failures.push(UnitFailure { unit, error });
                        }
                        RetryDecision::Bail => {
                            outcome.failures = vec![UnitFailure { unit, error }];
                            outcome.bailed = true;
                            pending.clear();
                        }
                    }
                }
                Event::Requeue(next) => {
                    if !outcome.bailed {
                        pending.push_back(next);
                    }
                }
            }
        }

        self.kill_workers(slots).await;

        info!(
            failures = outcome.failures.len(),
            attempts = outcome.attempts,
            bailed = outcome.bailed,
            "Run finished"
        );
        if let Err(err) = self.hooks.after_run.notify(&outcome) {
            warn!(error = %err, "afterRun hook failed");
        }
        outcome
    }

    /// Fill idle slots from the head of the queue. Slots that already own
    /// a worker are preferred so retries do not spawn extra workers.
    async fn dispatch(
        &self,
        slots: &mut [WorkerSlot<W::Instance>],
        pending: &mut VecDeque<PendingUnit>,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, Event>>,
    ) {
        let mut idle: Vec<usize> = (0..slots.len()).filter(|&i| !slots[i].busy).collect();
        idle.sort_by_key(|&i| slots[i].instance.is_none());

        for index in idle {
            let Some(next) = pending.pop_front() else {
                break;
            };
            let slot = &mut slots[index];
            slot.busy = true;

            let instance = match &slot.instance {
                Some(instance) => Arc::clone(instance),
                None => match self.worker.spawn().await {
                    Ok(instance) => {
                        let instance = Arc::new(instance);
                        debug!(slot = index, worker_id = %instance.worker_id(), "Spawned worker");
                        slot.instance = Some(Arc::clone(&instance));
                        instance
                    }
                    Err(err) => {
                        warn!(slot = index, error = %err, "Failed to spawn worker");
                        in_flight.push(
                            future::ready(Event::Finished {
                                slot: index,
                                unit: next.unit,
                                attempt: next.attempt,
                                result: Err(TestError::new(err.to_string())),
                            })
                            .boxed(),
                        );
                        continue;
                    }
                },
            };

            debug!(
                unit = %next.unit.path,
                attempt = next.attempt,
                worker_id = %instance.worker_id(),
                "Dispatching unit"
            );
            in_flight.push(self.attempt(index, instance, next));
        }
    }

    fn attempt(
        &self,
        slot: usize,
        instance: Arc<W::Instance>,
        next: PendingUnit,
    ) -> BoxFuture<'static, Event> {
        let PendingUnit { unit, attempt } = next;
        let hooks = Arc::clone(&self.hooks);
        let timeout = self.config.test_timeout;
        let task_unit = unit.clone();

        let handle = tokio::spawn(async move {
            run_attempt(&hooks, instance.as_ref(), &task_unit, attempt, timeout).await
        });

        async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => Err(TestError::new(format!("Attempt aborted: {}", err))),
            };
            Event::Finished {
                slot,
                unit,
                attempt,
                result,
            }
        }
        .boxed()
    }

    async fn decide(&self, unit: &TestUnit, error: &TestError, attempt: u32) -> RetryDecision {
        let decision = policy::decide(self.config.bail, attempt, self.config.retry_count);
        if decision != RetryDecision::Retry {
            return decision;
        }

        let check = RetryCheck {
            unit: unit.clone(),
            error: error.clone(),
            attempt,
            skip_retry: false,
        };
        match self.hooks.should_not_retry.call(check).await {
            Ok(check) if check.skip_retry => RetryDecision::Exhausted,
            Ok(_) => RetryDecision::Retry,
            Err(err) => {
                warn!(error = %err, "shouldNotRetry hook failed, retrying");
                RetryDecision::Retry
            }
        }
    }

    async fn kill_workers(&self, slots: Vec<WorkerSlot<W::Instance>>) {
        for instance in slots.into_iter().filter_map(|slot| slot.instance) {
            if let Err(err) = instance.kill().await {
                warn!(worker_id = %instance.worker_id(), error = %err, "Failed to kill worker");
            }
        }
    }
}

async fn run_attempt<I: WorkerInstance>(
    hooks: &ControllerHooks,
    instance: &I,
    unit: &TestUnit,
    attempt: u32,
    timeout: Option<Duration>,
) -> Result<(), TestError> {
    let meta = TestMeta {
        process_id: instance.worker_id().clone(),
    };

    hooks
        .before_test
        .call(BeforeTest {
            unit: unit.clone(),
            meta: meta.clone(),
            attempt,
        })
        .await
        .map_err(hook_failure)?;

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, instance.execute(unit)).await {
            Ok(result) => result,
            Err(_) => Err(TestError::new(format!(
                "Test timed out after {}ms",
                limit.as_millis()
            ))),
        },
        None => instance.execute(unit).await,
    };

    hooks
        .after_test
        .call(AfterTest {
            unit: unit.clone(),
            error: result.as_ref().err().cloned(),
            meta,
            attempt,
        })
        .await
        .map_err(hook_failure)?;

    result
}

fn hook_failure(err: HookError) -> TestError {
    TestError::new(err.to_string())
}

fn requeue_after(next: PendingUnit, delay: Duration) -> BoxFuture<'static, Event> {
    async move {
        // Even a zero delay goes through the event loop so other slots
        // get serviced first.
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
        Event::Requeue(next)
    }
    .boxed()
}

//! Scenario executors: how many iterations of a worker run, when, and with what concurrency.
//!
//! Two policies are supported:
//!
//! - [`PerVuIterations`]: a fixed population of virtual users, each running a fixed number of
//!   iterations back to back, bounded by a maximum duration.
//! - [`RampingArrivalRate`]: iterations are launched on an [`ArrivalSchedule`] regardless of how
//!   long previous ones take. Concurrency is bounded by a pool of virtual users that grows on
//!   demand up to `max_vus`; launches beyond that are dropped or deferred.
//!
//! Either way, the executor records `iterations` and `iteration_duration` for every completed
//! iteration and `interrupted_iterations` for every iteration it had to cancel.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::metrics::{
    DROPPED_ITERATIONS, INTERRUPTED_ITERATIONS, ITERATION_DURATION, ITERATIONS, Metrics, Tags,
};
use crate::schedule::{ArrivalSchedule, Stage};
use crate::worker::{IterationContext, Worker};

/// Runs a fixed number of iterations on each of a fixed number of virtual users.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PerVuIterations {
    /// Number of concurrent virtual users.
    pub vus: usize,
    /// Iterations per virtual user.
    pub iterations: u64,
    /// Iterations still running after this long are interrupted.
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,
}

impl Default for PerVuIterations {
    fn default() -> Self {
        Self {
            vus: 1,
            iterations: 1,
            max_duration: Duration::from_secs(10 * 60),
        }
    }
}

/// What to do with a launch when every virtual user is busy and the pool cannot grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Saturation {
    /// Skip the launch and count it in `dropped_iterations`.
    #[default]
    Drop,
    /// Wait up to the given time for a virtual user to free up, then drop.
    Defer(#[serde(with = "humantime_serde")] Duration),
}

/// Launches iterations at a rate that ramps linearly through stages.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RampingArrivalRate {
    /// Iterations per time unit at the start.
    pub start_rate: u64,
    /// The period rates are given in.
    #[serde(with = "humantime_serde")]
    pub time_unit: Duration,
    /// Rate ramps, executed in order.
    pub stages: Vec<Stage>,
    /// Virtual users available from the start.
    pub pre_allocated_vus: usize,
    /// Upper bound the pool may grow to. Defaults to `pre_allocated_vus`.
    pub max_vus: Option<usize>,
    /// Behavior when the pool is exhausted.
    pub saturation: Saturation,
    /// Time iterations may keep running after the last stage before they are interrupted.
    #[serde(with = "humantime_serde")]
    pub graceful_stop: Duration,
}

impl Default for RampingArrivalRate {
    fn default() -> Self {
        Self {
            start_rate: 0,
            time_unit: Duration::from_secs(1),
            stages: Vec::new(),
            pre_allocated_vus: 1,
            max_vus: None,
            saturation: Saturation::Drop,
            graceful_stop: Duration::from_secs(30),
        }
    }
}

impl RampingArrivalRate {
    /// The effective upper bound of the virtual user pool.
    pub fn max_vus(&self) -> usize {
        self.max_vus.unwrap_or(self.pre_allocated_vus)
    }
}

/// The population policy of a scenario.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Executor {
    /// See [`PerVuIterations`].
    PerVuIterations(PerVuIterations),
    /// See [`RampingArrivalRate`].
    RampingArrivalRate(RampingArrivalRate),
}

impl Executor {
    /// A short name for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PerVuIterations(_) => "per-vu-iterations",
            Self::RampingArrivalRate(_) => "ramping-arrival-rate",
        }
    }

    /// Rejects parameters that cannot be scheduled.
    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let invalid = |reason| {
            Err(ConfigError::InvalidScenario {
                scenario: scenario.to_owned(),
                reason,
            })
        };

        match self {
            Self::PerVuIterations(config) => {
                if config.vus == 0 {
                    return invalid("vus must be greater than zero");
                }
            }
            Self::RampingArrivalRate(config) => {
                if config.time_unit.is_zero() {
                    return invalid("time_unit must be greater than zero");
                }
                if config.max_vus() == 0 {
                    return invalid("max_vus must be greater than zero");
                }
                if config.max_vus() < config.pre_allocated_vus {
                    return invalid("max_vus must not be lower than pre_allocated_vus");
                }
            }
        }

        Ok(())
    }
}

/// A named workload together with its population policy.
#[derive(Debug)]
pub struct Scenario {
    /// Name used in tags and reports.
    pub name: Arc<str>,
    /// How iterations are scheduled.
    pub executor: Executor,
    /// What each iteration does.
    pub worker: Arc<dyn Worker>,
}

/// Iteration totals of a finished scenario.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScenarioOutcome {
    /// The scenario name.
    pub name: String,
    /// The executor type.
    pub executor: &'static str,
    /// Iterations that ran to completion.
    pub completed: u64,
    /// Iterations cancelled by the executor.
    pub interrupted: u64,
    /// Launches skipped because no virtual user was available.
    pub dropped: u64,
    /// Wall-clock time the scenario took.
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    interrupted: u64,
    dropped: u64,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.completed += other.completed;
        self.interrupted += other.interrupted;
        self.dropped += other.dropped;
    }

    fn joined(&mut self, result: Result<IterationEnd, JoinError>) {
        match result {
            Ok(end) => self.count(end),
            Err(error) => {
                tracing::error!(error = &error as &dyn std::error::Error, "iteration panicked");
                self.interrupted += 1;
            }
        }
    }

    fn count(&mut self, end: IterationEnd) {
        match end {
            IterationEnd::Completed => self.completed += 1,
            IterationEnd::Interrupted => self.interrupted += 1,
        }
    }
}

/// How a single iteration finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IterationEnd {
    Completed,
    Interrupted,
}

/// Runs one iteration and records its duration.
async fn run_iteration(worker: &dyn Worker, ctx: &IterationContext) {
    let tags = ctx.tags();
    let start = Instant::now();
    worker.iterate(ctx).await;
    let elapsed = start.elapsed();
    ctx.metrics.record_duration(ITERATION_DURATION, &tags, elapsed);
    ctx.metrics.add(ITERATIONS, &tags, 1);
}

/// Runs one iteration unless `cancel` fires or `deadline` passes first.
///
/// The iteration is polled first, so a worker that stops itself at the deadline completes.
async fn run_bounded(
    worker: &dyn Worker,
    ctx: &IterationContext,
    deadline: Instant,
    cancel: &CancellationToken,
) -> IterationEnd {
    tokio::select! {
        biased;
        _ = run_iteration(worker, ctx) => IterationEnd::Completed,
        _ = cancel.cancelled() => IterationEnd::Interrupted,
        _ = tokio::time::sleep_until(deadline) => IterationEnd::Interrupted,
    }
}

/// Runs the scenario to completion, or until `cancel` fires.
pub async fn run_scenario(
    scenario: &Scenario,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> ScenarioOutcome {
    let start = Instant::now();
    tracing::info!(
        scenario = %scenario.name,
        executor = scenario.executor.kind(),
        "scenario started"
    );

    let tally = match &scenario.executor {
        Executor::PerVuIterations(config) => {
            run_per_vu_iterations(config, scenario, &metrics, &cancel).await
        }
        Executor::RampingArrivalRate(config) => {
            run_ramping_arrival_rate(config, scenario, &metrics, &cancel).await
        }
    };

    let tags = Tags::scenario(&scenario.name);
    if tally.interrupted > 0 {
        metrics.add(INTERRUPTED_ITERATIONS, &tags, tally.interrupted);
    }

    let outcome = ScenarioOutcome {
        name: scenario.name.to_string(),
        executor: scenario.executor.kind(),
        completed: tally.completed,
        interrupted: tally.interrupted,
        dropped: tally.dropped,
        elapsed: start.elapsed(),
    };
    tracing::info!(
        scenario = %scenario.name,
        completed = outcome.completed,
        interrupted = outcome.interrupted,
        dropped = outcome.dropped,
        "scenario finished"
    );

    outcome
}

async fn run_per_vu_iterations(
    config: &PerVuIterations,
    scenario: &Scenario,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
) -> Tally {
    let deadline = Instant::now() + config.max_duration;
    let mut vus = JoinSet::new();

    for _ in 0..config.vus {
        let worker = Arc::clone(&scenario.worker);
        let name = Arc::clone(&scenario.name);
        let metrics = Arc::clone(metrics);
        let cancel = cancel.clone();
        let iterations = config.iterations;

        vus.spawn(async move {
            let mut tally = Tally::default();
            for iteration in 0..iterations {
                let ctx = IterationContext {
                    scenario: Arc::clone(&name),
                    iteration,
                    deadline: Some(deadline),
                    metrics: Arc::clone(&metrics),
                };

                let end = run_bounded(worker.as_ref(), &ctx, deadline, &cancel).await;
                tally.count(end);
                if end == IterationEnd::Interrupted {
                    break;
                }
            }
            tally
        });
    }

    let mut tally = Tally::default();
    while let Some(result) = vus.join_next().await {
        match result {
            Ok(vu) => tally.merge(vu),
            Err(error) => {
                tracing::error!(error = &error as &dyn std::error::Error, "virtual user panicked");
                tally.interrupted += 1;
            }
        }
    }
    tally
}

/// A pool of virtual users that grows on demand up to a ceiling.
#[derive(Debug)]
struct VuPool {
    semaphore: Arc<Semaphore>,
    allocated: usize,
    max: usize,
}

impl VuPool {
    fn new(pre_allocated: usize, max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(pre_allocated)),
            allocated: pre_allocated,
            max,
        }
    }

    /// Returns a free virtual user, or `None` if the launch has to be dropped or `cancel` fired
    /// while waiting.
    async fn acquire(
        &mut self,
        saturation: Saturation,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Some(permit);
        }

        if self.allocated < self.max {
            self.allocated += 1;
            self.semaphore.add_permits(1);
            tracing::debug!(vus = self.allocated, "allocated virtual user");
            return Arc::clone(&self.semaphore).try_acquire_owned().ok();
        }

        match saturation {
            Saturation::Drop => None,
            Saturation::Defer(max_delay) => {
                let acquire = Arc::clone(&self.semaphore).acquire_owned();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = tokio::time::timeout(max_delay, acquire) => {
                        permit.ok().and_then(Result::ok)
                    }
                }
            }
        }
    }
}

async fn run_ramping_arrival_rate(
    config: &RampingArrivalRate,
    scenario: &Scenario,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
) -> Tally {
    let start = Instant::now();
    let schedule = ArrivalSchedule::new(config.start_rate, config.time_unit, &config.stages);
    let schedule_end = start + schedule.duration();
    let deadline = schedule_end + config.graceful_stop;
    let tags = Tags::scenario(&scenario.name);

    let mut pool = VuPool::new(config.pre_allocated_vus, config.max_vus());
    let mut iterations = JoinSet::new();
    let mut tally = Tally::default();

    for (iteration, offset) in (0u64..).zip(schedule) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(start + offset) => {}
        }

        while let Some(result) = iterations.try_join_next() {
            tally.joined(result);
        }

        let Some(permit) = pool.acquire(config.saturation, cancel).await else {
            if cancel.is_cancelled() {
                break;
            }
            tracing::debug!(
                scenario = %scenario.name,
                iteration,
                "no virtual user available, dropping iteration"
            );
            metrics.add(DROPPED_ITERATIONS, &tags, 1);
            tally.dropped += 1;
            continue;
        };

        let worker = Arc::clone(&scenario.worker);
        let cancel = cancel.clone();
        let ctx = IterationContext {
            scenario: Arc::clone(&scenario.name),
            iteration,
            deadline: Some(deadline),
            metrics: Arc::clone(metrics),
        };
        iterations.spawn(async move {
            let end = run_bounded(worker.as_ref(), &ctx, deadline, &cancel).await;
            drop(permit);
            end
        });
    }

    // The scenario lasts for all stages even if the last launch happens earlier.
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep_until(schedule_end) => {}
    }

    // Every iteration ends by the graceful stop deadline at the latest.
    while let Some(result) = iterations.join_next().await {
        tally.joined(result);
    }

    tally
}

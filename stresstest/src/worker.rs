//! The unit of work that executors schedule.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::metrics::{Metrics, Tags};

/// Everything a worker needs to know about the iteration it runs.
#[derive(Clone, Debug)]
pub struct IterationContext {
    /// Name of the scenario the iteration belongs to.
    pub scenario: Arc<str>,
    /// Zero-based iteration number, counted per virtual user or per scenario depending on the
    /// executor.
    pub iteration: u64,
    /// The point at which the executor will interrupt the iteration, if any.
    pub deadline: Option<Instant>,
    /// The registry to record samples into.
    pub metrics: Arc<Metrics>,
}

impl IterationContext {
    /// Tags identifying the scenario.
    pub fn tags(&self) -> Tags {
        Tags::scenario(&self.scenario)
    }

    /// Returns `now + budget`, capped at the executor's deadline.
    pub fn deadline_within(&self, budget: Duration) -> Instant {
        let own = Instant::now() + budget;
        match self.deadline {
            Some(deadline) => own.min(deadline),
            None => own,
        }
    }
}

/// A workload function executed once per iteration.
///
/// Workers report failures through checks on the [`IterationContext::metrics`] and never fail
/// the iteration itself.
#[async_trait]
pub trait Worker: fmt::Debug + Send + Sync {
    /// Runs one iteration.
    async fn iterate(&self, ctx: &IterationContext);
}

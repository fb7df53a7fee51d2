//! Run scenarios concurrently against the broker cluster and summarize the results.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Exec};
use crate::error::ConfigError;
use crate::executor::{self, Scenario};
use crate::metrics::{GRPC_REQ_DURATION, Metrics, Stat};
use crate::publisher::Publisher;
use crate::remote::GrpcRemote;
use crate::report::RunSummary;
use crate::subscriber::Subscriber;
use crate::thresholds::Thresholds;
use crate::values::{RandomValues, ValueSource};
use crate::worker::Worker;

/// Everything needed to run, validated up front.
#[derive(Debug)]
pub struct TestPlan {
    /// Scenarios to run concurrently.
    pub scenarios: Vec<Scenario>,
    /// Conditions evaluated after the run.
    pub thresholds: Thresholds,
    /// Aggregates printed for trend metrics.
    pub trend_stats: Vec<Stat>,
}

impl TestPlan {
    /// Builds a plan from configuration.
    ///
    /// If `only` is not empty, just the named scenarios are included. Every problem with the
    /// configuration is reported here, before any worker starts.
    pub fn from_config(config: &Config, only: &[String]) -> Result<Self, ConfigError> {
        if let Some(unknown) = only.iter().find(|name| !config.scenarios.contains_key(*name)) {
            return Err(ConfigError::UnknownScenario(unknown.clone()));
        }
        if config.publisher.body_size.as_u64() == 0 {
            return Err(ConfigError::EmptyBody);
        }

        let values: Arc<dyn ValueSource> = Arc::new(RandomValues::new(
            config.nodes.clone(),
            config.topics.clone(),
        )?);

        let mut remote = GrpcRemote::new().with_connect_timeout(config.connect_timeout);
        if let Some(ref credentials) = config.auth {
            remote = remote.with_credentials(credentials)?;
        }
        let remote = Arc::new(remote);

        let mut scenarios = Vec::new();
        for (name, scenario) in &config.scenarios {
            if !only.is_empty() && !only.contains(name) {
                continue;
            }
            scenario.executor.validate(name)?;

            let worker: Arc<dyn Worker> = match scenario.exec {
                Exec::Publisher => Arc::new(
                    Publisher::new(
                        Arc::clone(&remote),
                        Arc::clone(&values),
                        config.publisher.body_size.as_u64() as usize,
                    )
                    .with_think_time(config.publisher.think_time),
                ),
                Exec::Subscriber => Arc::new(
                    Subscriber::new(
                        Arc::clone(&remote),
                        Arc::clone(&values),
                        config.subscriber.stream_timeout,
                    )
                    .with_cursor(config.subscriber.cursor),
                ),
            };

            scenarios.push(Scenario {
                name: name.as_str().into(),
                executor: scenario.executor.clone(),
                worker,
            });
        }
        if scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }

        let mut thresholds = Thresholds::builder();
        for (selector, conditions) in &config.thresholds {
            for condition in conditions {
                thresholds = thresholds.threshold(selector, condition)?;
            }
        }
        let thresholds = thresholds
            .scenario_sub_metrics(GRPC_REQ_DURATION, scenarios.iter().map(|s| &*s.name))
            .build();

        let trend_stats = config
            .summary_trend_stats
            .iter()
            .map(|stat| {
                stat.parse().map_err(|source| ConfigError::InvalidTrendStat {
                    stat: stat.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            scenarios,
            thresholds,
            trend_stats,
        })
    }
}

/// Runs all scenarios of the plan concurrently and evaluates the thresholds.
///
/// Cancelling the token interrupts all in-flight iterations; the summary still covers
/// everything recorded until then.
pub async fn run(plan: TestPlan, cancel: CancellationToken) -> RunSummary {
    let metrics = Arc::new(Metrics::new());
    let start = Instant::now();

    let bar = ProgressBar::new_spinner()
        .with_style(
            ProgressStyle::with_template("{spinner} {msg} {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        )
        .with_message("Running stresstest:");
    bar.enable_steady_tick(Duration::from_millis(100));

    // run the scenarios concurrently
    let tasks: Vec<_> = plan
        .scenarios
        .into_iter()
        .map(|scenario| {
            let metrics = Arc::clone(&metrics);
            let cancel = cancel.clone();
            tokio::spawn(async move { executor::run_scenario(&scenario, metrics, cancel).await })
        })
        .collect();

    let finished_tasks = futures::future::join_all(tasks).await;
    bar.finish_and_clear();

    let mut outcomes = Vec::with_capacity(finished_tasks.len());
    for task in finished_tasks {
        match task {
            Ok(outcome) => outcomes.push(outcome),
            Err(error) => {
                tracing::error!(error = &error as &dyn std::error::Error, "scenario panicked")
            }
        }
    }

    let thresholds = plan.thresholds.evaluate(&metrics);
    RunSummary::new(
        outcomes,
        thresholds,
        plan.trend_stats,
        start.elapsed(),
        metrics,
    )
}

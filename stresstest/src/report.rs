//! The end-of-run summary.

use std::sync::Arc;
use std::time::Duration;

use yansi::Paint;

use crate::executor::ScenarioOutcome;
use crate::metrics::{CheckSummary, MetricKind, Metrics, Selector, Stat};
use crate::thresholds::{Outcome, ThresholdResult};

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// Iteration totals per scenario, in configuration order.
    pub scenarios: Vec<ScenarioOutcome>,
    /// Pass/fail totals of every check.
    pub checks: Vec<CheckSummary>,
    /// Every evaluated threshold condition.
    pub thresholds: Vec<ThresholdResult>,
    /// Aggregates printed for trend metrics.
    pub trend_stats: Vec<Stat>,
    /// Wall-clock time of the run.
    pub elapsed: Duration,
    metrics: Arc<Metrics>,
}

impl RunSummary {
    pub(crate) fn new(
        scenarios: Vec<ScenarioOutcome>,
        thresholds: Vec<ThresholdResult>,
        trend_stats: Vec<Stat>,
        elapsed: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            scenarios,
            checks: metrics.checks(),
            thresholds,
            trend_stats,
            elapsed,
            metrics,
        }
    }

    /// The registry the run recorded into.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Number of failed checks across all scenarios.
    pub fn failed_checks(&self) -> u64 {
        self.checks.iter().map(|check| check.fails).sum()
    }

    /// A run passes when no check and no threshold failed.
    pub fn passed(&self) -> bool {
        self.failed_checks() == 0 && self.thresholds.iter().all(ThresholdResult::passed)
    }

    /// Prints the summary to stdout.
    pub fn print(&self) {
        for scenario in &self.scenarios {
            println!();
            println!(
                "{} {} ({}, {:.2?})",
                "## Scenario".bold(),
                scenario.name.bold().blue(),
                scenario.executor,
                scenario.elapsed,
            );
            print!("  {} iterations completed", scenario.completed.bold());
            if scenario.interrupted > 0 {
                print!(", {}", format!("{} interrupted", scenario.interrupted).yellow());
            }
            if scenario.dropped > 0 {
                print!(", {}", format!("{} dropped", scenario.dropped).yellow());
            }
            println!();
        }

        println!();
        println!("{}", "## CHECKS".bold());
        if self.checks.is_empty() {
            println!("  (none)");
        }
        for check in &self.checks {
            let total = check.passes + check.fails;
            if check.fails == 0 {
                println!(
                    "  {} {} [{}] {}/{}",
                    "✓".green(),
                    check.name,
                    check.scenario.dim(),
                    check.passes,
                    total
                );
            } else {
                println!(
                    "  {} {} [{}] {}/{} ({})",
                    "✗".red(),
                    check.name.red(),
                    check.scenario.dim(),
                    check.passes,
                    total,
                    format!("{} failed", check.fails).bold().red()
                );
            }
        }

        println!();
        println!("{}", "## METRICS".bold());
        for name in self.metrics.metric_names() {
            self.print_metric(&Selector::new(name, Default::default()));
        }
        for result in &self.thresholds {
            if !result.selector.tags().is_empty() {
                self.print_metric(&result.selector);
            }
        }

        if !self.thresholds.is_empty() {
            println!();
            println!("{}", "## THRESHOLDS".bold());
        }
        for result in &self.thresholds {
            let line = format!("{} {}", result.selector, result.condition);
            match result.outcome {
                Outcome::Passed(value) => println!("  {} {line} ({value:.2})", "✓".green()),
                Outcome::Failed(value) => {
                    println!("  {} {} ({value:.2})", "✗".red(), line.red())
                }
                Outcome::NoData => println!("  {} {line} ({})", "-".dim(), "no data".dim()),
            }
        }

        println!();
        if self.passed() {
            println!("{} in {:.2?}", "PASSED".bold().green(), self.elapsed);
        } else {
            println!("{} in {:.2?}", "FAILED".bold().red(), self.elapsed);
        }
    }

    fn print_metric(&self, selector: &Selector) {
        let aggregate = self.metrics.aggregate(selector);
        let stats: &[Stat] = match aggregate.kind() {
            Some(MetricKind::Trend) => &self.trend_stats,
            Some(MetricKind::Counter) => &[Stat::Count, Stat::Rate],
            Some(MetricKind::Rate) => &[Stat::Rate, Stat::Count],
            None => &[Stat::Count],
        };

        let values: Vec<_> = stats
            .iter()
            .map(|stat| match aggregate.value(*stat) {
                Some(value) => format!("{stat}={}", format_value(aggregate.kind(), *stat, value)),
                None => format!("{stat}=-"),
            })
            .collect();

        println!("  {:.<48} {}", format!("{selector} "), values.join(" "));
    }
}

fn format_value(kind: Option<MetricKind>, stat: Stat, value: f64) -> String {
    match (kind, stat) {
        (_, Stat::Count) => format!("{value}"),
        (Some(MetricKind::Trend), _) => format!("{:.2?}", Duration::from_secs_f64(value / 1000.0)),
        (Some(MetricKind::Rate), Stat::Rate) => format!("{:.2}%", value * 100.0),
        (_, Stat::Rate) => format!("{value:.2}/s"),
        _ => format!("{value:.2}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{GRPC_REQ_DURATION, Tags};
    use crate::thresholds::Thresholds;

    fn summary(metrics: Metrics, thresholds: Thresholds) -> RunSummary {
        let metrics = Arc::new(metrics);
        let results = thresholds.evaluate(&metrics);
        RunSummary::new(vec![], results, vec![Stat::Avg, Stat::Max], Duration::ZERO, metrics)
    }

    #[test]
    fn passes_without_failures() {
        let metrics = Metrics::new();
        let tags = Tags::scenario("publisher");
        metrics.check(&tags, "publish is successful", true);
        metrics.record(GRPC_REQ_DURATION, &tags, 5.0);

        let thresholds = Thresholds::builder()
            .scenario_sub_metrics(GRPC_REQ_DURATION, ["publisher", "subscriber"])
            .build();

        let summary = summary(metrics, thresholds);
        assert!(summary.passed());
        assert_eq!(summary.failed_checks(), 0);
        summary.print();
    }

    #[test]
    fn failed_check_fails_run() {
        let metrics = Metrics::new();
        metrics.check(&Tags::scenario("publisher"), "publish is successful", false);

        let summary = summary(metrics, Thresholds::default());
        assert!(!summary.passed());
        assert_eq!(summary.failed_checks(), 1);
    }

    #[test]
    fn failed_threshold_fails_run() {
        let metrics = Metrics::new();
        metrics.record(GRPC_REQ_DURATION, &Tags::scenario("publisher"), 900.0);

        let thresholds = Thresholds::builder()
            .threshold("grpc_req_duration", "p(95)<500")
            .unwrap()
            .build();

        let summary = summary(metrics, thresholds);
        assert!(!summary.passed());
        summary.print();
    }

    #[test]
    fn formats_values() {
        assert_eq!(format_value(Some(MetricKind::Trend), Stat::Count, 3.0), "3");
        assert_eq!(format_value(Some(MetricKind::Trend), Stat::Avg, 1.5), "1.50ms");
        assert_eq!(format_value(Some(MetricKind::Rate), Stat::Rate, 0.5), "50.00%");
        assert_eq!(format_value(Some(MetricKind::Counter), Stat::Rate, 2.0), "2.00/s");
    }
}

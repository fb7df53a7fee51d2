//! The metrics registry all workers record into.
//!
//! Every sample belongs to a series identified by a metric name and a set of [`Tags`]. Trends are
//! kept in a [`DDSketch`] per series, counters and rates as plain sums. Nothing is aggregated
//! until a [`Selector`] asks for it: the selector's tags pick all series that carry them, and
//! their data is merged into a single [`Aggregate`].
//!
//! The registry sits behind a single lock, which keeps recording from any number of concurrent
//! workers exact: no sample is lost or counted twice.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sketches_ddsketch::DDSketch;
use thiserror::Error;

/// Duration of unary calls and of opening a subscription stream, in milliseconds.
pub const GRPC_REQ_DURATION: &str = "grpc_req_duration";
/// Lifetime of a subscription stream from opening to termination, in milliseconds.
pub const GRPC_STREAM_DURATION: &str = "grpc_stream_duration";
/// Number of subscription streams opened.
pub const GRPC_STREAMS: &str = "grpc_streams";
/// Number of messages received over subscription streams.
pub const GRPC_STREAMS_MSGS_RECEIVED: &str = "grpc_streams_msgs_received";
/// Duration of a full worker iteration, in milliseconds.
pub const ITERATION_DURATION: &str = "iteration_duration";
/// Number of iterations that ran to completion.
pub const ITERATIONS: &str = "iterations";
/// Number of iterations not started because no virtual user was available.
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
/// Number of iterations cancelled by the executor before they completed.
pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
/// Outcome of every check, tagged with the check name.
pub const CHECKS: &str = "checks";

/// Tag key for the scenario a sample was recorded in.
pub const TAG_SCENARIO: &str = "scenario";
/// Tag key for the topic a sample relates to.
pub const TAG_TOPIC: &str = "topic";
/// Tag key for the check name on [`CHECKS`].
pub const TAG_CHECK: &str = "check";

/// An expression could not be parsed.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{0}")]
pub struct ExpressionError(&'static str);

impl ExpressionError {
    pub(crate) fn new(reason: &'static str) -> Self {
        Self(reason)
    }
}

/// A set of `key:value` labels attached to a series.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    /// Creates an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tag set naming the scenario.
    pub fn scenario(name: &str) -> Self {
        Self::new().with(TAG_SCENARIO, name)
    }

    /// Adds or replaces a tag.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    /// Returns the value of a tag.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns `true` if every tag in `other` is present here with the same value.
    pub fn contains(&self, other: &Tags) -> bool {
        other
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }

    /// Returns `true` if there are no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (key, value)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}:{value}")?;
        }
        f.write_str("}")
    }
}

/// Picks the series of one metric, optionally narrowed down by tags.
///
/// Written as `name` or `name{key:value,...}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Selector {
    metric: String,
    tags: Tags,
}

impl Selector {
    /// Selects all series of `metric` that carry `tags`.
    pub fn new(metric: impl Into<String>, tags: Tags) -> Self {
        Self {
            metric: metric.into(),
            tags,
        }
    }

    /// The metric name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// The tags a series must carry to be selected.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    fn matches(&self, key: &SeriesKey) -> bool {
        key.metric == self.metric && key.tags.contains(&self.tags)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric)?;
        if !self.tags.is_empty() {
            write!(f, "{}", self.tags)?;
        }
        Ok(())
    }
}

impl FromStr for Selector {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((metric, rest)) = s.split_once('{') else {
            if s.is_empty() {
                return Err(ExpressionError("metric name is empty"));
            }
            return Ok(Self::new(s, Tags::new()));
        };

        let metric = metric.trim();
        if metric.is_empty() {
            return Err(ExpressionError("metric name is empty"));
        }
        let body = rest
            .strip_suffix('}')
            .ok_or(ExpressionError("tag list is not closed with `}`"))?;

        let mut tags = Tags::new();
        for tag in body.split(',').filter(|tag| !tag.trim().is_empty()) {
            let (key, value) = tag
                .split_once(':')
                .ok_or(ExpressionError("tags must be written as `key:value`"))?;
            tags = tags.with(key.trim(), value.trim());
        }

        Ok(Self::new(metric, tags))
    }
}

/// An aggregate that can be computed over selected series.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Stat {
    /// Arithmetic mean of a trend.
    Avg,
    /// Smallest value of a trend.
    Min,
    /// Median of a trend.
    Med,
    /// Largest value of a trend.
    Max,
    /// Percentile of a trend, between 0 and 100.
    Percentile(f64),
    /// Number of samples; the total of a counter.
    Count,
    /// Counter total per second of run time; the pass fraction of a rate.
    Rate,
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Med => f.write_str("med"),
            Self::Max => f.write_str("max"),
            Self::Percentile(p) => write!(f, "p({p})"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
        }
    }
}

impl FromStr for Stat {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stat = match s.trim() {
            "avg" => Self::Avg,
            "min" => Self::Min,
            "med" => Self::Med,
            "max" => Self::Max,
            "count" => Self::Count,
            "rate" => Self::Rate,
            other => {
                let percentile = other
                    .strip_prefix("p(")
                    .and_then(|p| p.strip_suffix(')'))
                    .and_then(|p| p.trim().parse::<f64>().ok())
                    .ok_or(ExpressionError("unknown aggregate"))?;
                if !(0.0..=100.0).contains(&percentile) {
                    return Err(ExpressionError("percentile must be between 0 and 100"));
                }
                Self::Percentile(percentile)
            }
        };

        Ok(stat)
    }
}

/// How the samples of a metric are accumulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// A distribution of values.
    Trend,
    /// A monotonically growing sum.
    Counter,
    /// The fraction of passing boolean samples.
    Rate,
}

/// The merged data of all series picked by a [`Selector`].
#[derive(Clone)]
pub enum Aggregate {
    /// No series matched.
    Empty,
    /// Merged trend sketch.
    Trend(DDSketch),
    /// Counter total and the time it accumulated over.
    Counter {
        /// Sum of all increments.
        total: f64,
        /// Time since the registry was created.
        elapsed: Duration,
    },
    /// Boolean outcomes.
    Rate {
        /// Number of passing samples.
        passes: u64,
        /// Number of failing samples.
        fails: u64,
    },
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Trend(sketch) => f.debug_tuple("Trend").field(&SketchSummary(sketch)).finish(),
            Self::Counter { total, elapsed } => f
                .debug_struct("Counter")
                .field("total", total)
                .field("elapsed", elapsed)
                .finish(),
            Self::Rate { passes, fails } => f
                .debug_struct("Rate")
                .field("passes", passes)
                .field("fails", fails)
                .finish(),
        }
    }
}

/// Prints the exact parts of a sketch.
struct SketchSummary<'a>(&'a DDSketch);

impl fmt::Debug for SketchSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DDSketch")
            .field("count", &self.0.count())
            .field("min", &self.0.min())
            .field("max", &self.0.max())
            .finish()
    }
}

impl Aggregate {
    /// The kind of the selected metric, if any series matched.
    pub fn kind(&self) -> Option<MetricKind> {
        match self {
            Self::Empty => None,
            Self::Trend(_) => Some(MetricKind::Trend),
            Self::Counter { .. } => Some(MetricKind::Counter),
            Self::Rate { .. } => Some(MetricKind::Rate),
        }
    }

    /// Computes `stat`, or `None` if it is undefined for this data.
    pub fn value(&self, stat: Stat) -> Option<f64> {
        match (self, stat) {
            (Self::Empty, Stat::Count) => Some(0.0),
            (Self::Empty, _) => None,

            (Self::Trend(sketch), Stat::Count) => Some(sketch.count() as f64),
            (Self::Trend(sketch), Stat::Avg) => {
                let count = sketch.count();
                (count > 0).then(|| sketch.sum().unwrap_or_default() / count as f64)
            }
            (Self::Trend(sketch), Stat::Min) => sketch.min(),
            (Self::Trend(sketch), Stat::Max) => sketch.max(),
            (Self::Trend(sketch), Stat::Med) => sketch.quantile(0.5).ok().flatten(),
            (Self::Trend(sketch), Stat::Percentile(p)) => {
                sketch.quantile(p / 100.0).ok().flatten()
            }
            (Self::Trend(_), Stat::Rate) => None,

            (Self::Counter { total, .. }, Stat::Count) => Some(*total),
            (Self::Counter { total, elapsed }, Stat::Rate) => {
                let secs = elapsed.as_secs_f64();
                (secs > 0.0).then(|| total / secs)
            }
            (Self::Counter { .. }, _) => None,

            (Self::Rate { passes, fails }, Stat::Count) => Some((passes + fails) as f64),
            (Self::Rate { passes, fails }, Stat::Rate) => {
                let total = passes + fails;
                (total > 0).then(|| *passes as f64 / total as f64)
            }
            (Self::Rate { .. }, _) => None,
        }
    }

    fn merge(&mut self, series: &Series, elapsed: Duration) {
        match (self, series) {
            (this @ Self::Empty, Series::Trend(sketch)) => *this = Self::Trend(sketch.clone()),
            (this @ Self::Empty, Series::Counter(value)) => {
                *this = Self::Counter {
                    total: *value,
                    elapsed,
                }
            }
            (this @ Self::Empty, Series::Rate { passes, fails }) => {
                *this = Self::Rate {
                    passes: *passes,
                    fails: *fails,
                }
            }
            (Self::Trend(merged), Series::Trend(sketch)) => {
                // All sketches share the default configuration, so merging cannot fail.
                merged.merge(sketch).ok();
            }
            (Self::Counter { total, .. }, Series::Counter(value)) => *total += value,
            (Self::Rate { passes, fails }, Series::Rate { passes: p, fails: f }) => {
                *passes += p;
                *fails += f;
            }
            _ => {}
        }
    }
}

/// Pass/fail totals of one check within one scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckSummary {
    /// The scenario the check ran in.
    pub scenario: String,
    /// The check name.
    pub name: String,
    /// Number of times the check held.
    pub passes: u64,
    /// Number of times the check failed.
    pub fails: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SeriesKey {
    metric: &'static str,
    tags: Tags,
}

#[derive(Clone)]
enum Series {
    Trend(DDSketch),
    Counter(f64),
    Rate { passes: u64, fails: u64 },
}

impl fmt::Debug for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trend(sketch) => f.debug_tuple("Trend").field(&SketchSummary(sketch)).finish(),
            Self::Counter(total) => f.debug_tuple("Counter").field(total).finish(),
            Self::Rate { passes, fails } => f
                .debug_struct("Rate")
                .field("passes", passes)
                .field("fails", fails)
                .finish(),
        }
    }
}

impl Series {
    fn kind(&self) -> MetricKind {
        match self {
            Self::Trend(_) => MetricKind::Trend,
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
        }
    }
}

/// Concurrency-safe sink for all samples of a run.
#[derive(Debug)]
pub struct Metrics {
    series: Mutex<HashMap<SeriesKey, Series>>,
    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates an empty registry. Counter rates are computed relative to this moment.
    pub fn new() -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SeriesKey, Series>> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(
        &self,
        metric: &'static str,
        tags: &Tags,
        init: fn() -> Series,
        f: impl FnOnce(&mut Series),
    ) {
        let mut series = self.lock();
        let key = SeriesKey {
            metric,
            tags: tags.clone(),
        };
        let entry = series.entry(key).or_insert_with(init);
        f(entry);
    }

    /// Adds a value to a trend.
    pub fn record(&self, metric: &'static str, tags: &Tags, value: f64) {
        self.update(
            metric,
            tags,
            || Series::Trend(DDSketch::default()),
            |series| match series {
                Series::Trend(sketch) => sketch.add(value),
                other => tracing::error!(metric, kind = ?other.kind(), "trend sample on non-trend"),
            },
        );
    }

    /// Adds a duration to a trend, in milliseconds.
    pub fn record_duration(&self, metric: &'static str, tags: &Tags, duration: Duration) {
        self.record(metric, tags, duration.as_secs_f64() * 1000.0);
    }

    /// Increments a counter.
    pub fn add(&self, metric: &'static str, tags: &Tags, value: u64) {
        self.update(
            metric,
            tags,
            || Series::Counter(0.0),
            |series| match series {
                Series::Counter(total) => *total += value as f64,
                other => {
                    tracing::error!(metric, kind = ?other.kind(), "counter sample on non-counter")
                }
            },
        );
    }

    /// Records the outcome of a named check and returns it.
    pub fn check(&self, tags: &Tags, name: &'static str, passed: bool) -> bool {
        let tags = tags.clone().with(TAG_CHECK, name);
        self.update(
            CHECKS,
            &tags,
            || Series::Rate {
                passes: 0,
                fails: 0,
            },
            |series| match series {
                Series::Rate { passes, fails } => {
                    if passed {
                        *passes += 1;
                    } else {
                        *fails += 1;
                    }
                }
                other => tracing::error!(kind = ?other.kind(), "check sample on non-rate"),
            },
        );
        passed
    }

    /// Merges all series picked by the selector.
    pub fn aggregate(&self, selector: &Selector) -> Aggregate {
        let elapsed = self.started.elapsed();
        let series = self.lock();

        let mut aggregate = Aggregate::Empty;
        for (_, series) in series.iter().filter(|(key, _)| selector.matches(key)) {
            aggregate.merge(series, elapsed);
        }
        aggregate
    }

    /// Returns the names of all metrics that received samples, sorted.
    pub fn metric_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.lock().keys().map(|key| key.metric).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Returns the totals of every check per scenario, sorted by scenario and check name.
    pub fn checks(&self) -> Vec<CheckSummary> {
        let mut checks: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
        for (key, series) in self.lock().iter() {
            let Series::Rate { passes, fails } = series else {
                continue;
            };
            if key.metric != CHECKS {
                continue;
            }

            let scenario = key.tags.get(TAG_SCENARIO).unwrap_or_default().to_owned();
            let name = key.tags.get(TAG_CHECK).unwrap_or_default().to_owned();
            let totals = checks.entry((scenario, name)).or_default();
            totals.0 += passes;
            totals.1 += fails;
        }

        checks
            .into_iter()
            .map(|((scenario, name), (passes, fails))| CheckSummary {
                scenario,
                name,
                passes,
                fails,
            })
            .collect()
    }
}

//! Pass/fail conditions evaluated against the metrics registry at the end of a run.
//!
//! A threshold pairs a [`Selector`] with conditions of the form `<aggregate> <op> <number>`, for
//! example `p(95)<500` or `rate>=0.99`. A condition whose aggregate is undefined for the selected
//! data (typically because nothing matched) reports [`Outcome::NoData`] and does not fail the run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::metrics::{ExpressionError, Metrics, Selector, Stat, TAG_SCENARIO, Tags};

/// A comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl Op {
    // Two-character operators come first so that `<=` is not read as `<`.
    const ALL: [(&'static str, Op); 6] = [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];

    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }

    fn as_str(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(symbol, _)| *symbol)
            .unwrap_or_default()
    }
}

/// A single `<aggregate> <op> <number>` condition.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    stat: Stat,
    op: Op,
    value: f64,
}

impl Condition {
    /// Creates a condition from its parts.
    pub fn new(stat: Stat, op: Op, value: f64) -> Self {
        Self { stat, op, value }
    }

    /// The aggregate this condition is evaluated on.
    pub fn stat(&self) -> Stat {
        self.stat
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stat, self.op.as_str(), self.value)
    }
}

impl FromStr for Condition {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = s
            .find(['<', '>', '=', '!'])
            .ok_or(ExpressionError::new("missing comparison operator"))?;
        let (lhs, rest) = s.split_at(index);

        let (symbol, op) = Op::ALL
            .iter()
            .find(|(symbol, _)| rest.starts_with(*symbol))
            .ok_or(ExpressionError::new("unknown comparison operator"))?;

        let stat = lhs.parse()?;
        let value = rest[symbol.len()..]
            .trim()
            .parse()
            .map_err(|_| ExpressionError::new("right-hand side is not a number"))?;

        Ok(Self::new(stat, *op, value))
    }
}

/// The result of evaluating one condition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    /// The condition held for the observed value.
    Passed(f64),
    /// The condition did not hold for the observed value.
    Failed(f64),
    /// The aggregate is undefined for the selected data.
    NoData,
}

/// One evaluated condition of a threshold.
#[derive(Clone, Debug)]
pub struct ThresholdResult {
    /// The series the condition was evaluated on.
    pub selector: Selector,
    /// The condition itself.
    pub condition: Condition,
    /// What came out.
    pub outcome: Outcome,
}

impl ThresholdResult {
    /// Only an explicit failure fails a threshold.
    pub fn passed(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed(_))
    }
}

/// All thresholds of a run, keyed by selector.
#[derive(Clone, Debug, Default)]
pub struct Thresholds {
    entries: BTreeMap<Selector, Vec<Condition>>,
}

impl Thresholds {
    /// Returns a builder to assemble thresholds.
    pub fn builder() -> ThresholdsBuilder {
        ThresholdsBuilder::default()
    }

    /// Iterates all selectors that carry thresholds.
    pub fn selectors(&self) -> impl Iterator<Item = &Selector> {
        self.entries.keys()
    }

    /// Returns the conditions registered for a selector.
    pub fn conditions(&self, selector: &Selector) -> &[Condition] {
        self.entries.get(selector).map(Vec::as_slice).unwrap_or_default()
    }

    /// Evaluates every condition against the registry.
    pub fn evaluate(&self, metrics: &Metrics) -> Vec<ThresholdResult> {
        let mut results = Vec::new();

        for (selector, conditions) in &self.entries {
            let aggregate = metrics.aggregate(selector);
            for condition in conditions {
                let outcome = match aggregate.value(condition.stat) {
                    Some(value) if condition.op.apply(value, condition.value) => {
                        Outcome::Passed(value)
                    }
                    Some(value) => Outcome::Failed(value),
                    None => Outcome::NoData,
                };

                results.push(ThresholdResult {
                    selector: selector.clone(),
                    condition: condition.clone(),
                    outcome,
                });
            }
        }

        results
    }
}

/// Assembles [`Thresholds`] from configuration and fixed registrations.
#[derive(Debug, Default)]
pub struct ThresholdsBuilder {
    entries: BTreeMap<Selector, Vec<Condition>>,
}

impl ThresholdsBuilder {
    /// Parses and adds a condition for a selector.
    pub fn threshold(mut self, selector: &str, condition: &str) -> Result<Self, ConfigError> {
        let invalid = |source: ExpressionError| ConfigError::InvalidThreshold {
            expression: format!("{selector}: {condition}"),
            source,
        };

        let parsed_selector: Selector = selector.parse().map_err(invalid)?;
        let parsed_condition: Condition = condition.parse().map_err(invalid)?;
        self.insert(parsed_selector, parsed_condition);
        Ok(self)
    }

    /// Registers an always-true `max>=0` condition on `metric` for every scenario.
    ///
    /// This makes each scenario's slice of the metric show up in the report even when no other
    /// threshold references it. A selector that already has the condition is left alone.
    pub fn scenario_sub_metrics<'a>(
        mut self,
        metric: &str,
        scenarios: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        for scenario in scenarios {
            let selector = Selector::new(metric, Tags::new().with(TAG_SCENARIO, scenario));
            self.insert(selector, Condition::new(Stat::Max, Op::Ge, 0.0));
        }
        self
    }

    fn insert(&mut self, selector: Selector, condition: Condition) {
        let conditions = self.entries.entry(selector).or_default();
        if !conditions.contains(&condition) {
            conditions.push(condition);
        }
    }

    /// Finishes building.
    pub fn build(self) -> Thresholds {
        Thresholds {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{GRPC_REQ_DURATION, ITERATIONS};

    #[test]
    fn parses_conditions() {
        let condition: Condition = "p(95) < 500".parse().unwrap();
        assert_eq!(condition, Condition::new(Stat::Percentile(95.0), Op::Lt, 500.0));

        let condition: Condition = "max>=0".parse().unwrap();
        assert_eq!(condition, Condition::new(Stat::Max, Op::Ge, 0.0));
        assert_eq!(condition.to_string(), "max>=0");

        let condition: Condition = "rate != 0.5".parse().unwrap();
        assert_eq!(condition, Condition::new(Stat::Rate, Op::Ne, 0.5));

        assert!("max".parse::<Condition>().is_err());
        assert!("max >= fast".parse::<Condition>().is_err());
        assert!("fastest >= 1".parse::<Condition>().is_err());
        assert!("max => 1".parse::<Condition>().is_err());
    }

    #[test]
    fn invalid_thresholds_are_config_errors() {
        let result = Thresholds::builder().threshold("grpc_req_duration{scenario", "max>=0");
        assert!(matches!(result, Err(ConfigError::InvalidThreshold { .. })));

        let result = Thresholds::builder().threshold("grpc_req_duration", "max=>0");
        assert!(matches!(result, Err(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn scenario_sub_metrics_do_not_duplicate() {
        let thresholds = Thresholds::builder()
            .threshold("grpc_req_duration{scenario:publisher}", "max>=0")
            .unwrap()
            .scenario_sub_metrics(GRPC_REQ_DURATION, ["publisher", "subscriber"])
            .scenario_sub_metrics(GRPC_REQ_DURATION, ["publisher"])
            .build();

        let selectors: Vec<_> = thresholds.selectors().map(ToString::to_string).collect();
        assert_eq!(
            selectors,
            [
                "grpc_req_duration{scenario:publisher}",
                "grpc_req_duration{scenario:subscriber}"
            ]
        );

        let publisher = "grpc_req_duration{scenario:publisher}".parse().unwrap();
        assert_eq!(thresholds.conditions(&publisher).len(), 1);
    }

    #[test]
    fn evaluates_against_metrics() {
        let metrics = Metrics::new();
        let tags = Tags::scenario("publisher");
        for value in [10.0, 20.0, 30.0] {
            metrics.record(GRPC_REQ_DURATION, &tags, value);
        }
        metrics.add(ITERATIONS, &tags, 3);

        let thresholds = Thresholds::builder()
            .threshold("grpc_req_duration", "max<25")
            .unwrap()
            .threshold("grpc_req_duration", "min>=10")
            .unwrap()
            .threshold("iterations{scenario:publisher}", "count==3")
            .unwrap()
            .build();

        let results = thresholds.evaluate(&metrics);
        let outcomes: Vec<_> = results
            .iter()
            .map(|r| (r.condition.to_string(), r.outcome))
            .collect();
        assert_eq!(
            outcomes,
            [
                ("max<25".to_owned(), Outcome::Failed(30.0)),
                ("min>=10".to_owned(), Outcome::Passed(10.0)),
                ("count==3".to_owned(), Outcome::Passed(3.0)),
            ]
        );
        assert!(!results[0].passed());
        assert!(results[1].passed());
    }

    #[test]
    fn missing_data_does_not_fail() {
        let metrics = Metrics::new();
        let thresholds = Thresholds::builder()
            .scenario_sub_metrics(GRPC_REQ_DURATION, ["idle"])
            .threshold("iterations{scenario:idle}", "count==0")
            .unwrap()
            .build();

        let results = thresholds.evaluate(&metrics);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, Outcome::NoData);
        assert_eq!(results[1].outcome, Outcome::Passed(0.0));
        assert!(results.iter().all(ThresholdResult::passed));
    }
}

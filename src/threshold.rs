//! Threshold Gate
//!
//! Thresholds are pass/fail conditions on final metric aggregates, written as
//! `<aggregation><operator><value>`:
//!
//! ```text
//! p(95)<20        rate<0.01       count>300000
//! avg<5000        value>=2        min>=2
//! ```
//!
//! Which aggregations apply depends on the metric kind:
//!
//! | Kind | Aggregations |
//! |------|--------------|
//! | duration | `p(N)`, `avg`, `min`, `max`, `med`, `count` |
//! | counter | `count`, `rate` (per second) |
//! | rate | `rate` |
//! | gauge | `value`, `min`, `max`, `avg` |
//!
//! A threshold on a metric without samples is never satisfied. Counters are
//! the exception: a registered counter that was never incremented has an
//! observed count of zero.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::metrics::{MetricKind, MetricSummary, MetricsSnapshot};

/// Aggregate a threshold reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
}

impl Aggregation {
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        use Aggregation::*;
        match kind {
            MetricKind::Duration => {
                matches!(self, Percentile(_) | Avg | Min | Max | Med | Count)
            }
            MetricKind::Counter => matches!(self, Count | Rate),
            MetricKind::Rate => matches!(self, Rate),
            MetricKind::Gauge => matches!(self, Value | Min | Max | Avg),
        }
    }

    /// Observed value, `None` when the metric has no samples
    pub fn observe(&self, summary: &MetricSummary) -> Option<f64> {
        use Aggregation::*;
        match summary {
            MetricSummary::Duration(d) => {
                if d.count == 0 {
                    return None;
                }
                match self {
                    Percentile(p) => d.percentile(*p),
                    Avg => Some(d.avg),
                    Min => Some(d.min),
                    Max => Some(d.max),
                    Med => Some(d.med),
                    Count => Some(d.count as f64),
                    _ => None,
                }
            }
            MetricSummary::Counter { count, rate, .. } => match self {
                Count => Some(*count as f64),
                Rate => Some(*rate),
                _ => None,
            },
            MetricSummary::Rate { rate, total, .. } => match self {
                Rate if *total > 0 => Some(*rate),
                _ => None,
            },
            MetricSummary::Gauge(g) => {
                if g.writes == 0 {
                    return None;
                }
                match self {
                    Value => Some(g.value),
                    Min => Some(g.min),
                    Max => Some(g.max),
                    Avg => Some(g.avg),
                    _ => None,
                }
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Percentile(p) => write!(f, "p({})", p),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Value => f.write_str("value"),
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    pub fn holds(&self, observed: f64, target: f64) -> bool {
        match self {
            Comparator::Lt => observed < target,
            Comparator::Le => observed <= target,
            Comparator::Gt => observed > target,
            Comparator::Ge => observed >= target,
            Comparator::Eq => observed == target,
            Comparator::Ne => observed != target,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A parsed `<aggregation><operator><value>` expression
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Condition {
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub target: f64,
}

impl Condition {
    pub fn holds(&self, observed: f64) -> bool {
        self.comparator.holds(observed, self.target)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparator, self.target)
    }
}

impl FromStr for Condition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expression: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            expression: s.to_string(),
            reason: reason.to_string(),
        };

        let op_start = expression
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (agg, rest) = expression.split_at(op_start);

        let aggregation = parse_aggregation(agg).ok_or_else(|| {
            invalid("unknown aggregation (expected p(N), avg, min, max, med, count, rate or value)")
        })?;

        let (comparator, value) = [
            ("<=", Comparator::Le),
            (">=", Comparator::Ge),
            ("==", Comparator::Eq),
            ("!=", Comparator::Ne),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
        ]
        .iter()
        .find_map(|(symbol, cmp)| rest.strip_prefix(symbol).map(|value| (*cmp, value)))
        .ok_or_else(|| invalid("unknown comparison operator"))?;

        let target: f64 = value
            .parse()
            .map_err(|_| invalid("threshold value is not a number"))?;
        if !target.is_finite() {
            return Err(invalid("threshold value must be finite"));
        }

        Ok(Condition {
            aggregation,
            comparator,
            target,
        })
    }
}

fn parse_aggregation(s: &str) -> Option<Aggregation> {
    if let Some(inner) = s.strip_prefix("p(").and_then(|r| r.strip_suffix(')')) {
        let p: f64 = inner.parse().ok()?;
        return (p > 0.0 && p <= 100.0).then_some(Aggregation::Percentile(p));
    }
    match s {
        "avg" => Some(Aggregation::Avg),
        "min" => Some(Aggregation::Min),
        "max" => Some(Aggregation::Max),
        "med" => Some(Aggregation::Med),
        "count" => Some(Aggregation::Count),
        "rate" => Some(Aggregation::Rate),
        "value" => Some(Aggregation::Value),
        _ => None,
    }
}

/// A condition bound to a metric
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    /// Expression as written in the plan
    pub expression: String,
    pub condition: Condition,
}

impl Threshold {
    pub fn parse(metric: impl Into<String>, expression: impl Into<String>) -> Result<Self, ConfigError> {
        let expression = expression.into();
        let condition = expression.parse()?;
        Ok(Self {
            metric: metric.into(),
            expression,
            condition,
        })
    }

    /// Check the threshold refers to a produced metric of a compatible kind
    pub fn validate(&self, declared: &HashMap<String, MetricKind>) -> Result<(), ConfigError> {
        let kind = declared
            .get(&self.metric)
            .ok_or_else(|| ConfigError::UnknownMetric {
                metric: self.metric.clone(),
                expression: self.expression.clone(),
            })?;
        if !self.condition.aggregation.applies_to(*kind) {
            return Err(ConfigError::AggregationMismatch {
                metric: self.metric.clone(),
                kind: *kind,
                expression: self.expression.clone(),
            });
        }
        Ok(())
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdOutcome {
        let observed = snapshot
            .get(&self.metric)
            .and_then(|summary| self.condition.aggregation.observe(summary));
        let passed = observed.is_some_and(|value| self.condition.holds(value));
        ThresholdOutcome {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            observed,
            passed,
        }
    }
}

/// Result of one threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    /// `None` when the metric had no samples
    pub observed: Option<f64>,
    pub passed: bool,
}

/// Final pass/fail of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub thresholds: Vec<ThresholdOutcome>,
}

impl Verdict {
    pub fn failures(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

/// All thresholds of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdGate {
    thresholds: Vec<Threshold>,
}

impl ThresholdGate {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        Self { thresholds }
    }

    /// Parse a `metric → [expressions]` map
    pub fn from_map(map: &BTreeMap<String, Vec<String>>) -> Result<Self, ConfigError> {
        let thresholds = map
            .iter()
            .flat_map(|(metric, expressions)| {
                expressions
                    .iter()
                    .map(move |expr| Threshold::parse(metric.as_str(), expr.as_str()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn validate(&self, declared: &HashMap<String, MetricKind>) -> Result<(), ConfigError> {
        self.thresholds
            .iter()
            .try_for_each(|threshold| threshold.validate(declared))
    }

    /// Evaluate every threshold; the verdict passes when all of them do
    ///
    /// Pure over the snapshot: evaluating twice gives identical verdicts.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Verdict {
        let thresholds: Vec<ThresholdOutcome> = self
            .thresholds
            .iter()
            .map(|threshold| threshold.evaluate(snapshot))
            .collect();
        Verdict {
            passed: thresholds.iter().all(|t| t.passed),
            thresholds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSink;

    fn cond(s: &str) -> Condition {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_expressions() {
        assert_eq!(
            cond("p(95)<20"),
            Condition {
                aggregation: Aggregation::Percentile(95.0),
                comparator: Comparator::Lt,
                target: 20.0
            }
        );
        assert_eq!(cond("rate==1.0").comparator, Comparator::Eq);
        assert_eq!(cond("count>300000").target, 300000.0);
        assert_eq!(cond("value>=2").aggregation, Aggregation::Value);
        assert_eq!(cond("p(99.9) <= 100").aggregation, Aggregation::Percentile(99.9));
        assert_eq!(cond("avg!=0").comparator, Comparator::Ne);
    }

    #[test]
    fn test_reject_malformed_expressions() {
        for bad in ["p95<20", "p(0)<1", "p(101)<1", "mean<5", "rate", "rate<", "rate<abc", "rate=<1"] {
            assert!(
                matches!(bad.parse::<Condition>(), Err(ConfigError::InvalidThreshold { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_aggregation_kind_compatibility() {
        let mut declared = HashMap::new();
        declared.insert("failover_success".to_string(), MetricKind::Rate);
        declared.insert("rpc_call_duration".to_string(), MetricKind::Duration);

        assert!(Threshold::parse("failover_success", "rate==1.0")
            .unwrap()
            .validate(&declared)
            .is_ok());
        assert!(matches!(
            Threshold::parse("failover_success", "p(95)<10")
                .unwrap()
                .validate(&declared),
            Err(ConfigError::AggregationMismatch { .. })
        ));
        assert!(matches!(
            Threshold::parse("shard_lookup_duration", "p(95)<5")
                .unwrap()
                .validate(&declared),
            Err(ConfigError::UnknownMetric { .. })
        ));
    }

    #[test]
    fn test_zero_samples_never_satisfy() {
        let sink = MetricSink::new();
        sink.register("failover_duration", MetricKind::Duration).unwrap();
        sink.register("failover_success", MetricKind::Rate).unwrap();
        let snapshot = sink.snapshot_all();

        let duration = Threshold::parse("failover_duration", "p(95)<5000").unwrap();
        let outcome = duration.evaluate(&snapshot);
        assert!(!outcome.passed);
        assert_eq!(outcome.observed, None);

        // Even a condition a zero rate would meet
        let rate = Threshold::parse("failover_success", "rate<0.5").unwrap();
        assert!(!rate.evaluate(&snapshot).passed);
    }

    #[test]
    fn test_registered_counter_observes_zero() {
        let sink = MetricSink::new();
        sink.register("errors", MetricKind::Counter).unwrap();
        let outcome = Threshold::parse("errors", "count==0")
            .unwrap()
            .evaluate(&sink.snapshot_all());
        assert!(outcome.passed);
        assert_eq!(outcome.observed, Some(0.0));
    }

    #[test]
    fn test_gate_verdict_and_idempotence() {
        let sink = MetricSink::new();
        for v in [5.0, 10.0, 10.0, 20.0, 100.0] {
            sink.add_trend("rpc_call_duration", v).unwrap();
        }
        sink.add_rate("request_errors", false).unwrap();
        sink.set_gauge("nodes_alive", 3.0).unwrap();
        sink.set_gauge("nodes_alive", 2.0).unwrap();
        let snapshot = sink.snapshot_all();

        let mut map = BTreeMap::new();
        map.insert(
            "rpc_call_duration".to_string(),
            vec!["p(50)<=10".to_string(), "p(95)<20".to_string()],
        );
        map.insert("request_errors".to_string(), vec!["rate<0.01".to_string()]);
        map.insert("nodes_alive".to_string(), vec!["min>=2".to_string()]);
        let gate = ThresholdGate::from_map(&map).unwrap();

        let verdict = gate.evaluate(&snapshot);
        assert!(!verdict.passed);
        let failures: Vec<_> = verdict.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].expression, "p(95)<20");
        assert_eq!(failures[0].observed, Some(100.0));

        assert_eq!(gate.evaluate(&snapshot), verdict);
    }

    #[test]
    fn test_empty_gate_passes() {
        let verdict = ThresholdGate::default().evaluate(&MetricSink::new().snapshot_all());
        assert!(verdict.passed);
        assert!(verdict.thresholds.is_empty());
    }
}

//! Immutable aggregates computed from the sink.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::percentile;
use super::MetricKind;

/// Aggregates of a duration metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub med: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    #[serde(skip)]
    sorted: Vec<f64>,
}

impl DurationSummary {
    /// Build from samples sorted in ascending order
    pub(crate) fn from_sorted(sorted: Vec<f64>) -> Self {
        let count = sorted.len() as u64;
        let pct = |p: f64| percentile::percentile(&sorted, p).unwrap_or(0.0);
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        Self {
            count,
            min: sorted.first().copied().unwrap_or(0.0),
            max: sorted.last().copied().unwrap_or(0.0),
            avg,
            med: pct(50.0),
            p50: pct(50.0),
            p90: pct(90.0),
            p95: pct(95.0),
            p99: pct(99.0),
            sorted,
        }
    }

    /// Arbitrary nearest-rank percentile; `None` without samples
    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile::percentile(&self.sorted, p)
    }
}

/// Aggregates of a gauge metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeSummary {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub writes: u64,
}

/// Final aggregate of one metric
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSummary {
    Duration(DurationSummary),
    Counter {
        count: u64,
        /// Increments per second of run time
        rate: f64,
        writes: u64,
    },
    Rate {
        rate: f64,
        passes: u64,
        total: u64,
    },
    Gauge(GaugeSummary),
}

impl MetricSummary {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSummary::Duration(_) => MetricKind::Duration,
            MetricSummary::Counter { .. } => MetricKind::Counter,
            MetricSummary::Rate { .. } => MetricKind::Rate,
            MetricSummary::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Number of samples written to the metric
    pub fn samples(&self) -> u64 {
        match self {
            MetricSummary::Duration(d) => d.count,
            MetricSummary::Counter { writes, .. } => *writes,
            MetricSummary::Rate { total, .. } => *total,
            MetricSummary::Gauge(g) => g.writes,
        }
    }
}

/// Point-in-time copy of every metric in a sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Time since the sink was created
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricSummary>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.get(name)
    }

    /// Counter total, zero when absent or not a counter
    pub fn count(&self, name: &str) -> u64 {
        match self.metrics.get(name) {
            Some(MetricSummary::Counter { count, .. }) => *count,
            _ => 0,
        }
    }

    /// Duration aggregate, if the metric is a duration
    pub fn duration(&self, name: &str) -> Option<&DurationSummary> {
        match self.metrics.get(name) {
            Some(MetricSummary::Duration(d)) => Some(d),
            _ => None,
        }
    }

    /// Rate value, if the metric is a rate
    pub fn rate(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name) {
            Some(MetricSummary::Rate { rate, .. }) => Some(*rate),
            _ => None,
        }
    }

    /// Gauge aggregate, if the metric is a gauge
    pub fn gauge(&self, name: &str) -> Option<&GaugeSummary> {
        match self.metrics.get(name) {
            Some(MetricSummary::Gauge(g)) => Some(g),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_summary_reference_samples() {
        let summary = DurationSummary::from_sorted(vec![5.0, 10.0, 10.0, 20.0, 100.0]);
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min, 5.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(summary.avg, 29.0);
        assert_eq!(summary.p50, 10.0);
        assert_eq!(summary.med, 10.0);
        assert_eq!(summary.p95, 100.0);
        assert_eq!(summary.percentile(40.0), Some(10.0));
    }

    #[test]
    fn test_empty_duration_summary() {
        let summary = DurationSummary::from_sorted(Vec::new());
        assert_eq!(summary.count, 0);
        assert_eq!(summary.p95, 0.0);
        assert_eq!(summary.percentile(95.0), None);
    }

    #[test]
    fn test_summary_serialization_omits_samples() {
        let summary =
            MetricSummary::Duration(DurationSummary::from_sorted(vec![1.0, 2.0, 3.0]));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["kind"], "duration");
        assert_eq!(json["p95"], 3.0);
        assert!(json.get("sorted").is_none());
    }
}

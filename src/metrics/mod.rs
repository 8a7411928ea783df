//! Metric Sink and Aggregation
//!
//! Every sample produced during a run lands in a single [`MetricSink`] owned by
//! the run. Workers receive cheap clones of the sink handle; there is no
//! process-wide registry.
//!
//! # Metric kinds
//!
//! - **duration**: numeric samples (milliseconds for latencies) with
//!   nearest-rank percentile queries
//! - **counter**: monotonically accumulated integer
//! - **rate**: fraction of boolean outcomes that were true
//! - **gauge**: last value wins, with min/max/average tracked over the run
//!
//! A metric's kind is fixed by its first registration or write. Writing a
//! different kind afterwards is a [`MetricError::KindMismatch`].

pub mod percentile;
pub mod sink;
pub mod summary;

pub use sink::MetricSink;
pub use summary::{DurationSummary, GaugeSummary, MetricSummary, MetricsSnapshot};

pub use crate::error::MetricError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Built-in metric: completed iterations per scenario run
pub const ITERATIONS: &str = "iterations";

/// Built-in metric: wall time of each completed iteration
pub const ITERATION_DURATION: &str = "iteration_duration";

/// Built-in metric: iterations that ended in a contained error
pub const ITERATION_ERRORS: &str = "iteration_errors";

/// Built-in metric: fixed-rate iterations dropped because the pool was saturated
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";

/// Kind of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Duration,
    Counter,
    Rate,
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Duration => "duration",
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Gauge => "gauge",
        };
        f.write_str(name)
    }
}

/// A single value written to the sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// Duration-kind sample, in milliseconds for latencies
    Duration(f64),
    /// Counter increment
    Counter(u64),
    /// Boolean outcome for a rate
    Rate(bool),
    /// Absolute gauge value
    Gauge(f64),
    /// Relative gauge change applied to the current value
    GaugeDelta(f64),
}

impl Sample {
    /// Build a duration sample from a wall-clock [`Duration`]
    pub fn elapsed(duration: Duration) -> Self {
        Sample::Duration(duration.as_secs_f64() * 1000.0)
    }

    /// Kind of metric this sample belongs to
    pub fn kind(&self) -> MetricKind {
        match self {
            Sample::Duration(_) => MetricKind::Duration,
            Sample::Counter(_) => MetricKind::Counter,
            Sample::Rate(_) => MetricKind::Rate,
            Sample::Gauge(_) | Sample::GaugeDelta(_) => MetricKind::Gauge,
        }
    }
}

/// A metric a workload promises to produce
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDecl {
    pub name: String,
    pub kind: MetricKind,
}

impl MetricDecl {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn duration(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Duration)
    }

    pub fn counter(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    pub fn rate(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Rate)
    }

    pub fn gauge(name: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Gauge)
    }
}

/// Metrics the harness records for every scenario
pub fn builtin_metrics() -> Vec<MetricDecl> {
    vec![
        MetricDecl::counter(ITERATIONS),
        MetricDecl::duration(ITERATION_DURATION),
        MetricDecl::counter(ITERATION_ERRORS),
        MetricDecl::counter(DROPPED_ITERATIONS),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_sample_is_milliseconds() {
        assert_eq!(
            Sample::elapsed(Duration::from_millis(250)),
            Sample::Duration(250.0)
        );
    }

    #[test]
    fn test_sample_kinds() {
        assert_eq!(Sample::Counter(1).kind(), MetricKind::Counter);
        assert_eq!(Sample::Rate(true).kind(), MetricKind::Rate);
        assert_eq!(Sample::GaugeDelta(-1.0).kind(), MetricKind::Gauge);
    }

    #[test]
    fn test_metric_kind_serialization() {
        let json = serde_json::to_string(&MetricKind::Duration).unwrap();
        assert_eq!(json, "\"duration\"");
        let kind: MetricKind = serde_json::from_str("\"gauge\"").unwrap();
        assert_eq!(kind, MetricKind::Gauge);
    }
}

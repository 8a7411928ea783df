//! Harness Error Types
//!
//! This module defines the errors that can abort a run. Errors that belong to a
//! single iteration (connector failures, failed response checks) never reach
//! this level; they are recorded as metric samples by the virtual client.

use std::time::Duration;

use crate::metrics::MetricKind;

/// Errors that abort a run
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The run plan failed validation before any scenario started
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A metric was written with the wrong kind
    #[error(transparent)]
    Metric(#[from] MetricError),

    /// A virtual client task panicked
    #[error("A virtual client in scenario '{scenario}' panicked")]
    ClientPanicked { scenario: String },

    /// A scenario executor was cancelled without reporting an outcome
    #[error("Scenario '{scenario}' was aborted")]
    Aborted { scenario: String },
}

/// Construction-time validation failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// The plan declares no scenarios
    #[error("Run plan declares no scenarios")]
    EmptyPlan,

    /// Two scenarios share a name
    #[error("Duplicate scenario name: {0}")]
    DuplicateScenario(String),

    /// Scheduling policy parameters are out of range
    #[error("Scenario '{scenario}' has an invalid scheduling policy: {reason}")]
    InvalidPolicy { scenario: String, reason: String },

    /// start offset + window exceeds the run ceiling
    #[error("Scenario '{scenario}' ends at {end:?}, after the run ceiling of {ceiling:?}")]
    WindowExceedsCeiling {
        scenario: String,
        end: Duration,
        ceiling: Duration,
    },

    /// The run ceiling is zero
    #[error("Run ceiling must be > 0")]
    ZeroCeiling,

    /// A threshold expression could not be parsed
    #[error("Invalid threshold expression '{expression}': {reason}")]
    InvalidThreshold { expression: String, reason: String },

    /// A threshold names a metric no scenario produces
    #[error("Threshold '{expression}' references metric '{metric}' which no scenario produces")]
    UnknownMetric { metric: String, expression: String },

    /// A threshold aggregation does not apply to the metric kind
    #[error("Threshold '{expression}' cannot be applied to {kind} metric '{metric}'")]
    AggregationMismatch {
        metric: String,
        kind: MetricKind,
        expression: String,
    },

    /// A workload is configured with invalid parameters
    #[error("Scenario '{scenario}' has an invalid workload: {reason}")]
    InvalidWorkload { scenario: String, reason: String },
}

/// Metric sink write errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    /// A metric received a sample of a different kind than it was registered with
    #[error("Metric '{name}' is a {registered} metric, cannot record a {attempted} sample")]
    KindMismatch {
        name: String,
        registered: MetricKind,
        attempted: MetricKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mismatch_message() {
        let err = MetricError::KindMismatch {
            name: "rpc_call_duration".to_string(),
            registered: MetricKind::Duration,
            attempted: MetricKind::Counter,
        };
        assert_eq!(
            err.to_string(),
            "Metric 'rpc_call_duration' is a duration metric, cannot record a counter sample"
        );
    }

    #[test]
    fn test_config_error_wraps_into_harness_error() {
        let err: HarnessError = ConfigError::EmptyPlan.into();
        assert!(matches!(err, HarnessError::Config(ConfigError::EmptyPlan)));
        assert!(err.to_string().contains("no scenarios"));
    }
}

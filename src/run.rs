//! Run construction and execution
//!
//! A [`Run`] owns everything one load test needs: the validated scenarios,
//! the metric sink, the threshold gate and the target connector. Every
//! configuration error surfaces in [`Run::new`], before any client starts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::connector::TargetConnector;
use crate::error::{ConfigError, HarnessError};
use crate::metrics::{builtin_metrics, MetricDecl, MetricKind, MetricSink, MetricsSnapshot};
use crate::scenario::{ExecutorEnv, ScenarioOutcome, ScenarioSpec};
use crate::scheduler::run_scenarios;
use crate::telemetry::HarnessTelemetry;
use crate::telemetry_server::TelemetryServer;
use crate::threshold::{ThresholdGate, Verdict};

/// Default drain period after a scenario window closes
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// Default re-evaluation interval of ramping scenarios
pub const DEFAULT_RAMP_TICK: Duration = Duration::from_millis(100);

/// Everything a run is built from
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub scenarios: Vec<ScenarioSpec>,
    pub gate: ThresholdGate,
    /// Hard deadline for the whole run
    pub ceiling: Duration,
    pub graceful_stop: Duration,
    pub ramp_tick: Duration,
    /// Serve harness telemetry on this port while the run executes
    pub telemetry_port: Option<u16>,
}

impl RunPlan {
    pub fn new(scenarios: Vec<ScenarioSpec>, gate: ThresholdGate, ceiling: Duration) -> Self {
        Self {
            scenarios,
            gate,
            ceiling,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            ramp_tick: DEFAULT_RAMP_TICK,
            telemetry_port: None,
        }
    }
}

/// A validated, ready-to-execute run
pub struct Run {
    scenarios: Vec<Arc<ScenarioSpec>>,
    gate: ThresholdGate,
    ceiling: Duration,
    graceful_stop: Duration,
    ramp_tick: Duration,
    telemetry_port: Option<u16>,
    metrics: MetricSink,
    connector: Arc<dyn TargetConnector>,
}

impl Run {
    /// Validate the plan and pre-register every declared metric
    pub fn new(plan: RunPlan, connector: Arc<dyn TargetConnector>) -> Result<Self, HarnessError> {
        if plan.ceiling.is_zero() {
            return Err(ConfigError::ZeroCeiling.into());
        }
        if plan.scenarios.is_empty() {
            return Err(ConfigError::EmptyPlan.into());
        }

        let mut names = HashSet::new();
        for spec in &plan.scenarios {
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateScenario(spec.name.clone()).into());
            }
            spec.validate(plan.ceiling)?;
        }

        let metrics = MetricSink::new();
        let decls: Vec<MetricDecl> = builtin_metrics()
            .into_iter()
            .chain(plan.scenarios.iter().flat_map(|s| s.iteration.metrics()))
            .collect();
        metrics.register_all(&decls)?;

        let declared: HashMap<String, MetricKind> =
            decls.into_iter().map(|d| (d.name, d.kind)).collect();
        plan.gate.validate(&declared)?;

        info!(
            "Run validated: {} scenarios, {} thresholds, ceiling {:?}",
            plan.scenarios.len(),
            plan.gate.thresholds().len(),
            plan.ceiling
        );

        Ok(Self {
            scenarios: plan.scenarios.into_iter().map(Arc::new).collect(),
            gate: plan.gate,
            ceiling: plan.ceiling,
            graceful_stop: plan.graceful_stop,
            ramp_tick: plan.ramp_tick,
            telemetry_port: plan.telemetry_port,
            metrics,
            connector,
        })
    }

    /// The run's metric sink
    pub fn metrics(&self) -> &MetricSink {
        &self.metrics
    }

    pub fn gate(&self) -> &ThresholdGate {
        &self.gate
    }

    pub fn scenario_names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.iter().map(|s| s.name.as_str())
    }

    /// Execute every scenario, then evaluate the thresholds once
    pub async fn execute(self) -> Result<RunReport, HarnessError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        info!("Starting run {} with {} scenarios", run_id, self.scenarios.len());

        let (telemetry, server) = self.start_telemetry().await;
        let env = ExecutorEnv {
            metrics: self.metrics.clone(),
            connector: self.connector.clone(),
            telemetry,
            graceful_stop: self.graceful_stop,
            ramp_tick: self.ramp_tick,
        };

        self.metrics.mark_start();
        let result = run_scenarios(&self.scenarios, env, self.ceiling).await;
        if let Some(server) = server {
            server.stop().await;
        }
        let scenarios = result?;

        let snapshot = self.metrics.snapshot_all();
        let verdict = self.gate.evaluate(&snapshot);
        for failure in verdict.failures() {
            match failure.observed {
                Some(observed) => error!(
                    "Threshold failed: {} {} (observed {})",
                    failure.metric, failure.expression, observed
                ),
                None => error!(
                    "Threshold failed: {} {} (no samples)",
                    failure.metric, failure.expression
                ),
            }
        }
        info!(
            "Run {} finished in {:?}: {}",
            run_id,
            started.elapsed(),
            if verdict.passed { "PASS" } else { "FAIL" }
        );

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed: started.elapsed(),
            scenarios,
            metrics: snapshot,
            verdict,
        })
    }

    async fn start_telemetry(&self) -> (Option<HarnessTelemetry>, Option<TelemetryServer>) {
        let Some(port) = self.telemetry_port else {
            return (None, None);
        };
        let telemetry = match HarnessTelemetry::new() {
            Ok(t) => t,
            Err(e) => {
                warn!("Harness telemetry disabled: {}", e);
                return (None, None);
            }
        };
        match TelemetryServer::start(telemetry.clone(), port).await {
            Ok(server) => (Some(telemetry), Some(server)),
            Err(e) => {
                warn!("Telemetry server not started: {:#}", e);
                (Some(telemetry), None)
            }
        }
    }
}

/// Structured summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub scenarios: Vec<ScenarioOutcome>,
    pub metrics: MetricsSnapshot,
    pub verdict: Verdict,
}

impl RunReport {
    /// Process exit code: 0 when every threshold passed, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.verdict.passed {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

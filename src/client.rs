//! Virtual Client
//!
//! A virtual client is one sequential execution context inside a scenario. It
//! repeatedly runs the scenario's [`Iteration`] against the target connector.
//! Iterations never overlap within a client; across clients there is no
//! ordering.
//!
//! # Failure containment
//!
//! Connector errors and failed response checks end the current iteration
//! only: the client records the failure in [`ITERATION_ERRORS`] and moves on
//! to its next iteration without retrying. A metric kind mismatch is a
//! programming error and is returned to the executor, which aborts the run.
//!
//! # Built-in metrics
//!
//! After every completed iteration the client records [`ITERATIONS`],
//! [`ITERATION_DURATION`] and (on failure) [`ITERATION_ERRORS`]. These writes
//! happen with no suspension point in between, so a forced cancellation never
//! leaves a partially recorded iteration behind.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::connector::{ConnectorError, TargetConnector};
use crate::metrics::{
    MetricDecl, MetricError, MetricSink, ITERATIONS, ITERATION_DURATION, ITERATION_ERRORS,
};
use crate::telemetry::HarnessTelemetry;

/// Error raised by a single iteration
#[derive(Debug, thiserror::Error)]
pub enum IterationError {
    /// The target could not be reached or answered badly
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// A response did not meet the iteration's expectation
    #[error("Check failed: {0}")]
    Check(String),

    /// A metric was written with the wrong kind
    #[error(transparent)]
    Metric(#[from] MetricError),
}

impl IterationError {
    pub fn check(message: impl Into<String>) -> Self {
        IterationError::Check(message.into())
    }
}

/// Per-iteration view handed to the iteration body
#[derive(Clone)]
pub struct IterationContext {
    /// Scenario the client belongs to
    pub scenario: Arc<str>,
    /// Client id, unique within the scenario
    pub client_id: u64,
    /// Zero-based iteration number of this client
    pub iteration: u64,
    pub metrics: MetricSink,
    pub connector: Arc<dyn TargetConnector>,
}

impl IterationContext {
    /// Pacing sleep; suspends this client only
    pub async fn pace(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// The body executed by every client of a scenario
#[async_trait]
pub trait Iteration: Send + Sync {
    /// Metrics this iteration writes, pre-registered before the run starts
    fn metrics(&self) -> Vec<MetricDecl> {
        Vec::new()
    }

    /// Run one iteration
    async fn run(&self, ctx: &IterationContext) -> Result<(), IterationError>;
}

/// An [`Iteration`] built from an async closure
pub struct FnIteration<F> {
    body: F,
    metrics: Vec<MetricDecl>,
}

impl<F, Fut> FnIteration<F>
where
    F: Fn(IterationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    pub fn new(body: F) -> Self {
        Self {
            body,
            metrics: Vec::new(),
        }
    }

    /// Declare the metrics the closure writes
    pub fn with_metrics(mut self, metrics: Vec<MetricDecl>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[async_trait]
impl<F, Fut> Iteration for FnIteration<F>
where
    F: Fn(IterationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), IterationError>> + Send + 'static,
{
    fn metrics(&self) -> Vec<MetricDecl> {
        self.metrics.clone()
    }

    async fn run(&self, ctx: &IterationContext) -> Result<(), IterationError> {
        (self.body)(ctx.clone()).await
    }
}

/// Result of one contained iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Succeeded,
    Failed,
}

/// Iteration counts shared by every client of a scenario
///
/// Atomic so the counts survive clients being aborted.
#[derive(Debug, Default)]
pub struct ScenarioCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl ScenarioCounters {
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Shared resources every client of a scenario needs
#[derive(Clone)]
pub struct ClientResources {
    pub scenario: Arc<str>,
    pub iteration: Arc<dyn Iteration>,
    pub metrics: MetricSink,
    pub connector: Arc<dyn TargetConnector>,
    pub telemetry: Option<HarnessTelemetry>,
    pub counters: Arc<ScenarioCounters>,
}

/// One virtual client
pub struct VirtualClient {
    id: u64,
    resources: ClientResources,
    iterations: u64,
}

impl VirtualClient {
    pub fn new(id: u64, resources: ClientResources) -> Self {
        Self {
            id,
            resources,
            iterations: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Iterations this client has completed
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Run exactly one iteration and record the built-in metrics
    ///
    /// Contained failures are reported as [`IterationOutcome::Failed`]; only a
    /// metric kind mismatch is returned as an error.
    pub async fn run_once(&mut self) -> Result<IterationOutcome, MetricError> {
        let res = &self.resources;
        let ctx = IterationContext {
            scenario: res.scenario.clone(),
            client_id: self.id,
            iteration: self.iterations,
            metrics: res.metrics.clone(),
            connector: res.connector.clone(),
        };

        res.counters.started.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = res.iteration.run(&ctx).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(()) => IterationOutcome::Succeeded,
            Err(IterationError::Metric(e)) => return Err(e),
            Err(e) => {
                debug!(
                    "Iteration {} of client {} in '{}' failed: {}",
                    self.iterations, self.id, res.scenario, e
                );
                IterationOutcome::Failed
            }
        };

        // No await below this point
        res.metrics.add_count(ITERATIONS, 1)?;
        res.metrics.add_duration(ITERATION_DURATION, elapsed)?;
        if outcome == IterationOutcome::Failed {
            res.metrics.add_count(ITERATION_ERRORS, 1)?;
            res.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        res.counters.completed.fetch_add(1, Ordering::Relaxed);
        if let Some(telemetry) = &res.telemetry {
            telemetry.iteration_completed(&res.scenario, outcome == IterationOutcome::Failed);
        }
        self.iterations += 1;

        Ok(outcome)
    }

    /// Run iterations until the stop signal is raised
    ///
    /// The signal is checked between iterations, so an iteration in flight is
    /// always allowed to finish.
    pub async fn run_until_stopped(mut self, stop: watch::Receiver<bool>) -> Result<(), MetricError> {
        let _active = self.active_guard();
        while !*stop.borrow() {
            self.run_once().await?;
        }
        Ok(())
    }

    /// Run iterations while the shared budget has iterations left
    pub async fn run_budget(
        mut self,
        budget: Arc<AtomicU64>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), MetricError> {
        let _active = self.active_guard();
        while !*stop.borrow() && claim(&budget) {
            self.run_once().await?;
        }
        Ok(())
    }

    pub(crate) fn active_guard(&self) -> Option<crate::telemetry::ActiveClientGuard> {
        self.resources
            .telemetry
            .as_ref()
            .map(|t| t.client_started(&self.resources.scenario))
    }
}

/// Take one iteration from a shared budget
fn claim(budget: &AtomicU64) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
        .is_ok()
}

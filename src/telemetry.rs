// Prometheus telemetry for the harness itself
//
// Exposes the harness's own live state, labelled by scenario:
// - Active virtual clients (gauge)
// - Completed iterations (counter)
// - Dropped iterations (counter)
// - Contained iteration errors (counter)
//
// The registry is owned by the run that created it; nothing is process-wide.

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Live harness series, cheap to clone
#[derive(Clone)]
pub struct HarnessTelemetry {
    registry: Arc<Registry>,
    active_clients: IntGaugeVec,
    iterations: IntCounterVec,
    dropped_iterations: IntCounterVec,
    iteration_errors: IntCounterVec,
}

impl std::fmt::Debug for HarnessTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessTelemetry").finish_non_exhaustive()
    }
}

impl HarnessTelemetry {
    /// Create the series and register them in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let active_clients = IntGaugeVec::new(
            Opts::new("loadgate_active_clients", "Number of live virtual clients"),
            &["scenario"],
        )?;
        let iterations = IntCounterVec::new(
            Opts::new("loadgate_iterations_total", "Total number of completed iterations"),
            &["scenario"],
        )?;
        let dropped_iterations = IntCounterVec::new(
            Opts::new(
                "loadgate_dropped_iterations_total",
                "Iterations dropped because the client pool was saturated",
            ),
            &["scenario"],
        )?;
        let iteration_errors = IntCounterVec::new(
            Opts::new(
                "loadgate_iteration_errors_total",
                "Iterations that ended in a contained error",
            ),
            &["scenario"],
        )?;

        registry.register(Box::new(active_clients.clone()))?;
        registry.register(Box::new(iterations.clone()))?;
        registry.register(Box::new(dropped_iterations.clone()))?;
        registry.register(Box::new(iteration_errors.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            active_clients,
            iterations,
            dropped_iterations,
            iteration_errors,
        })
    }

    /// Mark a client as live until the returned guard is dropped
    ///
    /// The guard also fires when a client task is aborted.
    pub fn client_started(&self, scenario: &str) -> ActiveClientGuard {
        let gauge = self.active_clients.with_label_values(&[scenario]);
        gauge.inc();
        ActiveClientGuard { gauge }
    }

    pub fn iteration_completed(&self, scenario: &str, failed: bool) {
        self.iterations.with_label_values(&[scenario]).inc();
        if failed {
            self.iteration_errors.with_label_values(&[scenario]).inc();
        }
    }

    pub fn iteration_dropped(&self, scenario: &str) {
        self.dropped_iterations.with_label_values(&[scenario]).inc();
    }

    /// Current number of live clients in a scenario
    pub fn active_clients(&self, scenario: &str) -> i64 {
        self.active_clients.with_label_values(&[scenario]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all series in Prometheus text format
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
    }
}

/// Decrements the active client gauge on drop
pub struct ActiveClientGuard {
    gauge: IntGauge,
}

impl Drop for ActiveClientGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

// Chaos Coordinator
//
// Injects faults into a live distributed target while load scenarios run,
// and measures how long the target takes to recover:
// 1. Pick a node (uniform random, without replacement until exhausted)
// 2. Send the fault command (kill or partition) through the connector
// 3. Poll the health endpoint at a fixed interval until the recovery
//    criterion holds or the maximum wait elapses
// 4. Record the recovery time as a duration and the outcome as a rate
// 5. Cool down before the next injection
//
// A recovery timeout is not an iteration error: the worst-case duration is
// recorded, the rate records a failure and the run carries on.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::client::{Iteration, IterationContext, IterationError};
use crate::connector::{resolve_url, TargetConnector, TargetRequest, TargetResponse};
use crate::error::ConfigError;
use crate::metrics::MetricDecl;
use crate::scenario::{ScenarioSpec, SchedulingPolicy};

/// Fault injected into the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    /// Terminate a node process
    #[default]
    Kill,
    /// Cut a node off from its peers
    Partition,
}

impl FaultKind {
    fn default_path(&self) -> &'static str {
        match self {
            FaultKind::Kill => "/api/cluster/kill",
            FaultKind::Partition => "/api/cluster/partition",
        }
    }
}

/// When the target counts as recovered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RecoveryCriterion {
    /// The health endpoint answers with a success status
    StatusOk,
    /// A numeric field of the JSON health body reaches `min`
    Quorum { field: String, min: f64 },
}

impl Default for RecoveryCriterion {
    fn default() -> Self {
        RecoveryCriterion::Quorum {
            field: "nodes_available".to_string(),
            min: 2.0,
        }
    }
}

impl RecoveryCriterion {
    /// Numeric value the criterion looks at, if any
    pub fn observe(&self, response: &TargetResponse) -> Option<f64> {
        match self {
            RecoveryCriterion::StatusOk => None,
            RecoveryCriterion::Quorum { field, .. } => {
                let body: serde_json::Value = response.json().ok()?;
                json_field(&body, field).and_then(serde_json::Value::as_f64)
            }
        }
    }

    pub fn is_healthy(&self, response: &TargetResponse) -> bool {
        if !response.is_success() {
            return false;
        }
        match self {
            RecoveryCriterion::StatusOk => true,
            RecoveryCriterion::Quorum { min, .. } => {
                self.observe(response).is_some_and(|value| value >= *min)
            }
        }
    }
}

/// Look up a field by dotted path (`cluster.nodes_available`) or JSON pointer
pub(crate) fn json_field<'a>(body: &'a serde_json::Value, field: &str) -> Option<&'a serde_json::Value> {
    if field.starts_with('/') {
        body.pointer(field)
    } else {
        field.split('.').try_fold(body, |value, key| value.get(key))
    }
}

fn default_health_path() -> String {
    "/api/cluster/health".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_max_wait() -> Duration {
    Duration::from_secs(5)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_fault_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_duration_metric() -> String {
    "failover_duration".to_string()
}

fn default_success_metric() -> String {
    "failover_success".to_string()
}

/// Chaos coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Node base addresses; faults go to the target base address when empty
    #[serde(default)]
    pub nodes: Vec<String>,

    #[serde(default)]
    pub fault: FaultKind,

    /// Fault command path on the selected node (default depends on `fault`)
    #[serde(default)]
    pub fault_path: Option<String>,

    /// Health endpoint, relative to the target base address
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default)]
    pub recovery: RecoveryCriterion,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,

    /// Pause after each injection
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Timeout of the fault command request
    #[serde(default = "default_fault_timeout", with = "humantime_serde")]
    pub fault_timeout: Duration,

    #[serde(default = "default_duration_metric")]
    pub duration_metric: String,

    #[serde(default = "default_success_metric")]
    pub success_metric: String,

    /// Gauge fed with the last value seen by a quorum criterion
    #[serde(default)]
    pub nodes_gauge: Option<String>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            fault: FaultKind::default(),
            fault_path: None,
            health_path: default_health_path(),
            recovery: RecoveryCriterion::default(),
            poll_interval: default_poll_interval(),
            max_wait: default_max_wait(),
            cooldown: default_cooldown(),
            fault_timeout: default_fault_timeout(),
            duration_metric: default_duration_metric(),
            success_metric: default_success_metric(),
            nodes_gauge: None,
        }
    }
}

impl ChaosConfig {
    pub fn fault_path(&self) -> &str {
        self.fault_path
            .as_deref()
            .unwrap_or_else(|| self.fault.default_path())
    }

    /// Metrics written by each injection
    pub fn metrics(&self) -> Vec<MetricDecl> {
        let mut metrics = vec![
            MetricDecl::duration(&self.duration_metric),
            MetricDecl::rate(&self.success_metric),
        ];
        if let Some(gauge) = &self.nodes_gauge {
            metrics.push(MetricDecl::gauge(gauge));
        }
        metrics
    }

    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidWorkload {
            scenario: scenario.to_string(),
            reason: reason.to_string(),
        };

        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval must be > 0"));
        }
        if self.max_wait.is_zero() {
            return Err(invalid("max_wait must be > 0"));
        }
        if self.poll_interval > self.max_wait {
            return Err(invalid("poll_interval must not exceed max_wait"));
        }
        if self.duration_metric.trim().is_empty() || self.success_metric.trim().is_empty() {
            return Err(invalid("metric names must not be empty"));
        }
        if let RecoveryCriterion::Quorum { field, .. } = &self.recovery {
            if field.trim().is_empty() {
                return Err(invalid("quorum field must not be empty"));
            }
        }
        if self.nodes.iter().any(|n| n.trim().is_empty()) {
            return Err(invalid("node addresses must not be empty"));
        }
        Ok(())
    }
}

/// Uniform random node choice without replacement
///
/// Every node is picked once before any node is picked again.
pub struct NodeSelector {
    nodes: Vec<String>,
    state: Mutex<SelectorState>,
}

struct SelectorState {
    remaining: Vec<String>,
    rng: fastrand::Rng,
}

impl NodeSelector {
    pub fn new(nodes: Vec<String>) -> Self {
        Self::with_rng(nodes, fastrand::Rng::new())
    }

    /// Deterministic selector for tests
    pub fn with_seed(nodes: Vec<String>, seed: u64) -> Self {
        Self::with_rng(nodes, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(nodes: Vec<String>, rng: fastrand::Rng) -> Self {
        Self {
            state: Mutex::new(SelectorState {
                remaining: nodes.clone(),
                rng,
            }),
            nodes,
        }
    }

    /// Next node, or `None` when there are no nodes at all
    pub fn next_node(&self) -> Option<String> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        if state.remaining.is_empty() {
            debug!("All {} nodes targeted, resetting selection", self.nodes.len());
            state.remaining = self.nodes.clone();
        }
        let len = state.remaining.len();
        let idx = state.rng.usize(..len);
        Some(state.remaining.swap_remove(idx))
    }
}

/// Result of a recovery poll
///
/// Exactly one of the two happens for every injection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recovery {
    /// Healthy within the maximum wait, after this long
    Recovered(Duration),
    /// Still unhealthy when the maximum wait elapsed
    GaveUp(Duration),
}

impl Recovery {
    /// Duration sample to record; the maximum wait when giving up
    pub fn duration(&self) -> Duration {
        match self {
            Recovery::Recovered(d) | Recovery::GaveUp(d) => *d,
        }
    }

    pub fn recovered(&self) -> bool {
        matches!(self, Recovery::Recovered(_))
    }
}

/// Poll settings for [`poll_until_recovered`]
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub health: TargetRequest,
    pub criterion: RecoveryCriterion,
    pub interval: Duration,
    pub max_wait: Duration,
}

/// Probe health at a fixed interval until recovered or `max_wait` has elapsed
/// since `started`
///
/// Returns the recovery result and the last value the criterion observed.
pub async fn poll_until_recovered(
    connector: &dyn TargetConnector,
    settings: &PollSettings,
    started: Instant,
) -> (Recovery, Option<f64>) {
    let mut last_observed = None;
    let mut probes = 0u32;
    loop {
        sleep(settings.interval).await;
        probes += 1;

        let remaining = settings.max_wait.saturating_sub(started.elapsed());
        let healthy = match timeout(remaining, connector.request(settings.health.clone())).await {
            Ok(Ok(response)) => {
                if let Some(value) = settings.criterion.observe(&response) {
                    last_observed = Some(value);
                }
                settings.criterion.is_healthy(&response)
            }
            Ok(Err(e)) => {
                debug!("Health probe {} failed: {}", probes, e);
                false
            }
            Err(_) => false,
        };

        let elapsed = started.elapsed();
        if healthy && elapsed <= settings.max_wait {
            debug!("Target recovered after {:?} ({} probes)", elapsed, probes);
            return (Recovery::Recovered(elapsed), last_observed);
        }
        if elapsed >= settings.max_wait {
            return (Recovery::GaveUp(settings.max_wait), last_observed);
        }
    }
}

/// Iteration that injects one fault and measures recovery
pub struct ChaosCoordinator {
    config: ChaosConfig,
    selector: NodeSelector,
    poll: PollSettings,
}

impl ChaosCoordinator {
    pub fn new(config: ChaosConfig) -> Self {
        let selector = NodeSelector::new(config.nodes.clone());
        Self::with_selector(config, selector)
    }

    pub fn with_selector(config: ChaosConfig, selector: NodeSelector) -> Self {
        let poll = PollSettings {
            health: TargetRequest::get(config.health_path.clone())
                .timeout(config.poll_interval.max(config.fault_timeout))
                .tag("health_probe"),
            criterion: config.recovery.clone(),
            interval: config.poll_interval,
            max_wait: config.max_wait,
        };
        Self {
            config,
            selector,
            poll,
        }
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Bounded-iterations scenario performing `injections` faults
    pub fn scenario(
        self,
        name: impl Into<String>,
        injections: u64,
        max_duration: Duration,
    ) -> ScenarioSpec {
        ScenarioSpec::new(
            name,
            SchedulingPolicy::BoundedIterations {
                iterations: injections,
                clients: 1,
                max_duration: Some(max_duration),
            },
            Arc::new(self),
        )
    }

    async fn inject(&self, connector: &dyn TargetConnector, node: Option<&str>) {
        let path = match node {
            Some(node) => resolve_url(node, self.config.fault_path()),
            None => self.config.fault_path().to_string(),
        };
        let mut request = TargetRequest::post(path)
            .timeout(self.config.fault_timeout)
            .tag("fault");
        if self.config.fault == FaultKind::Partition {
            request = request.json(&serde_json::json!({ "node": node }));
        }

        // The node may die before answering; the poll decides the outcome
        match connector.request(request).await {
            Ok(response) => debug!(
                "{:?} fault sent to {}: status {}",
                self.config.fault,
                node.unwrap_or("target"),
                response.status
            ),
            Err(e) => debug!(
                "{:?} fault to {} returned an error: {}",
                self.config.fault,
                node.unwrap_or("target"),
                e
            ),
        }
    }
}

#[async_trait]
impl Iteration for ChaosCoordinator {
    fn metrics(&self) -> Vec<MetricDecl> {
        self.config.metrics()
    }

    async fn run(&self, ctx: &IterationContext) -> Result<(), IterationError> {
        let node = self.selector.next_node();
        let started = Instant::now();

        self.inject(ctx.connector.as_ref(), node.as_deref()).await;
        let (recovery, observed) =
            poll_until_recovered(ctx.connector.as_ref(), &self.poll, started).await;

        ctx.metrics
            .add_duration(&self.config.duration_metric, recovery.duration())?;
        ctx.metrics
            .add_rate(&self.config.success_metric, recovery.recovered())?;
        if let (Some(gauge), Some(value)) = (&self.config.nodes_gauge, observed) {
            ctx.metrics.set_gauge(gauge, value)?;
        }

        match recovery {
            Recovery::Recovered(d) => debug!(
                "Injection {} on {} recovered in {:?}",
                ctx.iteration,
                node.as_deref().unwrap_or("target"),
                d
            ),
            Recovery::GaveUp(max) => warn!(
                "Injection {} on {}: no recovery within {:?}",
                ctx.iteration,
                node.as_deref().unwrap_or("target"),
                max
            ),
        }

        ctx.pace(self.config.cooldown).await;
        Ok(())
    }
}

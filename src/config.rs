// Run Plan Configuration
//
// This module parses loadgate run plans. A plan is a TOML file describing
// the target, the scenarios to run and the thresholds that gate the result.
// Environment variable overrides are applied after parsing and before
// validation, so CI jobs can point a checked-in plan at another deployment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::connector::http::{HttpConnector, DEFAULT_REQUEST_TIMEOUT};
use crate::error::ConfigError;
use crate::run::{RunPlan, DEFAULT_GRACEFUL_STOP, DEFAULT_RAMP_TICK};
use crate::scenario::{ScenarioSpec, SchedulingPolicy};
use crate::threshold::ThresholdGate;
use crate::workloads::WorkloadConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// System under test
    pub target: TargetConfig,

    /// Run-wide limits
    pub run: RunConfig,

    /// Harness telemetry endpoint
    pub telemetry: TelemetryConfig,

    /// Scenarios, in declaration order
    pub scenarios: Vec<ScenarioConfig>,

    /// Metric name to threshold expressions
    pub thresholds: BTreeMap<String, Vec<String>>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Target configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetConfig {
    /// Base address every relative request path is resolved against
    pub base_url: String,

    /// Cluster node addresses used by chaos workloads
    pub nodes: Vec<String>,

    /// Default per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            nodes: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Run-wide limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Hard deadline for the whole run
    #[serde(with = "humantime_serde")]
    pub ceiling: Duration,

    /// Default drain period after a scenario window closes
    #[serde(with = "humantime_serde")]
    pub graceful_stop: Duration,

    /// Re-evaluation interval of ramping scenarios
    #[serde(with = "humantime_serde")]
    pub ramp_tick: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ceiling: Duration::from_secs(600),
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            ramp_tick: DEFAULT_RAMP_TICK,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Whether to serve harness telemetry while the run executes
    pub enabled: bool,

    /// Port for the telemetry server
    pub port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// One `[[scenarios]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioConfig {
    pub name: String,

    /// Offset from run start
    #[serde(default, with = "humantime_serde")]
    pub start_time: Duration,

    /// Overrides `[run] graceful_stop`
    #[serde(default, with = "humantime_serde")]
    pub graceful_stop: Option<Duration>,

    /// Scheduling policy, tagged by `executor`
    #[serde(flatten)]
    pub policy: SchedulingPolicy,

    pub workload: WorkloadConfig,
}

impl Config {
    /// Load a run plan from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// configuration is invalid after environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run plan from {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse run plan from {:?}", path))?;

        tracing::debug!("Loaded run plan from {:?}", path);
        Ok(config)
    }

    /// Parse a run plan, apply environment overrides and validate it
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over plan values:
    /// - LOADGATE_BASE_URL
    /// - LOADGATE_NODES (comma-separated)
    /// - LOADGATE_LOG_LEVEL
    /// - LOADGATE_LOG_FORMAT
    /// - LOADGATE_TELEMETRY_PORT
    ///
    /// Invalid values are ignored.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = var("LOADGATE_BASE_URL") {
            if !url.trim().is_empty() {
                self.target.base_url = url.trim().to_string();
            }
        }
        if let Some(nodes) = var("LOADGATE_NODES") {
            let nodes: Vec<String> = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
            if !nodes.is_empty() {
                self.target.nodes = nodes;
            }
        }

        if let Some(level) = var("LOADGATE_LOG_LEVEL") {
            if is_valid_level(&level) {
                self.logging.level = level;
            }
        }
        if let Some(format) = var("LOADGATE_LOG_FORMAT") {
            if is_valid_format(&format) {
                self.logging.format = format;
            }
        }

        if let Some(port) = var("LOADGATE_TELEMETRY_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                if port > 0 {
                    self.telemetry.port = port;
                }
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// Scenario and threshold semantics are checked when the run is built.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_level(&self.logging.level) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            );
        }
        if !is_valid_format(&self.logging.format) {
            anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            );
        }

        if self.target.base_url.trim().is_empty() {
            anyhow::bail!("Target base_url must not be empty");
        }
        if self.target.request_timeout.is_zero() {
            anyhow::bail!("Target request_timeout must be > 0");
        }

        if self.telemetry.port == 0 {
            anyhow::bail!("Telemetry port must be > 0");
        }

        if self.scenarios.is_empty() {
            anyhow::bail!("Run plan declares no scenarios");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Build the scenarios and threshold gate described by the plan
    pub fn plan(&self) -> Result<RunPlan, ConfigError> {
        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        for entry in &self.scenarios {
            entry.workload.validate(&entry.name)?;
            let mut spec = ScenarioSpec::new(
                entry.name.clone(),
                entry.policy.clone(),
                entry.workload.build(&self.target.nodes),
            )
            .start_offset(entry.start_time);
            if let Some(grace) = entry.graceful_stop {
                spec = spec.graceful_stop(grace);
            }
            scenarios.push(spec);
        }

        let gate = ThresholdGate::from_map(&self.thresholds)?;

        let mut plan = RunPlan::new(scenarios, gate, self.run.ceiling);
        plan.graceful_stop = self.run.graceful_stop;
        plan.ramp_tick = self.run.ramp_tick;
        plan.telemetry_port = self.telemetry.enabled.then_some(self.telemetry.port);
        Ok(plan)
    }

    /// HTTP connector for the configured target
    pub fn connector(&self) -> Result<Arc<HttpConnector>> {
        let connector =
            HttpConnector::with_timeout(self.target.base_url.clone(), self.target.request_timeout)
                .with_context(|| format!("Failed to build connector for {}", self.target.base_url))?;
        Ok(Arc::new(connector))
    }
}

fn is_valid_level(level: &str) -> bool {
    matches!(
        level.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}

fn is_valid_format(format: &str) -> bool {
    matches!(format.to_lowercase().as_str(), "json" | "pretty" | "compact")
}

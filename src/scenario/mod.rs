//! Scenario specs and scheduling policies
//!
//! A scenario is one population of virtual clients driven by a
//! [`SchedulingPolicy`]. The policy set is closed; each variant is validated
//! when the run is constructed, and unknown policy names are rejected when the
//! plan is parsed.
//!
//! # Policies
//!
//! | Policy | Clients | Ends when |
//! |--------|---------|-----------|
//! | `fixed-concurrency` | exactly `clients` | `duration` elapses |
//! | `ramping-concurrency` | follows `stages` | last stage elapses |
//! | `fixed-rate` | pool between `min_pool` and `max_pool` | `duration` elapses |
//! | `bounded-iterations` | `clients` sharing a budget | budget spent, `max_duration` or the run ceiling |

pub mod executor;

pub use executor::{execute, ExecutorEnv};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::client::Iteration;
use crate::error::ConfigError;

fn default_time_unit() -> Duration {
    Duration::from_secs(1)
}

fn default_min_pool() -> u32 {
    1
}

fn default_clients() -> u32 {
    1
}

/// One step of a ramping schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Time spent moving toward `target`
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Live client count at the end of the stage
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// How ramping scenarios move between stage targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RampMode {
    /// Interpolate linearly across the stage
    #[default]
    Linear,
    /// Jump to the stage target at the start of the stage
    Immediate,
}

/// Scheduling policy of a scenario
///
/// Parameters not belonging to the selected policy are rejected, so a
/// misspelled key never falls back to its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case", deny_unknown_fields)]
pub enum SchedulingPolicy {
    FixedConcurrency {
        clients: u32,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    RampingConcurrency {
        #[serde(default)]
        start_clients: u32,
        stages: Vec<Stage>,
        #[serde(default)]
        ramp: RampMode,
    },
    FixedRate {
        /// Iterations started per `time_unit`
        rate: u32,
        #[serde(default = "default_time_unit", with = "humantime_serde")]
        time_unit: Duration,
        #[serde(with = "humantime_serde")]
        duration: Duration,
        /// Clients created before the first iteration is due
        #[serde(default = "default_min_pool")]
        min_pool: u32,
        /// Upper bound of the pool; unbounded when absent
        #[serde(default)]
        max_pool: Option<u32>,
    },
    BoundedIterations {
        /// Total iterations across all clients
        iterations: u64,
        #[serde(default = "default_clients")]
        clients: u32,
        /// Open-ended (bounded by the run ceiling) when absent
        #[serde(default, with = "humantime_serde")]
        max_duration: Option<Duration>,
    },
}

impl SchedulingPolicy {
    /// Policy name as written in plans
    pub fn name(&self) -> &'static str {
        match self {
            SchedulingPolicy::FixedConcurrency { .. } => "fixed-concurrency",
            SchedulingPolicy::RampingConcurrency { .. } => "ramping-concurrency",
            SchedulingPolicy::FixedRate { .. } => "fixed-rate",
            SchedulingPolicy::BoundedIterations { .. } => "bounded-iterations",
        }
    }

    /// Maximum time the scenario's clients are driven, excluding the grace period
    ///
    /// `None` for bounded iterations without a `max_duration`.
    pub fn window(&self) -> Option<Duration> {
        match self {
            SchedulingPolicy::FixedConcurrency { duration, .. } => Some(*duration),
            SchedulingPolicy::RampingConcurrency { stages, .. } => {
                Some(stages.iter().map(|s| s.duration).sum())
            }
            SchedulingPolicy::FixedRate { duration, .. } => Some(*duration),
            SchedulingPolicy::BoundedIterations { max_duration, .. } => *max_duration,
        }
    }

    /// Check parameter ranges
    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy {
            scenario: scenario.to_string(),
            reason: reason.to_string(),
        };

        match self {
            SchedulingPolicy::FixedConcurrency { clients, duration } => {
                if *clients == 0 {
                    return Err(invalid("clients must be > 0"));
                }
                if duration.is_zero() {
                    return Err(invalid("duration must be > 0"));
                }
            }
            SchedulingPolicy::RampingConcurrency { stages, .. } => {
                if stages.is_empty() {
                    return Err(invalid("at least one stage is required"));
                }
                if stages.iter().all(|s| s.duration.is_zero()) {
                    return Err(invalid("total stage duration must be > 0"));
                }
            }
            SchedulingPolicy::FixedRate {
                rate,
                time_unit,
                duration,
                min_pool,
                max_pool,
            } => {
                if *rate == 0 {
                    return Err(invalid("rate must be > 0"));
                }
                if time_unit.is_zero() {
                    return Err(invalid("time_unit must be > 0"));
                }
                if duration.is_zero() {
                    return Err(invalid("duration must be > 0"));
                }
                if let Some(max) = max_pool {
                    if *max == 0 {
                        return Err(invalid("max_pool must be > 0"));
                    }
                    if min_pool > max {
                        return Err(invalid("min_pool must be <= max_pool"));
                    }
                }
            }
            SchedulingPolicy::BoundedIterations {
                iterations,
                clients,
                max_duration,
            } => {
                if *iterations == 0 {
                    return Err(invalid("iterations must be > 0"));
                }
                if *clients == 0 {
                    return Err(invalid("clients must be > 0"));
                }
                if max_duration.is_some_and(|d| d.is_zero()) {
                    return Err(invalid("max_duration must be > 0"));
                }
            }
        }
        Ok(())
    }
}

/// Live client target of a ramping schedule at `elapsed`
///
/// After the last stage the final target is returned; the executor stops the
/// scenario at that point anyway.
pub fn target_clients(start: u32, stages: &[Stage], ramp: RampMode, elapsed: Duration) -> u32 {
    let mut stage_start = Duration::ZERO;
    let mut prev = start;
    for stage in stages {
        if elapsed < stage_start + stage.duration {
            return match ramp {
                RampMode::Immediate => stage.target,
                RampMode::Linear => {
                    let progress = (elapsed - stage_start).as_secs_f64()
                        / stage.duration.as_secs_f64();
                    let diff = stage.target as f64 - prev as f64;
                    (prev as f64 + diff * progress) as u32
                }
            };
        }
        stage_start += stage.duration;
        prev = stage.target;
    }
    prev
}

/// An immutable scenario definition
#[derive(Clone)]
pub struct ScenarioSpec {
    pub name: String,
    pub policy: SchedulingPolicy,
    /// Delay after run start before the scenario begins
    pub start_offset: Duration,
    /// Drain period after the window closes; the run default when `None`
    pub graceful_stop: Option<Duration>,
    pub iteration: Arc<dyn Iteration>,
}

impl fmt::Debug for ScenarioSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioSpec")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("start_offset", &self.start_offset)
            .field("graceful_stop", &self.graceful_stop)
            .finish_non_exhaustive()
    }
}

impl ScenarioSpec {
    pub fn new(
        name: impl Into<String>,
        policy: SchedulingPolicy,
        iteration: Arc<dyn Iteration>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            start_offset: Duration::ZERO,
            graceful_stop: None,
            iteration,
        }
    }

    pub fn start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn graceful_stop(mut self, grace: Duration) -> Self {
        self.graceful_stop = Some(grace);
        self
    }

    /// Offset at which the scenario's window closes, if it has one
    pub fn end(&self) -> Option<Duration> {
        self.policy.window().map(|window| self.start_offset + window)
    }

    /// Validate the policy and check the window fits under the run ceiling
    pub fn validate(&self, ceiling: Duration) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidPolicy {
                scenario: self.name.clone(),
                reason: "scenario name must not be empty".to_string(),
            });
        }
        self.policy.validate(&self.name)?;
        let end = self.end().unwrap_or(self.start_offset);
        if end > ceiling || self.start_offset >= ceiling {
            return Err(ConfigError::WindowExceedsCeiling {
                scenario: self.name.clone(),
                end,
                ceiling,
            });
        }
        Ok(())
    }
}

/// What happened while a scenario ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub policy: String,
    /// Iterations that began
    pub started: u64,
    /// Iterations that ran to completion, failed or not
    pub completed: u64,
    /// Completed iterations that ended in a contained error
    pub failed: u64,
    /// Fixed-rate iterations dropped for lack of a free client
    pub dropped: u64,
    /// The scheduler stopped the scenario before its window closed
    pub interrupted: bool,
    /// Clients were still running after the grace period and were aborted
    pub forced_stop: bool,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FnIteration, IterationContext, IterationError};

    fn noop() -> Arc<dyn Iteration> {
        Arc::new(FnIteration::new(|_ctx: IterationContext| async move {
            Ok::<(), IterationError>(())
        }))
    }

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        scenario: SchedulingPolicy,
    }

    #[test]
    fn test_parse_fixed_rate_policy() {
        let toml = r#"
            [scenario]
            executor = "fixed-rate"
            rate = 1000
            duration = "5m"
            min_pool = 50
            max_pool = 200
        "#;
        let parsed: Wrapper = toml::from_str(toml).unwrap();
        assert_eq!(
            parsed.scenario,
            SchedulingPolicy::FixedRate {
                rate: 1000,
                time_unit: Duration::from_secs(1),
                duration: Duration::from_secs(300),
                min_pool: 50,
                max_pool: Some(200),
            }
        );
    }

    #[test]
    fn test_parse_ramping_policy() {
        let toml = r#"
            [scenario]
            executor = "ramping-concurrency"
            stages = [
                { duration = "30s", target = 100 },
                { duration = "1m", target = 100 },
                { duration = "30s", target = 0 },
            ]
        "#;
        let parsed: Wrapper = toml::from_str(toml).unwrap();
        assert_eq!(parsed.scenario.window(), Some(Duration::from_secs(120)));
        assert_eq!(parsed.scenario.name(), "ramping-concurrency");
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let toml = r#"
            [scenario]
            executor = "per-vu-iterations"
            iterations = 5
        "#;
        assert!(toml::from_str::<Wrapper>(toml).is_err());
    }

    #[test]
    fn test_misspelled_policy_key_is_rejected() {
        let toml = r#"
            [scenario]
            executor = "fixed-rate"
            rate = 10
            duration = "1s"
            max_pol = 1
        "#;
        let err = toml::from_str::<Wrapper>(toml).unwrap_err();
        assert!(err.to_string().contains("max_pol"), "{}", err);
    }

    #[test]
    fn test_open_ended_bounded_iterations_fit_any_ceiling() {
        let toml = r#"
            [scenario]
            executor = "bounded-iterations"
            iterations = 10
        "#;
        let parsed: Wrapper = toml::from_str(toml).unwrap();
        assert_eq!(parsed.scenario.window(), None);

        let spec = ScenarioSpec::new("chaos", parsed.scenario, noop())
            .start_offset(Duration::from_secs(30));
        assert!(spec.validate(Duration::from_secs(600)).is_ok());
        // starting at the ceiling leaves no time at all
        assert!(spec.validate(Duration::from_secs(30)).is_err());
    }

    #[test]
    fn test_policy_validation() {
        let bad = SchedulingPolicy::FixedConcurrency {
            clients: 0,
            duration: Duration::from_secs(10),
        };
        assert!(matches!(
            bad.validate("steady"),
            Err(ConfigError::InvalidPolicy { .. })
        ));

        let bad_pool = SchedulingPolicy::FixedRate {
            rate: 10,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(10),
            min_pool: 5,
            max_pool: Some(2),
        };
        assert!(bad_pool.validate("rpc").is_err());

        let empty = SchedulingPolicy::RampingConcurrency {
            start_clients: 0,
            stages: vec![],
            ramp: RampMode::Linear,
        };
        assert!(empty.validate("ramp").is_err());
    }

    #[test]
    fn test_window_exceeding_ceiling() {
        let spec = ScenarioSpec::new(
            "chaos",
            SchedulingPolicy::BoundedIterations {
                iterations: 5,
                clients: 1,
                max_duration: Some(Duration::from_secs(240)),
            },
            noop(),
        )
        .start_offset(Duration::from_secs(60));

        assert!(spec.validate(Duration::from_secs(300)).is_ok());
        assert_eq!(
            spec.validate(Duration::from_secs(299)).unwrap_err(),
            ConfigError::WindowExceedsCeiling {
                scenario: "chaos".to_string(),
                end: Duration::from_secs(300),
                ceiling: Duration::from_secs(299),
            }
        );
    }

    #[test]
    fn test_linear_ramp_targets() {
        let stages = [
            Stage::new(Duration::from_secs(10), 100),
            Stage::new(Duration::from_secs(10), 100),
            Stage::new(Duration::from_secs(10), 0),
        ];
        let at = |s: u64| target_clients(0, &stages, RampMode::Linear, Duration::from_secs(s));
        assert_eq!(at(0), 0);
        assert_eq!(at(5), 50);
        assert_eq!(at(10), 100);
        assert_eq!(at(15), 100);
        assert_eq!(at(25), 50);
        assert_eq!(at(30), 0);
    }

    #[test]
    fn test_immediate_ramp_targets() {
        let stages = [
            Stage::new(Duration::from_secs(10), 20),
            Stage::new(Duration::from_secs(10), 5),
        ];
        let at = |s: u64| target_clients(3, &stages, RampMode::Immediate, Duration::from_secs(s));
        assert_eq!(at(0), 20);
        assert_eq!(at(9), 20);
        assert_eq!(at(10), 5);
        assert_eq!(at(60), 5);
    }

    #[test]
    fn test_ramp_starts_from_start_clients() {
        let stages = [Stage::new(Duration::from_secs(10), 20)];
        assert_eq!(
            target_clients(10, &stages, RampMode::Linear, Duration::from_secs(5)),
            15
        );
    }
}

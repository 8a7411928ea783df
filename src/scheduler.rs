//! Scenario Scheduler
//!
//! Runs every scenario of a run concurrently on one timeline. Each scenario
//! starts at `run_start + start_offset`; overlap is allowed. The scheduler
//! returns once every scenario is terminal, or raises shutdown at the run
//! ceiling so the remaining scenarios drain and stop.
//!
//! The scheduler writes no metrics of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::error::HarnessError;
use crate::scenario::{execute, ExecutorEnv, ScenarioOutcome, ScenarioSpec};

type ScenarioTask = (usize, Result<ScenarioOutcome, HarnessError>);

/// Run all scenarios, returning their outcomes in declaration order
pub async fn run_scenarios(
    scenarios: &[Arc<ScenarioSpec>],
    env: ExecutorEnv,
    ceiling: Duration,
) -> Result<Vec<ScenarioOutcome>, HarnessError> {
    let run_start = Instant::now();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks: JoinSet<ScenarioTask> = JoinSet::new();
    let mut names: HashMap<Id, String> = HashMap::new();

    for (idx, spec) in scenarios.iter().enumerate() {
        let name = spec.name.clone();
        let spec = spec.clone();
        let env = env.clone();
        let mut shutdown = shutdown_rx.clone();
        let handle = tasks.spawn(async move {
            let start_at = run_start + spec.start_offset;
            let stopped_early = tokio::select! {
                _ = sleep_until(start_at) => false,
                res = shutdown.wait_for(|stop| *stop) => res.is_ok(),
            };
            if stopped_early {
                info!("Scenario '{}' never started: run is shutting down", spec.name);
                return (idx, Ok(not_started(&spec)));
            }
            (idx, execute(&spec, env, shutdown).await)
        });
        names.insert(handle.id(), name);
    }

    let ceiling_at = run_start + ceiling;
    let mut ceiling_reached = false;
    let mut outcomes: Vec<Option<ScenarioOutcome>> = vec![None; scenarios.len()];

    loop {
        tokio::select! {
            joined = tasks.join_next_with_id() => match joined {
                None => break,
                Some(Ok((_, (idx, Ok(outcome))))) => outcomes[idx] = Some(outcome),
                Some(Ok((_, (idx, Err(e))))) => {
                    error!("Scenario '{}' failed, aborting run: {}", scenarios[idx].name, e);
                    let _ = shutdown_tx.send(true);
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(e);
                }
                Some(Err(join_err)) => {
                    let scenario = names
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    error!("Scenario '{}' executor stopped unexpectedly: {}", scenario, join_err);
                    let _ = shutdown_tx.send(true);
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(HarnessError::Aborted { scenario });
                }
            },
            _ = sleep_until(ceiling_at), if !ceiling_reached => {
                ceiling_reached = true;
                warn!(
                    "Run ceiling of {:?} reached with {} scenarios still running, shutting down",
                    ceiling,
                    tasks.len()
                );
                let _ = shutdown_tx.send(true);
            }
        }
    }

    info!("All scenarios finished in {:?}", run_start.elapsed());
    Ok(outcomes.into_iter().flatten().collect())
}

fn not_started(spec: &ScenarioSpec) -> ScenarioOutcome {
    ScenarioOutcome {
        name: spec.name.clone(),
        policy: spec.policy.name().to_string(),
        started: 0,
        completed: 0,
        failed: 0,
        dropped: 0,
        interrupted: true,
        forced_stop: false,
        elapsed: Duration::ZERO,
    }
}

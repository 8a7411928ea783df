//! Scenario executors
//!
//! One executor per policy. All of them share the same shape:
//!
//! 1. spawn clients into a `JoinSet`
//! 2. react to wall-clock ticks, the scheduler's shutdown signal and client
//!    exits in a single `select!` loop
//! 3. raise the stop signal and drain, aborting whatever is still running
//!    once the grace period is over
//!
//! A client task only ends early on a fatal metric error (or a panic), which
//! aborts the scenario.

use std::future::pending;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::{target_clients, RampMode, ScenarioOutcome, ScenarioSpec, SchedulingPolicy, Stage};
use crate::client::{ClientResources, ScenarioCounters, VirtualClient};
use crate::connector::TargetConnector;
use crate::error::{HarnessError, MetricError};
use crate::metrics::{MetricSink, DROPPED_ITERATIONS};
use crate::telemetry::HarnessTelemetry;

/// Run-wide resources shared by every executor
#[derive(Clone)]
pub struct ExecutorEnv {
    pub metrics: MetricSink,
    pub connector: Arc<dyn TargetConnector>,
    pub telemetry: Option<HarnessTelemetry>,
    /// Grace period for scenarios that do not set their own
    pub graceful_stop: Duration,
    /// How often ramping scenarios re-evaluate their target
    pub ramp_tick: Duration,
}

/// How the driving phase of a scenario ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// Window closed or work finished
    Completed,
    /// The scheduler asked for shutdown
    Interrupted,
}

/// Drive a scenario to its terminal state
pub async fn execute(
    spec: &ScenarioSpec,
    env: ExecutorEnv,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ScenarioOutcome, HarnessError> {
    let counters = Arc::new(ScenarioCounters::default());
    let resources = ClientResources {
        scenario: Arc::from(spec.name.as_str()),
        iteration: spec.iteration.clone(),
        metrics: env.metrics.clone(),
        connector: env.connector.clone(),
        telemetry: env.telemetry.clone(),
        counters: counters.clone(),
    };
    let grace = spec.graceful_stop.unwrap_or(env.graceful_stop);
    let started = Instant::now();

    info!(
        "Scenario '{}' started ({}, window {:?})",
        spec.name,
        spec.policy.name(),
        spec.policy.window()
    );

    let (ending, forced_stop) = match &spec.policy {
        SchedulingPolicy::FixedConcurrency { clients, duration } => {
            fixed_concurrency(resources, *clients, *duration, grace, &mut shutdown).await?
        }
        SchedulingPolicy::RampingConcurrency {
            start_clients,
            stages,
            ramp,
        } => {
            ramping_concurrency(
                resources,
                Ramp {
                    start: *start_clients,
                    stages,
                    mode: *ramp,
                    tick: env.ramp_tick,
                },
                grace,
                &mut shutdown,
            )
            .await?
        }
        SchedulingPolicy::FixedRate {
            rate,
            time_unit,
            duration,
            min_pool,
            max_pool,
        } => {
            let interval = time_unit.div_f64(f64::from(*rate));
            fixed_rate(
                resources,
                Pacing {
                    interval,
                    duration: *duration,
                    min_pool: *min_pool,
                    max_pool: *max_pool,
                },
                grace,
                &mut shutdown,
            )
            .await?
        }
        SchedulingPolicy::BoundedIterations {
            iterations,
            clients,
            max_duration,
        } => {
            bounded_iterations(
                resources,
                *iterations,
                *clients,
                *max_duration,
                grace,
                &mut shutdown,
            )
            .await?
        }
    };

    let outcome = ScenarioOutcome {
        name: spec.name.clone(),
        policy: spec.policy.name().to_string(),
        started: counters.started(),
        completed: counters.completed(),
        failed: counters.failed(),
        dropped: counters.dropped(),
        interrupted: ending == Ending::Interrupted,
        forced_stop,
        elapsed: started.elapsed(),
    };

    info!(
        "Scenario '{}' finished: {} iterations completed, {} failed, {} dropped in {:?}",
        outcome.name, outcome.completed, outcome.failed, outcome.dropped, outcome.elapsed
    );

    Ok(outcome)
}

/// Resolves once the scheduler raises shutdown; never if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        pending::<()>().await;
    }
}

fn check_joined<T>(
    scenario: &str,
    joined: Result<Result<T, MetricError>, JoinError>,
) -> Result<Option<T>, HarnessError> {
    match joined {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(e)) => Err(HarnessError::Metric(e)),
        Err(e) if e.is_panic() => Err(HarnessError::ClientPanicked {
            scenario: scenario.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

async fn abort_all<T: 'static>(clients: &mut JoinSet<Result<T, MetricError>>) {
    clients.abort_all();
    while clients.join_next().await.is_some() {}
}

/// Wait for clients to finish, aborting them once `grace` runs out
///
/// Returns whether any client had to be aborted.
async fn drain<T: 'static>(
    scenario: &str,
    clients: &mut JoinSet<Result<T, MetricError>>,
    grace: Duration,
) -> Result<bool, HarnessError> {
    let deadline = Instant::now() + grace;
    loop {
        tokio::select! {
            joined = clients.join_next() => match joined {
                None => return Ok(false),
                Some(joined) => {
                    if let Err(e) = check_joined(scenario, joined) {
                        abort_all(clients).await;
                        return Err(e);
                    }
                }
            },
            _ = sleep_until(deadline) => {
                warn!(
                    "Scenario '{}' still has {} clients after {:?} grace, forcing stop",
                    scenario,
                    clients.len(),
                    grace
                );
                abort_all(clients).await;
                return Ok(true);
            }
        }
    }
}

/// Watch clients until `deadline` or shutdown, failing fast on fatal errors
async fn supervise(
    scenario: &str,
    clients: &mut JoinSet<Result<(), MetricError>>,
    deadline: Instant,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Ending, HarnessError> {
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return Ok(Ending::Completed),
            _ = shutdown_requested(shutdown) => return Ok(Ending::Interrupted),
            Some(joined) = clients.join_next() => {
                if let Err(e) = check_joined(scenario, joined) {
                    abort_all(clients).await;
                    return Err(e);
                }
            }
        }
    }
}

async fn fixed_concurrency(
    resources: ClientResources,
    clients: u32,
    duration: Duration,
    grace: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(Ending, bool), HarnessError> {
    let scenario = resources.scenario.clone();
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut set = JoinSet::new();
    let deadline = Instant::now() + duration;

    for id in 0..u64::from(clients) {
        let client = VirtualClient::new(id, resources.clone());
        set.spawn(client.run_until_stopped(stop_rx.clone()));
    }

    let ending = supervise(&scenario, &mut set, deadline, shutdown).await?;
    let _ = stop_tx.send(true);
    let forced = drain(&scenario, &mut set, grace).await?;
    Ok((ending, forced))
}

struct Ramp<'a> {
    start: u32,
    stages: &'a [Stage],
    mode: RampMode,
    tick: Duration,
}

async fn ramping_concurrency(
    resources: ClientResources,
    ramp: Ramp<'_>,
    grace: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(Ending, bool), HarnessError> {
    let scenario = resources.scenario.clone();
    let started = Instant::now();
    let deadline = started + ramp.stages.iter().map(|s| s.duration).sum::<Duration>();

    let mut set = JoinSet::new();
    // Stop signal per live client, newest last
    let mut live: Vec<watch::Sender<bool>> = Vec::new();
    let mut next_id = 0u64;

    let mut ticker = interval(ramp.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ending = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let target = target_clients(ramp.start, ramp.stages, ramp.mode, started.elapsed());
                let target = usize::try_from(target).unwrap_or(usize::MAX);
                while live.len() < target {
                    let (tx, rx) = watch::channel(false);
                    let client = VirtualClient::new(next_id, resources.clone());
                    next_id += 1;
                    set.spawn(client.run_until_stopped(rx));
                    live.push(tx);
                }
                while live.len() > target {
                    // Released clients finish their current iteration
                    if let Some(tx) = live.pop() {
                        let _ = tx.send(true);
                    }
                }
            }
            _ = sleep_until(deadline) => break Ending::Completed,
            _ = shutdown_requested(shutdown) => break Ending::Interrupted,
            Some(joined) = set.join_next() => {
                if let Err(e) = check_joined(&scenario, joined) {
                    abort_all(&mut set).await;
                    return Err(e);
                }
            }
        }
    };

    for tx in live.drain(..) {
        let _ = tx.send(true);
    }
    let forced = drain(&scenario, &mut set, grace).await?;
    Ok((ending, forced))
}

struct Pacing {
    interval: Duration,
    duration: Duration,
    min_pool: u32,
    max_pool: Option<u32>,
}

async fn fixed_rate(
    resources: ClientResources,
    pacing: Pacing,
    grace: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(Ending, bool), HarnessError> {
    let scenario = resources.scenario.clone();
    let start = Instant::now();
    let end = start + pacing.duration;

    let mut idle: Vec<VirtualClient> = (0..u64::from(pacing.min_pool))
        .map(|id| VirtualClient::new(id, resources.clone()))
        .collect();
    let mut pool_size = u64::from(pacing.min_pool);
    let max_pool = pacing.max_pool.map(u64::from);

    let mut set: JoinSet<Result<VirtualClient, MetricError>> = JoinSet::new();
    let mut ticker = interval_at(start, pacing.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let ending = loop {
        tokio::select! {
            due = ticker.tick() => {
                if due >= end {
                    break Ending::Completed;
                }
                let client = match idle.pop() {
                    Some(client) => Some(client),
                    None if max_pool.map_or(true, |max| pool_size < max) => {
                        pool_size += 1;
                        Some(VirtualClient::new(pool_size - 1, resources.clone()))
                    }
                    None => None,
                };
                match client {
                    Some(mut client) => {
                        set.spawn(async move {
                            let _active = client.active_guard();
                            client.run_once().await?;
                            Ok::<_, MetricError>(client)
                        });
                    }
                    None => {
                        let dropped = resources.counters.record_drop();
                        resources.metrics.add_count(DROPPED_ITERATIONS, 1)?;
                        if let Some(telemetry) = &resources.telemetry {
                            telemetry.iteration_dropped(&scenario);
                        }
                        if dropped == 1 {
                            warn!(
                                "Scenario '{}' dropped an iteration: all {} pooled clients are busy",
                                scenario, pool_size
                            );
                        }
                    }
                }
            }
            _ = shutdown_requested(shutdown) => break Ending::Interrupted,
            Some(joined) = set.join_next() => {
                match check_joined(&scenario, joined) {
                    Ok(Some(client)) => idle.push(client),
                    Ok(None) => {}
                    Err(e) => {
                        abort_all(&mut set).await;
                        return Err(e);
                    }
                }
            }
        }
    };

    let forced = drain(&scenario, &mut set, grace).await?;
    Ok((ending, forced))
}

async fn bounded_iterations(
    resources: ClientResources,
    iterations: u64,
    clients: u32,
    max_duration: Option<Duration>,
    grace: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(Ending, bool), HarnessError> {
    let scenario = resources.scenario.clone();
    let budget = Arc::new(AtomicU64::new(iterations));
    let (stop_tx, stop_rx) = watch::channel(false);
    // Without a max duration only the scheduler's ceiling shutdown ends it early
    let deadline = max_duration.map(|d| Instant::now() + d);
    let expired = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);
    let mut set = JoinSet::new();

    for id in 0..u64::from(clients).min(iterations) {
        let client = VirtualClient::new(id, resources.clone());
        set.spawn(client.run_budget(budget.clone(), stop_rx.clone()));
    }

    let ending = loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                None => break Ending::Completed,
                Some(joined) => {
                    if let Err(e) = check_joined(&scenario, joined) {
                        abort_all(&mut set).await;
                        return Err(e);
                    }
                }
            },
            _ = &mut expired => {
                warn!(
                    "Scenario '{}' reached its max duration of {:?} with iterations left",
                    scenario,
                    max_duration.unwrap_or_default()
                );
                break Ending::Completed;
            }
            _ = shutdown_requested(shutdown) => break Ending::Interrupted,
        }
    };

    let _ = stop_tx.send(true);
    let forced = drain(&scenario, &mut set, grace).await?;
    Ok((ending, forced))
}

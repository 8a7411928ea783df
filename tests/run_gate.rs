// End-to-end runs: scenarios, chaos injection and the threshold gate

mod common;

use common::{InstantTarget, KillableCluster};
use loadgate::chaos::{ChaosConfig, ChaosCoordinator, RecoveryCriterion};
use loadgate::config::Config;
use loadgate::connector::TargetConnector;
use loadgate::threshold::ThresholdGate;
use loadgate::{Run, RunPlan};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn chaos_config() -> ChaosConfig {
    ChaosConfig {
        nodes: vec![
            "http://node1:4000".to_string(),
            "http://node2:4000".to_string(),
            "http://node3:4000".to_string(),
        ],
        recovery: RecoveryCriterion::Quorum {
            field: "nodes_available".to_string(),
            min: 2.0,
        },
        poll_interval: Duration::from_millis(50),
        max_wait: Duration::from_secs(5),
        cooldown: Duration::from_secs(1),
        ..ChaosConfig::default()
    }
}

fn failover_gate() -> ThresholdGate {
    let mut map = BTreeMap::new();
    map.insert("failover_duration".to_string(), vec!["p(95)<5000".to_string()]);
    map.insert("failover_success".to_string(), vec!["rate==1.0".to_string()]);
    ThresholdGate::from_map(&map).unwrap()
}

fn chaos_run(cluster: Arc<KillableCluster>) -> Run {
    let scenario =
        ChaosCoordinator::new(chaos_config()).scenario("failover", 10, Duration::from_secs(120));
    let plan = RunPlan::new(vec![scenario], failover_gate(), Duration::from_secs(180));
    let connector: Arc<dyn TargetConnector> = cluster;
    Run::new(plan, connector).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_chaos_run_with_recovering_cluster_passes() {
    let cluster = KillableCluster::recovering_after(Duration::from_millis(200));
    let report = chaos_run(cluster.clone()).execute().await.unwrap();

    let durations = report.metrics.duration("failover_duration").unwrap();
    assert_eq!(durations.count, 10);
    assert!((200.0..260.0).contains(&durations.min), "min {}", durations.min);
    assert!((200.0..260.0).contains(&durations.max), "max {}", durations.max);
    assert_eq!(report.metrics.rate("failover_success"), Some(1.0));

    assert!(report.verdict.passed, "{:?}", report.verdict);
    assert_eq!(report.exit_code(), 0);

    // every node is hit once before any node is hit again
    let kills = cluster.kills.lock().clone();
    assert_eq!(kills.len(), 10);
    let first_round: HashSet<&String> = kills[..3].iter().collect();
    assert_eq!(first_round.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_chaos_run_without_recovery_fails_with_max_wait() {
    let cluster = KillableCluster::never_recovering();
    let report = chaos_run(cluster).execute().await.unwrap();

    let durations = report.metrics.duration("failover_duration").unwrap();
    assert_eq!(durations.count, 10);
    assert_eq!(durations.min, 5000.0);
    assert_eq!(durations.max, 5000.0);
    assert_eq!(report.metrics.rate("failover_success"), Some(0.0));

    assert!(!report.verdict.passed);
    assert_eq!(report.exit_code(), 1);
    let latency = report
        .verdict
        .thresholds
        .iter()
        .find(|t| t.metric == "failover_duration")
        .unwrap();
    assert!(!latency.passed);
    assert_eq!(latency.observed, Some(5000.0));
}

#[tokio::test(start_paused = true)]
async fn test_verdict_is_repeatable() {
    let cluster = KillableCluster::recovering_after(Duration::from_millis(200));
    let run = chaos_run(cluster);
    let gate = run.gate().clone();
    let report = run.execute().await.unwrap();

    let first = gate.evaluate(&report.metrics);
    let second = gate.evaluate(&report.metrics);
    assert_eq!(first, second);
    assert_eq!(first, report.verdict);
}

#[tokio::test(start_paused = true)]
async fn test_plan_from_toml_runs_end_to_end() {
    let plan = r#"
[run]
ceiling = "1m"
graceful_stop = "1s"

[[scenarios]]
name = "smoke"
executor = "fixed-concurrency"
clients = 2
duration = "2s"

[scenarios.workload]
kind = "requests"
think_time = "500ms"

[[scenarios.workload.steps]]
path = "/health"
duration_metric = "http_req_duration"
error_metric = "http_req_failed"

[[scenarios]]
name = "rate"
start_time = "1s"
executor = "fixed-rate"
rate = 10
duration = "1s"

[scenarios.workload]
kind = "requests"

[[scenarios.workload.steps]]
method = "POST"
path = "/api/cart/items"
body = { product_id = "{random:100}", quantity = 1 }
error_metric = "http_req_failed"

[thresholds]
http_req_failed = ["rate==0"]
iterations = ["count>=15"]
dropped_iterations = ["count==0"]
"#;
    let config = Config::from_toml(plan).unwrap();
    let target = Arc::new(InstantTarget::default());
    let connector: Arc<dyn TargetConnector> = target.clone();
    let run = Run::new(config.plan().unwrap(), connector).unwrap();

    let report = run.execute().await.unwrap();
    assert!(report.verdict.passed, "{:?}", report.verdict);
    assert_eq!(report.scenarios.len(), 2);
    assert_eq!(report.scenarios[0].name, "smoke");
    assert_eq!(report.scenarios[1].dropped, 0);
}

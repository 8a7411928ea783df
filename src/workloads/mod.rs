//! Built-in workloads
//!
//! Plans pick their iteration body from a closed set of workloads rather than
//! a scripting language:
//!
//! - `requests`: an ordered sequence of HTTP steps
//! - `cluster-operations`: shard lookup, then an RPC on the owning node
//! - `websocket-broadcast`: join a channel and time a broadcast round trip
//! - `chaos`: fault injection with recovery polling
//!
//! Paths and string values may contain placeholders expanded per iteration:
//! `{client}`, `{iteration}`, `{scenario}`, `{random}` (0..1000000) and
//! `{random:N}` (1..=N).

pub mod cluster;
pub mod http;
pub mod websocket;

pub use cluster::ClusterConfig;
pub use http::{RequestStep, RequestsConfig};
pub use websocket::BroadcastConfig;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::chaos::{ChaosConfig, ChaosCoordinator};
use crate::client::{Iteration, IterationContext};
use crate::error::ConfigError;

/// Iteration body of a configured scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkloadConfig {
    Requests(RequestsConfig),
    ClusterOperations(ClusterConfig),
    WebsocketBroadcast(BroadcastConfig),
    Chaos(ChaosConfig),
}

impl WorkloadConfig {
    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        match self {
            WorkloadConfig::Requests(config) => config.validate(scenario),
            WorkloadConfig::ClusterOperations(config) => config.validate(scenario),
            WorkloadConfig::WebsocketBroadcast(config) => config.validate(scenario),
            WorkloadConfig::Chaos(config) => config.validate(scenario),
        }
    }

    /// Build the iteration
    ///
    /// `nodes` fills in the chaos node list when the workload leaves it empty.
    pub fn build(&self, nodes: &[String]) -> Arc<dyn Iteration> {
        match self {
            WorkloadConfig::Requests(config) => Arc::new(http::RequestSequence::new(config.clone())),
            WorkloadConfig::ClusterOperations(config) => {
                Arc::new(cluster::ClusterOperations::new(config.clone()))
            }
            WorkloadConfig::WebsocketBroadcast(config) => {
                Arc::new(websocket::Broadcast::new(config.clone()))
            }
            WorkloadConfig::Chaos(config) => {
                let mut config = config.clone();
                if config.nodes.is_empty() {
                    config.nodes = nodes.to_vec();
                }
                Arc::new(ChaosCoordinator::new(config))
            }
        }
    }
}

/// Expand per-iteration placeholders
pub fn expand(template: &str, ctx: &IterationContext) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let token = &after[..close];
                match placeholder(token, ctx) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn placeholder(token: &str, ctx: &IterationContext) -> Option<String> {
    match token {
        "client" => Some(ctx.client_id.to_string()),
        "iteration" => Some(ctx.iteration.to_string()),
        "scenario" => Some(ctx.scenario.to_string()),
        "random" => Some(fastrand::u32(..1_000_000).to_string()),
        _ => {
            let upper: u64 = token.strip_prefix("random:")?.parse().ok()?;
            (upper > 0).then(|| fastrand::u64(1..=upper).to_string())
        }
    }
}

/// Expand placeholders inside every string of a JSON value
///
/// A string consisting of a single numeric placeholder becomes a number.
pub fn expand_json(value: &serde_json::Value, ctx: &IterationContext) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => {
            let expanded = expand(s, ctx);
            let whole_placeholder =
                s.starts_with('{') && s.ends_with('}') && s.matches('{').count() == 1;
            if whole_placeholder && expanded != *s {
                if let Ok(n) = expanded.parse::<u64>() {
                    return Value::from(n);
                }
            }
            Value::String(expanded)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_json(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_json(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::connector::TargetConnector;
    use crate::metrics::MetricSink;

    pub fn context(connector: Arc<dyn TargetConnector>, iteration: u64) -> IterationContext {
        IterationContext {
            scenario: Arc::from("test"),
            client_id: 7,
            iteration,
            metrics: MetricSink::new(),
            connector,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::connector::{ConnectorError, TargetConnector, TargetRequest, TargetResponse};
    use async_trait::async_trait;
    use serde_json::json;

    struct Unused;

    #[async_trait]
    impl TargetConnector for Unused {
        async fn request(&self, _: TargetRequest) -> Result<TargetResponse, ConnectorError> {
            Err(ConnectorError::Closed)
        }
    }

    #[test]
    fn test_expand_placeholders() {
        let ctx = context(Arc::new(Unused), 3);
        assert_eq!(
            expand("/api/cluster/shard?key=user_{client}_{iteration}", &ctx),
            "/api/cluster/shard?key=user_7_3"
        );
        assert_eq!(expand("/plain", &ctx), "/plain");
        assert_eq!(expand("{unknown}/{", &ctx), "{unknown}/{");

        let n: u64 = expand("{random:100}", &ctx).parse().unwrap();
        assert!((1..=100).contains(&n));
    }

    #[test]
    fn test_expand_json_numbers() {
        let ctx = context(Arc::new(Unused), 0);
        let body = json!({"product_id": "{random:100}", "label": "item-{client}", "quantity": 2});
        let expanded = expand_json(&body, &ctx);
        assert!(expanded["product_id"].is_u64());
        assert_eq!(expanded["label"], "item-7");
        assert_eq!(expanded["quantity"], 2);
    }

    #[test]
    fn test_parse_workloads() {
        #[derive(Deserialize)]
        struct Wrapper {
            workload: WorkloadConfig,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
            [workload]
            kind = "chaos"
            fault_path = "/api/counter/kill"
            health_path = "/api/counter/health"
            recovery = { type = "status-ok" }
            poll_interval = "100ms"
            "#,
        )
        .unwrap();
        match parsed.workload {
            WorkloadConfig::Chaos(config) => {
                assert_eq!(config.fault_path(), "/api/counter/kill");
                assert_eq!(config.poll_interval, std::time::Duration::from_millis(100));
            }
            other => panic!("unexpected workload {:?}", other),
        }

        let unknown = toml::from_str::<Wrapper>(
            r#"
            [workload]
            kind = "lua-script"
            "#,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn test_chaos_nodes_default_to_target_nodes() {
        let workload = WorkloadConfig::Chaos(ChaosConfig::default());
        let iteration = workload.build(&["http://node1:4000".to_string()]);
        let names: Vec<String> = iteration.metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["failover_duration", "failover_success"]);
    }
}

//! Distributed cluster operations
//!
//! Each iteration resolves the node owning a key, then calls an RPC on that
//! node. Every `health_every` iterations the client also samples the cluster
//! health endpoint into a node-count gauge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::expand;
use crate::chaos::json_field;
use crate::client::{Iteration, IterationContext, IterationError};
use crate::connector::{resolve_url, TargetRequest};
use crate::error::ConfigError;
use crate::metrics::MetricDecl;

fn default_key() -> String {
    "user_{client}_{iteration}".to_string()
}

fn default_shard_path() -> String {
    "/api/cluster/shard?key={key}".to_string()
}

fn default_node_field() -> String {
    "node_url".to_string()
}

fn default_rpc_path() -> String {
    "/api/cluster/rpc".to_string()
}

fn default_operation() -> String {
    "increment".to_string()
}

fn default_health_path() -> String {
    "/api/cluster/health".to_string()
}

fn default_nodes_field() -> String {
    "nodes_available".to_string()
}

fn default_health_every() -> u64 {
    100
}

fn default_think_time() -> Duration {
    Duration::from_millis(10)
}

/// Metric names written by the workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterMetrics {
    pub shard_lookup: String,
    pub rpc_call: String,
    pub cross_node_messages: String,
    pub errors: String,
    pub nodes_alive: String,
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self {
            shard_lookup: "shard_lookup_duration".to_string(),
            rpc_call: "rpc_call_duration".to_string(),
            cross_node_messages: "cross_node_messages".to_string(),
            errors: "request_errors".to_string(),
            nodes_alive: "nodes_alive".to_string(),
        }
    }
}

/// `cluster-operations` workload configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Key template; `{key}` in `shard_path` is replaced by the expansion
    #[serde(default = "default_key")]
    pub key: String,

    #[serde(default = "default_shard_path")]
    pub shard_path: String,

    /// Field of the shard lookup response holding the owner's address
    #[serde(default = "default_node_field")]
    pub node_field: String,

    /// RPC path on the owning node
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,

    #[serde(default = "default_operation")]
    pub operation: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_nodes_field")]
    pub nodes_field: String,

    /// Health sample interval in iterations; 0 disables sampling
    #[serde(default = "default_health_every")]
    pub health_every: u64,

    #[serde(default = "default_think_time", with = "humantime_serde")]
    pub think_time: Duration,

    #[serde(default)]
    pub metrics: ClusterMetrics,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            key: default_key(),
            shard_path: default_shard_path(),
            node_field: default_node_field(),
            rpc_path: default_rpc_path(),
            operation: default_operation(),
            health_path: default_health_path(),
            nodes_field: default_nodes_field(),
            health_every: default_health_every(),
            think_time: default_think_time(),
            metrics: ClusterMetrics::default(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidWorkload {
            scenario: scenario.to_string(),
            reason: reason.to_string(),
        };

        if self.key.trim().is_empty() {
            return Err(invalid("key template must not be empty"));
        }
        if self.shard_path.trim().is_empty() || self.rpc_path.trim().is_empty() {
            return Err(invalid("shard_path and rpc_path must not be empty"));
        }
        if self.node_field.trim().is_empty() {
            return Err(invalid("node_field must not be empty"));
        }

        let names = self.metrics();
        for (i, decl) in names.iter().enumerate() {
            if decl.name.trim().is_empty() {
                return Err(invalid("metric names must not be empty"));
            }
            if names[..i].iter().any(|other| other.name == decl.name) {
                return Err(invalid("metric names must be distinct"));
            }
        }
        Ok(())
    }

    pub fn metrics(&self) -> Vec<MetricDecl> {
        let m = &self.metrics;
        vec![
            MetricDecl::duration(&m.shard_lookup),
            MetricDecl::duration(&m.rpc_call),
            MetricDecl::counter(&m.cross_node_messages),
            MetricDecl::rate(&m.errors),
            MetricDecl::gauge(&m.nodes_alive),
        ]
    }
}

/// Iteration running a [`ClusterConfig`]
pub struct ClusterOperations {
    config: ClusterConfig,
}

impl ClusterOperations {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    async fn lookup_owner(&self, ctx: &IterationContext, key: &str) -> Result<String, IterationError> {
        let path = expand(&self.config.shard_path, ctx).replace("{key}", key);
        let started = Instant::now();
        let response = ctx
            .connector
            .request(TargetRequest::get(path).tag("shard_lookup"))
            .await;
        ctx.metrics
            .add_duration(&self.config.metrics.shard_lookup, started.elapsed())?;

        let response = response?.error_for_status()?;
        let body: serde_json::Value = response.json()?;
        json_field(&body, &self.config.node_field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                IterationError::check(format!(
                    "shard lookup response has no '{}'",
                    self.config.node_field
                ))
            })
    }

    async fn call_owner(
        &self,
        ctx: &IterationContext,
        node: &str,
        key: &str,
    ) -> Result<(), IterationError> {
        let payload = serde_json::json!({
            "key": key,
            "operation": self.config.operation,
            "value": 1,
        });
        let request = TargetRequest::post(resolve_url(node, &self.config.rpc_path))
            .json(&payload)
            .tag("rpc_call");

        let started = Instant::now();
        let response = ctx.connector.request(request).await;
        ctx.metrics
            .add_duration(&self.config.metrics.rpc_call, started.elapsed())?;
        ctx.metrics
            .add_count(&self.config.metrics.cross_node_messages, 1)?;

        let ok = matches!(&response, Ok(r) if r.status == 200);
        ctx.metrics.add_rate(&self.config.metrics.errors, !ok)?;
        match response {
            Ok(r) if r.status == 200 => Ok(()),
            Ok(r) => Err(IterationError::check(format!("rpc call returned {}", r.status))),
            Err(e) => Err(e.into()),
        }
    }

    async fn sample_health(&self, ctx: &IterationContext) -> Result<(), IterationError> {
        let response = ctx
            .connector
            .request(TargetRequest::get(self.config.health_path.clone()).tag("cluster_health"))
            .await;
        // An unreadable health body counts as no nodes alive
        let alive = response
            .ok()
            .and_then(|r| r.json::<serde_json::Value>().ok())
            .and_then(|body| json_field(&body, &self.config.nodes_field).and_then(|v| v.as_f64()))
            .unwrap_or(0.0);
        ctx.metrics.set_gauge(&self.config.metrics.nodes_alive, alive)?;
        Ok(())
    }
}

#[async_trait]
impl Iteration for ClusterOperations {
    fn metrics(&self) -> Vec<MetricDecl> {
        self.config.metrics()
    }

    async fn run(&self, ctx: &IterationContext) -> Result<(), IterationError> {
        let key = expand(&self.config.key, ctx);

        let result = match self.lookup_owner(ctx, &key).await {
            Ok(node) => self.call_owner(ctx, &node, &key).await,
            Err(IterationError::Metric(e)) => return Err(e.into()),
            Err(e) => {
                ctx.metrics.add_rate(&self.config.metrics.errors, true)?;
                Err(e)
            }
        };

        if self.config.health_every > 0 && ctx.iteration % self.config.health_every == 0 {
            self.sample_health(ctx).await?;
        }

        ctx.pace(self.config.think_time).await;
        result
    }
}

//! Channel broadcast round trips over a persistent socket
//!
//! Each iteration opens a session, joins a channel topic, publishes one
//! message and times how long the broadcast takes to come back. The session
//! is then held open to keep connection pressure on the target.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::expand;
use crate::client::{Iteration, IterationContext, IterationError};
use crate::connector::{ConnectorError, Socket};
use crate::error::ConfigError;
use crate::metrics::{MetricDecl, MetricSink};

fn default_path() -> String {
    "/socket/websocket".to_string()
}

fn default_topic() -> String {
    "room:lobby".to_string()
}

fn default_event() -> String {
    "new_msg".to_string()
}

fn default_message() -> String {
    "Hello from client {client}".to_string()
}

fn default_reply_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_hold() -> Duration {
    Duration::from_secs(10)
}

fn default_duration_metric() -> String {
    "websocket_msg_duration".to_string()
}

fn default_connections_gauge() -> String {
    "concurrent_websockets".to_string()
}

/// `websocket-broadcast` workload configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Event published after joining and awaited as the broadcast
    #[serde(default = "default_event")]
    pub event: String,

    #[serde(default = "default_message")]
    pub message: String,

    /// Maximum wait for the join reply and for the broadcast
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,

    /// How long the session stays open after the round trip
    #[serde(default = "default_hold", with = "humantime_serde")]
    pub hold: Duration,

    #[serde(default = "default_duration_metric")]
    pub duration_metric: String,

    /// Gauge tracking currently open sessions
    #[serde(default = "default_connections_gauge")]
    pub connections_gauge: String,

    /// Rate receiving `true` for every failed round trip
    #[serde(default)]
    pub error_metric: Option<String>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            topic: default_topic(),
            event: default_event(),
            message: default_message(),
            reply_timeout: default_reply_timeout(),
            hold: default_hold(),
            duration_metric: default_duration_metric(),
            connections_gauge: default_connections_gauge(),
            error_metric: None,
        }
    }
}

impl BroadcastConfig {
    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidWorkload {
            scenario: scenario.to_string(),
            reason: reason.to_string(),
        };

        if self.topic.trim().is_empty() || self.event.trim().is_empty() {
            return Err(invalid("topic and event must not be empty"));
        }
        if self.reply_timeout.is_zero() {
            return Err(invalid("reply_timeout must be > 0"));
        }
        if self.duration_metric == self.connections_gauge {
            return Err(invalid("duration_metric and connections_gauge must differ"));
        }
        Ok(())
    }

    pub fn metrics(&self) -> Vec<MetricDecl> {
        let mut metrics = vec![
            MetricDecl::duration(&self.duration_metric),
            MetricDecl::gauge(&self.connections_gauge),
        ];
        if let Some(errors) = &self.error_metric {
            metrics.push(MetricDecl::rate(errors));
        }
        metrics
    }
}

/// Decrements the open-session gauge when the session ends, aborted or not
struct OpenSession {
    metrics: MetricSink,
    gauge: String,
}

impl OpenSession {
    fn open(metrics: &MetricSink, gauge: &str) -> Result<Self, IterationError> {
        metrics.adjust_gauge(gauge, 1.0)?;
        Ok(Self {
            metrics: metrics.clone(),
            gauge: gauge.to_string(),
        })
    }
}

impl Drop for OpenSession {
    fn drop(&mut self) {
        let _ = self.metrics.adjust_gauge(&self.gauge, -1.0);
    }
}

/// Iteration running a [`BroadcastConfig`]
pub struct Broadcast {
    config: BroadcastConfig,
}

impl Broadcast {
    pub fn new(config: BroadcastConfig) -> Self {
        Self { config }
    }

    fn frame(&self, event: &str, payload: Value, reference: &str) -> String {
        json!({
            "topic": self.config.topic,
            "event": event,
            "payload": payload,
            "ref": reference,
        })
        .to_string()
    }

    /// Read frames until one matches `event` (and `reference`, when given)
    async fn wait_for(
        &self,
        socket: &mut dyn Socket,
        event: &str,
        reference: Option<&str>,
    ) -> Result<Value, IterationError> {
        let matching = async {
            loop {
                let Some(text) = socket.recv().await? else {
                    return Err(ConnectorError::Closed);
                };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let event_matches = frame["event"] == event && frame["topic"] == self.config.topic;
                let ref_matches = reference.map_or(true, |r| frame["ref"] == r);
                if event_matches && ref_matches {
                    return Ok::<Value, ConnectorError>(frame);
                }
            }
        };
        match timeout(self.config.reply_timeout, matching).await {
            Ok(frame) => Ok(frame?),
            Err(_) => Err(ConnectorError::Timeout(self.config.reply_timeout).into()),
        }
    }

    async fn round_trip(
        &self,
        ctx: &IterationContext,
        socket: &mut dyn Socket,
    ) -> Result<(), IterationError> {
        socket.send(self.frame("phx_join", json!({}), "1")).await?;
        let reply = self.wait_for(socket, "phx_reply", Some("1")).await?;
        if reply["payload"]["status"] != "ok" {
            return Err(IterationError::check(format!(
                "join of {} rejected: {}",
                self.config.topic, reply["payload"]
            )));
        }

        let body = expand(&self.config.message, ctx);
        let started = Instant::now();
        socket
            .send(self.frame(&self.config.event, json!({ "body": body }), "2"))
            .await?;
        self.wait_for(socket, &self.config.event, None).await?;
        ctx.metrics
            .add_duration(&self.config.duration_metric, started.elapsed())?;
        Ok(())
    }
}

#[async_trait]
impl Iteration for Broadcast {
    fn metrics(&self) -> Vec<MetricDecl> {
        self.config.metrics()
    }

    async fn run(&self, ctx: &IterationContext) -> Result<(), IterationError> {
        let mut socket = ctx.connector.connect(&expand(&self.config.path, ctx)).await?;
        let session = OpenSession::open(&ctx.metrics, &self.config.connections_gauge)?;

        let result = self.round_trip(ctx, socket.as_mut()).await;
        if let Err(IterationError::Metric(_)) = result {
            return result;
        }
        if let Some(errors) = &self.config.error_metric {
            ctx.metrics.add_rate(errors, result.is_err())?;
        }
        if result.is_ok() {
            ctx.pace(self.config.hold).await;
        }

        if let Err(e) = socket.close().await {
            debug!("Closing session of client {} failed: {}", ctx.client_id, e);
        }
        drop(session);
        result
    }
}

//! HTTP request sequences
//!
//! One iteration walks the configured steps in order. A step that fails its
//! checks does not stop the sequence; the first failure is reported once
//! every step has run so error rates see the whole iteration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{expand, expand_json};
use crate::client::{Iteration, IterationContext, IterationError};
use crate::connector::{Method, TargetRequest, TargetResponse};
use crate::error::ConfigError;
use crate::metrics::{MetricDecl, MetricKind};

/// How a captured header value is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Appended as a duration-kind sample
    #[default]
    Trend,
    /// Written as the gauge's current value
    Gauge,
    /// Added to a counter
    Counter,
}

/// Numeric response header fed into a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCapture {
    pub header: String,
    pub metric: String,
    #[serde(default)]
    pub kind: CaptureKind,
}

impl HeaderCapture {
    fn decl(&self) -> MetricDecl {
        let kind = match self.kind {
            CaptureKind::Trend => MetricKind::Duration,
            CaptureKind::Gauge => MetricKind::Gauge,
            CaptureKind::Counter => MetricKind::Counter,
        };
        MetricDecl::new(&self.metric, kind)
    }
}

/// A single request of the sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStep {
    /// Label used in logs; defaults to the path
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub method: Method,

    pub path: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// JSON body; string values may carry placeholders
    #[serde(default)]
    pub body: Option<serde_json::Value>,

    /// Accepted statuses; any 2xx when empty
    #[serde(default)]
    pub expect_status: Vec<u16>,

    #[serde(default)]
    pub body_contains: Option<String>,

    /// JSON field (dotted path) that must be present in the response
    #[serde(default)]
    pub json_field: Option<String>,

    /// Duration metric receiving the request latency
    #[serde(default)]
    pub duration_metric: Option<String>,

    /// Rate metric receiving `true` for every failed check
    #[serde(default)]
    pub error_metric: Option<String>,

    #[serde(default)]
    pub capture: Vec<HeaderCapture>,

    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Pause after this step
    #[serde(default, with = "humantime_serde")]
    pub think_time: Option<Duration>,
}

impl RequestStep {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }

    fn status_accepted(&self, status: u16) -> bool {
        if self.expect_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.expect_status.contains(&status)
        }
    }

    fn check(&self, response: &TargetResponse) -> Result<(), IterationError> {
        if !self.status_accepted(response.status) {
            return Err(IterationError::check(format!(
                "{}: unexpected status {}",
                self.label(),
                response.status
            )));
        }
        if let Some(needle) = &self.body_contains {
            if !response.body.contains(needle.as_str()) {
                return Err(IterationError::check(format!(
                    "{}: body does not contain {:?}",
                    self.label(),
                    needle
                )));
            }
        }
        if let Some(field) = &self.json_field {
            let body: serde_json::Value = response.json()?;
            if crate::chaos::json_field(&body, field).is_none() {
                return Err(IterationError::check(format!(
                    "{}: response has no field {:?}",
                    self.label(),
                    field
                )));
            }
        }
        Ok(())
    }

    fn request(&self, ctx: &IterationContext) -> TargetRequest {
        let mut request = TargetRequest::new(self.method, expand(&self.path, ctx))
            .tag(self.label().to_string());
        for (name, value) in &self.headers {
            request = request.header(name.clone(), expand(value, ctx));
        }
        if let Some(body) = &self.body {
            request = request.json(&expand_json(body, ctx));
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        request
    }

    fn capture(&self, ctx: &IterationContext, response: &TargetResponse) -> Result<(), IterationError> {
        for capture in &self.capture {
            let Some(value) = response
                .header(&capture.header)
                .and_then(|v| v.trim().parse::<f64>().ok())
            else {
                continue;
            };
            match capture.kind {
                CaptureKind::Trend => ctx.metrics.add_trend(&capture.metric, value)?,
                CaptureKind::Gauge => ctx.metrics.set_gauge(&capture.metric, value)?,
                CaptureKind::Counter if value >= 0.0 => {
                    ctx.metrics.add_count(&capture.metric, value as u64)?
                }
                CaptureKind::Counter => {}
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: &IterationContext) -> Result<(), IterationError> {
        let started = Instant::now();
        let result = ctx.connector.request(self.request(ctx)).await;
        if let Some(metric) = &self.duration_metric {
            ctx.metrics.add_duration(metric, started.elapsed())?;
        }

        let checked = match result {
            Ok(response) => {
                self.capture(ctx, &response)?;
                self.check(&response)
            }
            Err(e) => Err(e.into()),
        };
        if let Some(metric) = &self.error_metric {
            ctx.metrics.add_rate(metric, checked.is_err())?;
        }
        checked
    }
}

/// `requests` workload configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsConfig {
    pub steps: Vec<RequestStep>,

    /// Pause at the end of each iteration
    #[serde(default, with = "humantime_serde")]
    pub think_time: Option<Duration>,
}

impl RequestsConfig {
    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidWorkload {
            scenario: scenario.to_string(),
            reason,
        };

        if self.steps.is_empty() {
            return Err(invalid("requests workload needs at least one step".to_string()));
        }
        for step in &self.steps {
            if step.path.trim().is_empty() {
                return Err(invalid(format!("step '{}' has an empty path", step.label())));
            }
            if step.expect_status.iter().any(|s| !(100..600).contains(s)) {
                return Err(invalid(format!(
                    "step '{}' expects an invalid status code",
                    step.label()
                )));
            }
        }

        // Metric names must keep a single kind across steps
        let mut kinds: BTreeMap<String, MetricKind> = BTreeMap::new();
        for decl in self.metrics() {
            if let Some(previous) = kinds.insert(decl.name.clone(), decl.kind) {
                if previous != decl.kind {
                    return Err(invalid(format!(
                        "metric '{}' is used as both {} and {}",
                        decl.name, previous, decl.kind
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn metrics(&self) -> Vec<MetricDecl> {
        let mut metrics = Vec::new();
        for step in &self.steps {
            if let Some(name) = &step.duration_metric {
                metrics.push(MetricDecl::duration(name));
            }
            if let Some(name) = &step.error_metric {
                metrics.push(MetricDecl::rate(name));
            }
            metrics.extend(step.capture.iter().map(HeaderCapture::decl));
        }
        metrics.dedup();
        metrics
    }
}

/// Iteration running a [`RequestsConfig`]
pub struct RequestSequence {
    config: RequestsConfig,
}

impl RequestSequence {
    pub fn new(config: RequestsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Iteration for RequestSequence {
    fn metrics(&self) -> Vec<MetricDecl> {
        self.config.metrics()
    }

    async fn run(&self, ctx: &IterationContext) -> Result<(), IterationError> {
        let mut first_failure = None;
        for step in &self.config.steps {
            match step.run(ctx).await {
                Ok(()) => {}
                Err(IterationError::Metric(e)) => return Err(e.into()),
                Err(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
            if let Some(pause) = step.think_time {
                ctx.pace(pause).await;
            }
        }
        if let Some(pause) = self.config.think_time {
            ctx.pace(pause).await;
        }
        first_failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorError, TargetConnector};
    use crate::workloads::test_support::context;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<TargetRequest>>,
    }

    #[async_trait]
    impl TargetConnector for Recorder {
        async fn request(&self, request: TargetRequest) -> Result<TargetResponse, ConnectorError> {
            let response = match request.path.as_str() {
                "/api/products" => TargetResponse::new(200).with_body(r#"{"data":[1,2]}"#),
                "/api/counter/increment" => {
                    TargetResponse::new(200).with_header("X-Mailbox-Depth", "4")
                }
                "/api/cart" => TargetResponse::new(500),
                _ => TargetResponse::new(201),
            };
            self.seen.lock().push(request);
            Ok(response)
        }
    }

    fn config(toml_src: &str) -> RequestsConfig {
        toml::from_str(toml_src).unwrap()
    }

    #[tokio::test]
    async fn test_sequence_records_metrics() {
        let config = config(
            r#"
            [[steps]]
            path = "/api/products"
            json_field = "data"
            duration_metric = "http_req_duration"
            error_metric = "errors"

            [[steps]]
            method = "POST"
            path = "/api/counter/increment"
            body = { amount = 1, client = "{client}" }
            duration_metric = "http_req_duration"
            error_metric = "errors"
            capture = [{ header = "x-mailbox-depth", metric = "mailbox_depth" }]
            "#,
        );
        config.validate("load").unwrap();

        let recorder = Arc::new(Recorder::default());
        let ctx = context(recorder.clone(), 0);
        RequestSequence::new(config).run(&ctx).await.unwrap();

        let snapshot = ctx.metrics.snapshot_all();
        assert_eq!(snapshot.duration("http_req_duration").unwrap().count, 2);
        assert_eq!(snapshot.rate("errors"), Some(0.0));
        assert_eq!(snapshot.duration("mailbox_depth").unwrap().max, 4.0);

        let seen = recorder.seen.lock();
        assert_eq!(seen[1].method, Method::Post);
        let body: serde_json::Value = serde_json::from_str(seen[1].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["client"], 7);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_sequence() {
        let config = config(
            r#"
            [[steps]]
            path = "/api/cart"
            error_metric = "errors"

            [[steps]]
            method = "POST"
            path = "/api/cart/items"
            expect_status = [200, 201]
            error_metric = "errors"
            "#,
        );
        let recorder = Arc::new(Recorder::default());
        let ctx = context(recorder.clone(), 0);

        let err = RequestSequence::new(config).run(&ctx).await.unwrap_err();
        assert!(matches!(err, IterationError::Check(_)));
        assert_eq!(recorder.seen.lock().len(), 2);
        assert_eq!(ctx.metrics.snapshot_all().rate("errors"), Some(0.5));
    }

    #[test]
    fn test_validate_rejects_conflicting_metric_kinds() {
        let config = config(
            r#"
            [[steps]]
            path = "/a"
            duration_metric = "latency"

            [[steps]]
            path = "/b"
            error_metric = "latency"
            "#,
        );
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::InvalidWorkload { .. })
        ));

        let empty = RequestsConfig {
            steps: Vec::new(),
            think_time: None,
        };
        assert!(empty.validate("s").is_err());
    }
}

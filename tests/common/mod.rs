// Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use loadgate::connector::{ConnectorError, TargetConnector, TargetRequest, TargetResponse};
use loadgate::metrics::MetricSink;
use loadgate::scenario::ExecutorEnv;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Answers every request with 200 immediately
#[derive(Default)]
pub struct InstantTarget {
    pub requests: AtomicU64,
}

#[async_trait]
impl TargetConnector for InstantTarget {
    async fn request(&self, _request: TargetRequest) -> Result<TargetResponse, ConnectorError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(TargetResponse::new(200))
    }
}

/// Accepts requests and never answers
#[derive(Default)]
pub struct HangingTarget {
    pub requests: AtomicU64,
}

#[async_trait]
impl TargetConnector for HangingTarget {
    async fn request(&self, _request: TargetRequest) -> Result<TargetResponse, ConnectorError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Cluster that loses quorum when a node is killed
///
/// Health reports 1 node available until `recover_after` has passed since
/// the last kill, then 3. With `recover_after = None` it never recovers.
pub struct KillableCluster {
    recover_after: Option<Duration>,
    last_kill: Mutex<Option<Instant>>,
    pub kills: Mutex<Vec<String>>,
    pub probes: AtomicU64,
}

impl KillableCluster {
    pub fn recovering_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self::new(Some(delay)))
    }

    pub fn never_recovering() -> Arc<Self> {
        Arc::new(Self::new(None))
    }

    fn new(recover_after: Option<Duration>) -> Self {
        Self {
            recover_after,
            last_kill: Mutex::new(None),
            kills: Mutex::new(Vec::new()),
            probes: AtomicU64::new(0),
        }
    }

    fn nodes_available(&self) -> u32 {
        let last_kill = *self.last_kill.lock();
        match (last_kill, self.recover_after) {
            (None, _) => 3,
            (Some(at), Some(delay)) if at.elapsed() >= delay => 3,
            _ => 1,
        }
    }
}

#[async_trait]
impl TargetConnector for KillableCluster {
    async fn request(&self, request: TargetRequest) -> Result<TargetResponse, ConnectorError> {
        if request.path.ends_with("/api/cluster/kill") {
            *self.last_kill.lock() = Some(Instant::now());
            self.kills.lock().push(request.path.clone());
            return Ok(TargetResponse::new(202));
        }
        if request.path.ends_with("/api/cluster/health") {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let body = format!(r#"{{"nodes_available":{}}}"#, self.nodes_available());
            return Ok(TargetResponse::new(200).with_body(body));
        }
        Ok(TargetResponse::new(404))
    }
}

pub fn env(connector: Arc<dyn TargetConnector>, graceful_stop: Duration) -> ExecutorEnv {
    ExecutorEnv {
        metrics: MetricSink::new(),
        connector,
        telemetry: None,
        graceful_stop,
        ramp_tick: Duration::from_millis(100),
    }
}

// HTTP server for the harness telemetry endpoint
//
// Serves /metrics (Prometheus text format) and /health while a run executes.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::telemetry::HarnessTelemetry;

/// A running telemetry server
pub struct TelemetryServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TelemetryServer {
    /// Bind and start serving in the background
    ///
    /// # Arguments
    /// * `telemetry` - Series to expose
    /// * `port` - Port to listen on (0 picks a free port)
    pub async fn start(telemetry: HarnessTelemetry, port: u16) -> Result<Self> {
        let app = router(telemetry);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .context("Failed to bind telemetry server")?;
        let addr = listener
            .local_addr()
            .context("Failed to read telemetry server address")?;

        info!("Starting telemetry server on {}", addr);

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Telemetry server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            shutdown: Some(tx),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server task
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

fn router(telemetry: HarnessTelemetry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(telemetry)
}

/// Metrics endpoint handler
async fn metrics_handler(State(telemetry): State<HarnessTelemetry>) -> Response {
    match telemetry.gather() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
            .await
            .unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_metrics_and_health() {
        let telemetry = HarnessTelemetry::new().unwrap();
        telemetry.iteration_completed("smoke", false);

        let server = TelemetryServer::start(telemetry, 0).await.unwrap();
        let addr = server.local_addr();

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.contains("loadgate_iterations_total{scenario=\"smoke\"} 1"));

        server.stop().await;
    }
}

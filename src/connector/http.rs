//! HTTP and WebSocket connector
//!
//! Requests go through a shared `reqwest::Client` (connection pooling is
//! handled by reqwest). Persistent sessions use `tokio-tungstenite`; the
//! session URL is derived from the base address by swapping the scheme.
//!
//! # Example
//!
//! ```ignore
//! use loadgate::connector::{HttpConnector, TargetConnector, TargetRequest};
//!
//! let connector = HttpConnector::new("http://localhost:4000")?;
//! let response = connector.request(TargetRequest::get("/health")).await?;
//! assert!(response.is_success());
//! ```

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{
    resolve_url, websocket_url, ConnectorError, Method, Socket, TargetConnector, TargetRequest,
    TargetResponse,
};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector for HTTP targets
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpConnector {
    /// Create a connector for the given base address
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConnectorError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a connector with a custom default request timeout
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::Protocol(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn map_error(&self, err: reqwest::Error, timeout: Duration) -> ConnectorError {
        if err.is_timeout() {
            ConnectorError::Timeout(timeout)
        } else if err.is_connect() {
            ConnectorError::ConnectionRefused(err.to_string())
        } else {
            ConnectorError::Protocol(err.to_string())
        }
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
    }
}

#[async_trait]
impl TargetConnector for HttpConnector {
    async fn request(&self, request: TargetRequest) -> Result<TargetResponse, ConnectorError> {
        let url = resolve_url(&self.base_url, &request.path);
        let timeout = request.timeout.unwrap_or(self.timeout);

        let mut builder = self
            .client
            .request(reqwest_method(request.method), &url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::trace!(
            "{:?} {} ({})",
            request.method,
            url,
            request.tag.as_deref().unwrap_or("untagged")
        );

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| self.map_error(e, timeout))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_error(e, timeout))?;

        Ok(TargetResponse {
            status,
            headers,
            body,
            elapsed: started.elapsed(),
        })
    }

    async fn connect(&self, path: &str) -> Result<Box<dyn Socket>, ConnectorError> {
        let url = websocket_url(&resolve_url(&self.base_url, path));

        let (stream, response) =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| ConnectorError::Timeout(self.timeout))?
                .map_err(|e| ConnectorError::ConnectionRefused(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 101 {
            return Err(ConnectorError::Status { status });
        }

        tracing::trace!("WebSocket connected to {}", url);
        Ok(Box::new(WebSocketSession { stream }))
    }
}

/// A live WebSocket session
pub struct WebSocketSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WebSocketSession {
    async fn send(&mut self, text: String) -> Result<(), ConnectorError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectorError::Protocol(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, ConnectorError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ConnectorError::Protocol(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // ping/pong and raw frames are handled by tungstenite
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ConnectorError::Protocol(e.to_string())),
        }
    }
}

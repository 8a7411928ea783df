//! Target Connector
//!
//! This module defines the narrow interface through which iterations reach the
//! system under test. The harness treats the target as an opaque endpoint:
//!
//! - **HTTP-style requests**: method, path, headers, body → status, headers,
//!   body, elapsed time
//! - **WebSocket-style sessions**: connect, send, receive, close
//!
//! Any [`ConnectorError`] is an iteration failure, never a crash. The HTTP
//! implementation lives in [`http`]; tests plug in their own connectors.

pub mod http;

pub use http::HttpConnector;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Errors reported by a connector
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectorError {
    /// No response within the allowed time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The target refused or dropped the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Malformed exchange (bad body, bad frame, handshake failure)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The target answered with a status outside 2xx/101
    #[error("Unexpected status: {status}")]
    Status { status: u16 },

    /// The session was closed by the peer
    #[error("Connection closed")]
    Closed,

    /// The connector cannot perform this operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

/// An HTTP-style request against the target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRequest {
    pub method: Method,
    /// Path relative to the base address, or an absolute URL
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Per-request timeout overriding the connector default
    pub timeout: Option<Duration>,
    /// Name used in logs
    pub tag: Option<String>,
}

impl TargetRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            tag: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body and content type
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(value.to_string())
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Response returned by the target
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetResponse {
    pub status: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

impl TargetResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// 2xx, or 101 for protocol upgrades
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 101
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Turn a non-success status into [`ConnectorError::Status`]
    pub fn error_for_status(self) -> Result<Self, ConnectorError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ConnectorError::Status {
                status: self.status,
            })
        }
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ConnectorError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ConnectorError::Protocol(format!("Invalid JSON body: {}", e)))
    }
}

/// A persistent bidirectional session (WebSocket-style)
#[async_trait]
pub trait Socket: Send {
    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<(), ConnectorError>;

    /// Next text frame, or `None` once the peer has closed the session
    async fn recv(&mut self) -> Result<Option<String>, ConnectorError>;

    /// Close the session
    async fn close(&mut self) -> Result<(), ConnectorError>;
}

/// Access to the system under test
///
/// Implementations must be shareable across thousands of concurrent clients.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Issue one HTTP-style request
    async fn request(&self, request: TargetRequest) -> Result<TargetResponse, ConnectorError>;

    /// Open a persistent session
    async fn connect(&self, path: &str) -> Result<Box<dyn Socket>, ConnectorError> {
        Err(ConnectorError::Unsupported(format!(
            "persistent sessions ({})",
            path
        )))
    }
}

/// Join a base address and a request path
///
/// Absolute URLs pass through untouched.
pub fn resolve_url(base: &str, path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Rewrite an http(s) URL into its ws(s) counterpart
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

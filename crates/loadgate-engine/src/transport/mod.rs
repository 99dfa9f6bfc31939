//! Transport abstraction between the executor and the wire
//!
//! Provides a single `send` seam with two implementations:
//! - [`HttpTransport`] for real targets (reqwest, pooled)
//! - [`MockTransport`] for deterministic tests with simulated latency

mod http;
mod mock;

pub use http::HttpTransport;
pub use mock::{CallRecord, MockReply, MockTransport};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// A fully rendered request, ready to send.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    /// Transport-level timeout; the executor enforces its own as well.
    pub timeout: Duration,
}

impl PreparedRequest {
    pub fn new(method: Method, url: Url, timeout: Duration) -> Self {
        Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
            timeout,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Status, headers and body of a completed exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// True when the response declares a JSON media type.
    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }
}

/// Why a request produced no response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Sends prepared requests. Implementations must be shareable across runners.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportError>;
}

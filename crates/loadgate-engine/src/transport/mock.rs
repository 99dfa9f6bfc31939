//! In-memory transport for tests
//!
//! Routes requests by URL path to scripted responders, sleeps on the tokio
//! clock to simulate latency (so paused-time tests stay deterministic) and
//! records every call for assertions.
//!
//! ```rust
//! use loadgate_engine::transport::{MockReply, MockTransport};
//! use std::time::Duration;
//!
//! let mock = MockTransport::new()
//!     .route("/predict", Duration::from_millis(50), |_req, _n| {
//!         MockReply::json(200, serde_json::json!({ "prediction": 41.5 }))
//!     })
//!     .route("/health", Duration::ZERO, |_req, _n| {
//!         MockReply::json(200, serde_json::json!({ "status": "ok" }))
//!     });
//! ```

use super::{PreparedRequest, Transport, TransportError, TransportResponse};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Scripted reply for one call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(TransportResponse),
    Fail(TransportError),
}

impl MockReply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::Respond(
            TransportResponse::new(status, Bytes::from(body.to_string()))
                .with_header("content-type", "application/json"),
        )
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::Respond(
            TransportResponse::new(status, Bytes::from(body.to_string()))
                .with_header("content-type", "text/plain"),
        )
    }

    pub fn status(status: u16) -> Self {
        Self::Respond(TransportResponse::new(status, Bytes::new()))
    }

    pub fn connection_refused() -> Self {
        Self::Fail(TransportError::Connect("connection refused".to_string()))
    }
}

type Responder = Arc<dyn Fn(&PreparedRequest, u64) -> MockReply + Send + Sync>;

struct Route {
    latency: Duration,
    responder: Responder,
    calls: AtomicU64,
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub method: Method,
    pub path: String,
    pub started_at: Instant,
    pub success: bool,
}

/// Mock transport shared by every runner of a test scenario.
#[derive(Clone, Default)]
pub struct MockTransport {
    routes: Arc<RwLock<HashMap<String, Arc<Route>>>>,
    history: Arc<RwLock<Vec<CallRecord>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockTransport {
    /// A transport with no routes; unrouted paths answer 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `path` after `latency` with whatever `responder` returns.
    ///
    /// The responder also receives the zero-based call number on this route.
    pub fn route<F>(self, path: &str, latency: Duration, responder: F) -> Self
    where
        F: Fn(&PreparedRequest, u64) -> MockReply + Send + Sync + 'static,
    {
        self.routes.write().insert(
            path.to_string(),
            Arc::new(Route {
                latency,
                responder: Arc::new(responder),
                calls: AtomicU64::new(0),
            }),
        );
        self
    }

    /// Same reply every time.
    pub fn fixed(self, path: &str, latency: Duration, reply: MockReply) -> Self {
        self.route(path, latency, move |_, _| reply.clone())
    }

    pub fn history(&self) -> Vec<CallRecord> {
        self.history.read().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.history.read().iter().filter(|c| c.path == path).count()
    }

    pub fn total_calls(&self) -> usize {
        self.history.read().len()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportError> {
        let path = request.url.path().to_string();
        let started_at = Instant::now();

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let route = self.routes.read().get(&path).cloned();

        let reply = match route {
            Some(route) => {
                let call = route.calls.fetch_add(1, Ordering::SeqCst);
                if !route.latency.is_zero() {
                    tokio::time::sleep(route.latency).await;
                }
                (route.responder)(request, call)
            }
            None => MockReply::status(404),
        };

        let result = match reply {
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(err) => Err(err),
        };

        self.history.write().push(CallRecord {
            method: request.method.clone(),
            path,
            started_at,
            success: matches!(&result, Ok(r) if (200..300).contains(&r.status)),
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn request(path: &str) -> PreparedRequest {
        let url = Url::parse(&format!("http://mock.local{}", path)).unwrap();
        PreparedRequest::new(Method::POST, url, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_and_latency() {
        let mock = MockTransport::new().fixed(
            "/predict",
            Duration::from_millis(50),
            MockReply::json(200, serde_json::json!({ "prediction": 1.0 })),
        );

        let start = Instant::now();
        let response = mock.send(&request("/predict")).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.is_json());
        assert_eq!(start.elapsed(), Duration::from_millis(50));

        let missing = mock.send(&request("/nope")).await.unwrap();
        assert_eq!(missing.status, 404);

        assert_eq!(mock.calls_to("/predict"), 1);
        assert_eq!(mock.total_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_sequence() {
        let mock = MockTransport::new().route("/predict", Duration::ZERO, |_, n| {
            if n < 2 {
                MockReply::connection_refused()
            } else {
                MockReply::status(200)
            }
        });

        assert!(mock.send(&request("/predict")).await.is_err());
        assert!(mock.send(&request("/predict")).await.is_err());
        assert!(mock.send(&request("/predict")).await.is_ok());

        let history = mock.history();
        assert_eq!(history.iter().filter(|c| c.success).count(), 1);
    }
}

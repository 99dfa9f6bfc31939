//! Liveness probe that gates each iteration.

use crate::checks::lookup;
use crate::transport::{PreparedRequest, Transport, TransportResponse};
use loadgate_core::{metrics, FieldEquals};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Probe run before every main request of a runner.
///
/// All runners of a run share the `last_healthy` flag so that state changes
/// are logged once instead of once per virtual user.
pub struct HealthGate {
    transport: Arc<dyn Transport>,
    request: PreparedRequest,
    expected_status: u16,
    field_equals: Option<FieldEquals>,
    timeout: Duration,
    backoff: Duration,
    last_healthy: Arc<AtomicBool>,
}

impl HealthGate {
    pub fn new(
        transport: Arc<dyn Transport>,
        request: PreparedRequest,
        expected_status: u16,
        field_equals: Option<FieldEquals>,
        backoff: Duration,
        last_healthy: Arc<AtomicBool>,
    ) -> Self {
        let timeout = request.timeout;
        Self {
            transport,
            request,
            expected_status,
            field_equals,
            timeout,
            backoff,
            last_healthy,
        }
    }

    /// Pause before the next iteration after a failed probe.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// True when the service answered the probe as healthy within the timeout.
    pub async fn probe(&self) -> bool {
        let healthy = match tokio::time::timeout(self.timeout, self.transport.send(&self.request)).await {
            Ok(Ok(response)) => self.is_healthy(&response),
            Ok(Err(err)) => {
                tracing::trace!(error = %err, "Health probe failed");
                false
            }
            Err(_) => false,
        };

        metrics::observe_probe(healthy);

        let previous = self.last_healthy.swap(healthy, Ordering::SeqCst);
        if previous != healthy {
            if healthy {
                tracing::info!(url = %self.request.url, "Target is healthy again");
            } else {
                tracing::warn!(url = %self.request.url, "Target failed its liveness probe, gating iterations");
            }
        }

        healthy
    }

    fn is_healthy(&self, response: &TransportResponse) -> bool {
        if response.status != self.expected_status {
            return false;
        }

        match &self.field_equals {
            None => true,
            Some(expected) => serde_json::from_slice::<serde_json::Value>(&response.body)
                .ok()
                .as_ref()
                .and_then(|body| lookup(Some(body), &expected.field).cloned())
                .map(|value| value == expected.value)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockReply, MockTransport};
    use reqwest::{Method, Url};
    use serde_json::json;

    fn gate(mock: MockTransport, field_equals: Option<FieldEquals>) -> HealthGate {
        let request = PreparedRequest::new(
            Method::GET,
            Url::parse("http://mock.local/health").unwrap(),
            Duration::from_secs(2),
        );
        HealthGate::new(
            Arc::new(mock),
            request,
            200,
            field_equals,
            Duration::from_secs(1),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_only() {
        let healthy = MockTransport::new().fixed("/health", Duration::ZERO, MockReply::status(200));
        assert!(gate(healthy, None).probe().await);

        let unhealthy = MockTransport::new().fixed("/health", Duration::ZERO, MockReply::status(503));
        assert!(!gate(unhealthy, None).probe().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_field() {
        let expected = Some(FieldEquals {
            field: "status".to_string(),
            value: json!("ok"),
        });

        let ok = MockTransport::new().fixed(
            "/health",
            Duration::ZERO,
            MockReply::json(200, json!({ "status": "ok", "model_loaded": true })),
        );
        assert!(gate(ok, expected.clone()).probe().await);

        let degraded = MockTransport::new().fixed(
            "/health",
            Duration::ZERO,
            MockReply::json(200, json!({ "status": "degraded", "model_loaded": false })),
        );
        assert!(!gate(degraded, expected).probe().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_counts_as_unhealthy() {
        let slow = MockTransport::new().fixed("/health", Duration::from_secs(30), MockReply::status(200));
        let start = tokio::time::Instant::now();
        assert!(!gate(slow, None).probe().await);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable() {
        let down = MockTransport::new().fixed("/health", Duration::ZERO, MockReply::connection_refused());
        assert!(!gate(down, None).probe().await);
    }
}

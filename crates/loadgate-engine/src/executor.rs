//! Request executor: one main request per iteration, classified into an outcome.

use crate::checks::CheckSet;
use crate::transport::{PreparedRequest, Transport, TransportError, TransportResponse};
use bytes::Bytes;
use loadgate_core::{metrics, OutcomeKind, RequestOutcome};
use reqwest::{Method, Url};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const VU_PLACEHOLDER: &str = "{{vu}}";
const ITERATION_PLACEHOLDER: &str = "{{iteration}}";

/// Builds the body for `(vu, iteration)`.
pub type BodyFn = Arc<dyn Fn(u32, u64) -> Bytes + Send + Sync>;

/// Where the main request body comes from.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Text with `{{vu}}` and `{{iteration}}` placeholders.
    Template(String),
    Builder(BodyFn),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Template(text) => f.debug_tuple("Template").field(text).finish(),
            Self::Builder(_) => f.write_str("Builder(..)"),
        }
    }
}

impl From<Option<String>> for RequestBody {
    fn from(body: Option<String>) -> Self {
        body.map(Self::Template).unwrap_or_default()
    }
}

/// Method, URL, headers and body of the main request.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: RequestBody,
}

impl RequestTemplate {
    /// Render for one iteration, substituting `{{vu}}` and `{{iteration}}`.
    pub fn render(&self, vu: u32, iteration: u64, timeout: Duration) -> PreparedRequest {
        let mut request = PreparedRequest::new(self.method.clone(), self.url.clone(), timeout);
        for (name, value) in &self.headers {
            request = request.with_header(name, value.clone());
        }

        match &self.body {
            RequestBody::Empty => request,
            RequestBody::Template(text) if text.contains("{{") => request.with_body(Bytes::from(
                text.replace(VU_PLACEHOLDER, &vu.to_string())
                    .replace(ITERATION_PLACEHOLDER, &iteration.to_string()),
            )),
            RequestBody::Template(text) => request.with_body(Bytes::from(text.clone())),
            RequestBody::Builder(build) => request.with_body(build(vu, iteration)),
        }
    }
}

/// Sends the main request and classifies the result.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    template: RequestTemplate,
    acceptable_statuses: BTreeSet<u16>,
    checks: CheckSet,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        template: RequestTemplate,
        acceptable_statuses: impl IntoIterator<Item = u16>,
        checks: CheckSet,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            template,
            acceptable_statuses: acceptable_statuses.into_iter().collect(),
            checks,
            timeout,
        }
    }

    pub fn url(&self) -> &Url {
        &self.template.url
    }

    /// Run one iteration's main request. Never fails; every problem becomes an
    /// outcome kind.
    pub async fn execute(&self, vu: u32, iteration: u64) -> RequestOutcome {
        let request = self.template.render(vu, iteration, self.timeout);
        let start = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.transport.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        let end = Instant::now();

        let outcome = match result {
            Ok(response) => {
                let (kind, checks) = self.classify_response(&response);
                RequestOutcome::new(start.into_std(), end.into_std(), kind)
                    .with_status(response.status)
                    .with_checks(checks)
            }
            Err(err) => {
                tracing::debug!(vu, iteration, error = %err, "Request failed");
                let kind = match err {
                    TransportError::Timeout => OutcomeKind::Timeout,
                    TransportError::Connect(_) | TransportError::Other(_) => {
                        OutcomeKind::ConnectionError
                    }
                };
                RequestOutcome::new(start.into_std(), end.into_std(), kind)
                    .with_checks(self.checks.evaluate(None, None))
            }
        };

        metrics::observe_outcome(outcome.kind, outcome.latency());
        outcome
    }

    fn classify_response(&self, response: &TransportResponse) -> (OutcomeKind, BTreeMap<String, bool>) {
        let json = parse_json(
            response,
            self.checks.needs_json_body(),
            self.checks.has_custom(),
        );

        let kind = if !self.acceptable_statuses.contains(&response.status) {
            OutcomeKind::HttpFailure
        } else if matches!(json, BodyParse::Malformed) {
            OutcomeKind::MalformedResponse
        } else {
            OutcomeKind::Success
        };

        if kind != OutcomeKind::Success {
            tracing::debug!(status = response.status, kind = %kind, "Unsuccessful response");
        }

        let body = match &json {
            BodyParse::Parsed(value) => Some(value),
            _ => None,
        };

        (kind, self.checks.evaluate(Some(response), body))
    }
}

enum BodyParse {
    Parsed(Value),
    NotExpected,
    Malformed,
}

/// The body is expected to be JSON when the response says so or a check reads it.
///
/// With `opportunistic` set, an unexpected body is still parsed for the custom
/// checks, but failing to parse it is not an error.
fn parse_json(response: &TransportResponse, required: bool, opportunistic: bool) -> BodyParse {
    if !required && !response.is_json() {
        return match serde_json::from_slice::<Value>(&response.body) {
            Ok(value) if opportunistic => BodyParse::Parsed(value),
            _ => BodyParse::NotExpected,
        };
    }

    match serde_json::from_slice::<Value>(&response.body) {
        Ok(value) => BodyParse::Parsed(value),
        Err(_) => BodyParse::Malformed,
    }
}

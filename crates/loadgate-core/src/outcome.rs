//! Per-iteration outcome produced by a virtual user.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Classification of one scenario iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Status in the acceptable set and, when required, a parseable body.
    Success,
    /// Any status outside the acceptable set.
    HttpFailure,
    /// The per-call hard timeout elapsed.
    Timeout,
    /// The target could not be reached.
    ConnectionError,
    /// Acceptable status, but the body did not parse as the expected content type.
    MalformedResponse,
    /// The liveness probe failed, so the main request was not sent.
    HealthGated,
}

impl OutcomeKind {
    /// Every kind, in report order.
    pub const ALL: [OutcomeKind; 6] = [
        Self::Success,
        Self::HttpFailure,
        Self::Timeout,
        Self::ConnectionError,
        Self::MalformedResponse,
        Self::HealthGated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpFailure => "http_failure",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::MalformedResponse => "malformed_response",
            Self::HealthGated => "health_gated",
        }
    }

    /// True when a main request was actually sent.
    pub fn is_request(&self) -> bool {
        !matches!(self, Self::HealthGated)
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of one iteration, folded into the aggregator and then dropped.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub start_time: Instant,
    pub end_time: Instant,
    pub kind: OutcomeKind,
    pub status_code: Option<u16>,
    /// Named check results, independent of `kind`.
    pub checks: BTreeMap<String, bool>,
}

impl RequestOutcome {
    pub fn new(start_time: Instant, end_time: Instant, kind: OutcomeKind) -> Self {
        Self {
            start_time,
            end_time,
            kind,
            status_code: None,
            checks: BTreeMap::new(),
        }
    }

    /// Outcome for an iteration whose probe failed. Carries no checks.
    pub fn health_gated(start_time: Instant, end_time: Instant) -> Self {
        Self::new(start_time, end_time, OutcomeKind::HealthGated)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_checks(mut self, checks: BTreeMap<String, bool>) -> Self {
        self.checks = checks;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    pub fn latency(&self) -> Duration {
        self.end_time.saturating_duration_since(self.start_time)
    }
}

//! Threshold definitions and the `<metric> <op> <value>` expression parser.
//!
//! Accepted metrics:
//!
//! | Expression                                    | Observed value                    |
//! |-----------------------------------------------|-----------------------------------|
//! | `failure_rate`, `http_req_failed`             | failed / total requests           |
//! | `p95`, `p(99.9)`, `http_req_duration.p(95)`   | latency percentile, milliseconds  |
//! | `avg`, `min`, `med`, `max`                    | latency, milliseconds             |
//! | `checks`                                      | pass rate across all checks       |
//! | `check:<name>`, `checks{<name>}`              | pass rate of one named check      |
//! | `rps`, `http_reqs.rate`                       | successful requests per second    |
//! | `requests`, `http_reqs`                       | total counted requests            |
//!
//! Latency limits take `us`, `ms` or `s` suffixes (bare numbers are
//! milliseconds); rate limits may be written as percentages (`1%`).

use crate::error::{CoreError, CoreResult};
use crate::snapshot::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Observed-value function for programmatic thresholds.
pub type CustomMetricFn = Arc<dyn Fn(&MetricsSnapshot) -> f64 + Send + Sync>;

/// Which derived value of a snapshot a threshold looks at.
#[derive(Clone)]
pub enum ThresholdMetric {
    FailureRate,
    /// Percentile in (0, 100].
    LatencyPercentile(f64),
    LatencyMean,
    LatencyMin,
    LatencyMax,
    ChecksPassRate,
    CheckPassRate(String),
    Throughput,
    TotalRequests,
    Custom { name: String, observe: CustomMetricFn },
}

impl fmt::Debug for ThresholdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThresholdMetric({})", self.name())
    }
}

impl ThresholdMetric {
    /// Canonical metric name used in verdicts and reports.
    pub fn name(&self) -> String {
        match self {
            Self::FailureRate => "failure_rate".to_string(),
            Self::LatencyPercentile(p) => format!("p({p})"),
            Self::LatencyMean => "avg".to_string(),
            Self::LatencyMin => "min".to_string(),
            Self::LatencyMax => "max".to_string(),
            Self::ChecksPassRate => "checks".to_string(),
            Self::CheckPassRate(name) => format!("check:{name}"),
            Self::Throughput => "rps".to_string(),
            Self::TotalRequests => "requests".to_string(),
            Self::Custom { name, .. } => name.clone(),
        }
    }

    fn is_latency(&self) -> bool {
        matches!(
            self,
            Self::LatencyPercentile(_) | Self::LatencyMean | Self::LatencyMin | Self::LatencyMax
        )
    }

    fn is_rate(&self) -> bool {
        matches!(
            self,
            Self::FailureRate | Self::ChecksPassRate | Self::CheckPassRate(_)
        )
    }

    /// Derive the observed value from a snapshot. Latency is in milliseconds.
    pub fn observe(&self, snapshot: &MetricsSnapshot) -> f64 {
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1000.0;
        match self {
            Self::FailureRate => snapshot.failure_rate(),
            Self::LatencyPercentile(p) => ms(snapshot.percentile(p / 100.0)),
            Self::LatencyMean => ms(snapshot.mean_latency()),
            Self::LatencyMin => ms(snapshot.min_latency()),
            Self::LatencyMax => ms(snapshot.max_latency()),
            Self::ChecksPassRate => snapshot.overall_check_pass_rate(),
            Self::CheckPassRate(name) => snapshot.check_pass_rate(name).unwrap_or(0.0),
            Self::Throughput => snapshot.throughput_rps(),
            Self::TotalRequests => snapshot.total_requests as f64,
            Self::Custom { observe, .. } => observe(snapshot),
        }
    }
}

/// Comparison operator of a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::Equal => "==",
        }
    }

    /// NaN never satisfies a comparison.
    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Self::Less => observed < limit,
            Self::LessOrEqual => observed <= limit,
            Self::Greater => observed > limit,
            Self::GreaterOrEqual => observed >= limit,
            Self::Equal => (observed - limit).abs() <= f64::EPSILON * limit.abs().max(1.0),
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessOrEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterOrEqual),
            "==" => Some(Self::Equal),
            _ => None,
        }
    }
}

/// A pass condition on the aggregated metrics.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: ThresholdMetric,
    pub comparison: Comparison,
    pub limit: f64,
    /// Human description; the source expression for parsed thresholds.
    pub description: String,
    /// Stop the run early when a periodic evaluation fails this threshold.
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn new(metric: ThresholdMetric, comparison: Comparison, limit: f64) -> Self {
        let description = format!("{} {} {}", metric.name(), comparison.symbol(), limit);
        Self {
            metric,
            comparison,
            limit,
            description,
            abort_on_fail: false,
        }
    }

    /// Programmatic threshold over an arbitrary derived value.
    pub fn custom<F>(name: impl Into<String>, comparison: Comparison, limit: f64, observe: F) -> Self
    where
        F: Fn(&MetricsSnapshot) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            ThresholdMetric::Custom {
                name: name.into(),
                observe: Arc::new(observe),
            },
            comparison,
            limit,
        )
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    pub fn metric_name(&self) -> String {
        self.metric.name()
    }

    /// The requirement in readable form, e.g. `< 800`.
    pub fn requirement(&self) -> String {
        format!("{} {}", self.comparison.symbol(), self.limit)
    }

    /// Observed value and whether the threshold holds for it.
    pub fn check(&self, snapshot: &MetricsSnapshot) -> (f64, bool) {
        let observed = self.metric.observe(snapshot);
        (observed, self.comparison.holds(observed, self.limit))
    }

    /// Parse `<metric> <op> <value>`.
    pub fn parse(expression: &str) -> CoreResult<Self> {
        let invalid = |message: &str| CoreError::invalid_threshold(expression, message);

        let (metric_part, symbol, value_part) =
            split_operator(expression).ok_or_else(|| invalid("missing comparison operator"))?;
        let comparison =
            Comparison::from_symbol(symbol).ok_or_else(|| invalid("unknown comparison operator"))?;

        let metric_part = metric_part.trim();
        if metric_part.is_empty() {
            return Err(invalid("missing metric name"));
        }
        let metric = parse_metric(metric_part).map_err(|m| invalid(&m))?;

        let value_part = value_part.trim();
        if value_part.is_empty() {
            return Err(invalid("missing limit value"));
        }
        let limit = parse_limit(&metric, value_part).map_err(|m| invalid(&m))?;

        Ok(Self {
            metric,
            comparison,
            limit,
            description: expression.trim().to_string(),
            abort_on_fail: false,
        })
    }
}

/// Split on the rightmost comparison operator so check names may contain
/// operator characters.
fn split_operator(expression: &str) -> Option<(&str, &str, &str)> {
    let bytes = expression.as_bytes();
    let idx = expression.rfind(|c: char| c == '<' || c == '>' || c == '=')?;

    let (start, end) = if bytes[idx] == b'=' && idx > 0 && matches!(bytes[idx - 1], b'<' | b'>' | b'=') {
        (idx - 1, idx + 1)
    } else {
        (idx, idx + 1)
    };

    Some((&expression[..start], &expression[start..end], &expression[end..]))
}

fn parse_metric(raw: &str) -> Result<ThresholdMetric, String> {
    if let Some(name) = raw.strip_prefix("check:") {
        let name = name.trim();
        if name.is_empty() {
            return Err("check name is empty".to_string());
        }
        return Ok(ThresholdMetric::CheckPassRate(name.to_string()));
    }
    if let Some(name) = raw.strip_prefix("checks{").and_then(|r| r.strip_suffix('}')) {
        return Ok(ThresholdMetric::CheckPassRate(name.trim().to_string()));
    }

    let lowered = raw.to_ascii_lowercase();
    let key = lowered
        .strip_prefix("http_req_duration.")
        .or_else(|| lowered.strip_prefix("latency."))
        .unwrap_or(&lowered);

    let metric = match key {
        "failure_rate" | "error_rate" | "http_req_failed" | "http_req_failed.rate" => {
            ThresholdMetric::FailureRate
        }
        "avg" | "mean" => ThresholdMetric::LatencyMean,
        "min" => ThresholdMetric::LatencyMin,
        "max" => ThresholdMetric::LatencyMax,
        "med" => ThresholdMetric::LatencyPercentile(50.0),
        "checks" | "checks.rate" => ThresholdMetric::ChecksPassRate,
        "rps" | "throughput" | "http_reqs.rate" => ThresholdMetric::Throughput,
        "requests" | "http_reqs" | "http_reqs.count" => ThresholdMetric::TotalRequests,
        other => {
            let pct = other
                .strip_prefix("p(")
                .and_then(|r| r.strip_suffix(')'))
                .or_else(|| other.strip_prefix('p'))
                .ok_or_else(|| format!("unknown metric `{raw}`"))?;
            let pct: f64 = pct
                .trim()
                .parse()
                .map_err(|_| format!("unknown metric `{raw}`"))?;
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(format!("percentile {pct} is outside (0, 100]"));
            }
            ThresholdMetric::LatencyPercentile(pct)
        }
    };

    Ok(metric)
}

fn parse_limit(metric: &ThresholdMetric, raw: &str) -> Result<f64, String> {
    let number = |s: &str| -> Result<f64, String> {
        let v: f64 = s
            .trim()
            .parse()
            .map_err(|_| format!("`{raw}` is not a number"))?;
        if v.is_finite() {
            Ok(v)
        } else {
            Err(format!("`{raw}` is not finite"))
        }
    };

    if metric.is_latency() {
        if let Some(v) = raw.strip_suffix("ms") {
            return number(v);
        }
        if let Some(v) = raw.strip_suffix("us").or_else(|| raw.strip_suffix("µs")) {
            return Ok(number(v)? / 1000.0);
        }
        if let Some(v) = raw.strip_suffix('s') {
            return Ok(number(v)? * 1000.0);
        }
        return number(raw);
    }

    if metric.is_rate() {
        if let Some(v) = raw.strip_suffix('%') {
            return Ok(number(v)? / 100.0);
        }
    }

    number(raw)
}

/// Threshold as written in configuration: a bare expression, or an
/// expression with options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed {
        expression: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

impl ThresholdSpec {
    pub fn expression(&self) -> &str {
        match self {
            Self::Expression(e) => e,
            Self::Detailed { expression, .. } => expression,
        }
    }

    pub fn to_threshold(&self) -> CoreResult<Threshold> {
        let threshold = Threshold::parse(self.expression())?;
        Ok(match self {
            Self::Expression(_) => threshold,
            Self::Detailed { abort_on_fail, .. } => threshold.with_abort_on_fail(*abort_on_fail),
        })
    }
}

impl From<&str> for ThresholdSpec {
    fn from(expression: &str) -> Self {
        Self::Expression(expression.to_string())
    }
}

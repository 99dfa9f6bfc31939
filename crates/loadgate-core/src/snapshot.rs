//! Aggregated run metrics and the values derived from them.

use crate::outcome::{OutcomeKind, RequestOutcome};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Lowest trackable latency in microseconds.
const LATENCY_LOW_US: u64 = 1;
/// Highest trackable latency in microseconds (one hour). Larger values saturate.
const LATENCY_HIGH_US: u64 = 3_600_000_000;
/// Significant decimal digits kept by the histogram (0.1% relative error).
const LATENCY_SIGFIG: u8 = 3;

/// Pass/fail tally for one named check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCounter {
    pub passes: u64,
    pub fails: u64,
}

impl CheckCounter {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }

    /// Pass rate in 0.0-1.0; 0.0 for a check that never ran.
    pub fn pass_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.passes as f64 / self.total() as f64
    }
}

/// Aggregated metrics for a run (or a live view of one).
///
/// Only the aggregator mutates one of these; everybody else reads copies.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Requests actually counted against thresholds.
    pub total_requests: u64,
    /// Counted requests that did not succeed.
    pub failed_requests: u64,
    /// Iteration tally by classification, gated iterations included.
    pub outcomes: BTreeMap<OutcomeKind, u64>,
    /// Responses by HTTP status code.
    pub status_codes: BTreeMap<u16, u64>,
    /// Latency of every sent request, in microseconds.
    pub latency: Histogram<u64>,
    /// Named check tallies.
    pub checks: BTreeMap<String, CheckCounter>,
    /// Iterations skipped because the liveness probe failed.
    pub health_gated: u64,
    /// Iterations cut off by the end of the graceful ramp-down.
    pub interrupted_iterations: u64,
    /// Highest number of virtual users running an iteration at once.
    pub peak_concurrency: u32,
    /// Wall time covered by this snapshot.
    pub elapsed: Duration,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        let latency = Histogram::new_with_bounds(LATENCY_LOW_US, LATENCY_HIGH_US, LATENCY_SIGFIG)
            .expect("latency histogram bounds are constant and valid");

        Self {
            total_requests: 0,
            failed_requests: 0,
            outcomes: BTreeMap::new(),
            status_codes: BTreeMap::new(),
            latency,
            checks: BTreeMap::new(),
            health_gated: 0,
            interrupted_iterations: 0,
            peak_concurrency: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Fold one outcome in.
    ///
    /// `penalize_gated` decides whether a health-gated iteration counts as a
    /// failed request.
    pub fn fold(&mut self, outcome: &RequestOutcome, penalize_gated: bool) {
        *self.outcomes.entry(outcome.kind).or_insert(0) += 1;

        if outcome.kind == OutcomeKind::HealthGated {
            self.health_gated += 1;
            if penalize_gated {
                self.total_requests += 1;
                self.failed_requests += 1;
            }
            return;
        }

        self.total_requests += 1;
        if !outcome.succeeded() {
            self.failed_requests += 1;
        }

        if let Some(status) = outcome.status_code {
            *self.status_codes.entry(status).or_insert(0) += 1;
        }

        let micros = u64::try_from(outcome.latency().as_micros()).unwrap_or(u64::MAX);
        self.latency.saturating_record(micros.max(LATENCY_LOW_US));

        for (name, passed) in &outcome.checks {
            let counter = self.checks.entry(name.clone()).or_default();
            if *passed {
                counter.passes += 1;
            } else {
                counter.fails += 1;
            }
        }
    }

    /// Count of iterations with the given classification.
    pub fn count(&self, kind: OutcomeKind) -> u64 {
        self.outcomes.get(&kind).copied().unwrap_or(0)
    }

    /// Successful requests.
    pub fn successful_requests(&self) -> u64 {
        self.count(OutcomeKind::Success)
    }

    /// failed / total, 0.0 when nothing was sent.
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }

    /// Latency at quantile `q` (0.0-1.0). Zero when nothing was recorded.
    pub fn percentile(&self, q: f64) -> Duration {
        if self.latency.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency.value_at_quantile(q.clamp(0.0, 1.0)))
    }

    pub fn p50(&self) -> Duration {
        self.percentile(0.50)
    }

    pub fn p90(&self) -> Duration {
        self.percentile(0.90)
    }

    pub fn p95(&self) -> Duration {
        self.percentile(0.95)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(0.99)
    }

    pub fn min_latency(&self) -> Duration {
        if self.latency.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency.min())
    }

    pub fn max_latency(&self) -> Duration {
        if self.latency.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency.max())
    }

    pub fn mean_latency(&self) -> Duration {
        if self.latency.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.latency.mean() / 1_000_000.0)
    }

    /// Successful requests per second over `elapsed`.
    pub fn throughput_rps(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.successful_requests() as f64 / self.elapsed.as_secs_f64()
    }

    /// Pass rate of one named check, `None` if no check by that name exists.
    pub fn check_pass_rate(&self, name: &str) -> Option<f64> {
        self.checks.get(name).map(CheckCounter::pass_rate)
    }

    /// Pass rate across every check evaluation; 0.0 when none ran.
    pub fn overall_check_pass_rate(&self) -> f64 {
        let (passes, total) = self
            .checks
            .values()
            .fold((0u64, 0u64), |(p, t), c| (p + c.passes, t + c.total()));
        if total == 0 {
            return 0.0;
        }
        passes as f64 / total as f64
    }

    /// Serializable digest of this snapshot for reports.
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests,
            failure_rate: self.failure_rate(),
            health_gated: self.health_gated,
            interrupted_iterations: self.interrupted_iterations,
            peak_concurrency: self.peak_concurrency,
            duration_seconds: self.elapsed.as_secs_f64(),
            throughput_rps: self.throughput_rps(),
            outcomes: OutcomeKind::ALL
                .iter()
                .map(|k| (k.as_str().to_string(), self.count(*k)))
                .collect(),
            status_codes: self
                .status_codes
                .iter()
                .map(|(code, n)| (code.to_string(), *n))
                .collect(),
            latency_ms: LatencySummary {
                min: as_ms(self.min_latency()),
                mean: as_ms(self.mean_latency()),
                p50: as_ms(self.p50()),
                p90: as_ms(self.p90()),
                p95: as_ms(self.p95()),
                p99: as_ms(self.p99()),
                max: as_ms(self.max_latency()),
            },
            checks: self
                .checks
                .iter()
                .map(|(name, c)| {
                    (
                        name.clone(),
                        CheckSummary {
                            passes: c.passes,
                            fails: c.fails,
                            pass_rate: c.pass_rate(),
                        },
                    )
                })
                .collect(),
        }
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Latency digest in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub passes: u64,
    pub fails: u64,
    pub pass_rate: f64,
}

/// Report-friendly view of a [`MetricsSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub health_gated: u64,
    pub interrupted_iterations: u64,
    pub peak_concurrency: u32,
    pub duration_seconds: f64,
    pub throughput_rps: f64,
    pub outcomes: BTreeMap<String, u64>,
    pub status_codes: BTreeMap<String, u64>,
    pub latency_ms: LatencySummary,
    pub checks: BTreeMap<String, CheckSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn outcome(kind: OutcomeKind, latency_ms: u64) -> RequestOutcome {
        let start = Instant::now();
        RequestOutcome::new(start, start + Duration::from_millis(latency_ms), kind)
    }

    #[test]
    fn test_failure_rate() {
        let mut snapshot = MetricsSnapshot::new();
        for _ in 0..98 {
            snapshot.fold(&outcome(OutcomeKind::Success, 10), false);
        }
        snapshot.fold(&outcome(OutcomeKind::HttpFailure, 10), false);
        snapshot.fold(&outcome(OutcomeKind::Timeout, 10), false);

        assert_eq!(snapshot.total_requests, 100);
        assert_eq!(snapshot.failure_rate(), 0.02);
    }

    #[test]
    fn test_empty_snapshot_derivations() {
        let snapshot = MetricsSnapshot::new();
        assert_eq!(snapshot.failure_rate(), 0.0);
        assert_eq!(snapshot.p95(), Duration::ZERO);
        assert_eq!(snapshot.throughput_rps(), 0.0);
        assert_eq!(snapshot.overall_check_pass_rate(), 0.0);
    }

    #[test]
    fn test_percentiles_within_histogram_precision() {
        let mut snapshot = MetricsSnapshot::new();
        // 1ms, 2ms, ..., 100ms
        for ms in 1..=100 {
            snapshot.fold(&outcome(OutcomeKind::Success, ms), false);
        }

        let p95 = snapshot.p95().as_secs_f64() * 1000.0;
        let p50 = snapshot.p50().as_secs_f64() * 1000.0;
        assert!((p95 - 95.0).abs() <= 1.0, "p95 was {p95}");
        assert!((p50 - 50.0).abs() <= 1.0, "p50 was {p50}");
        assert!(snapshot.max_latency() >= Duration::from_millis(100));
    }

    #[test]
    fn test_health_gated_policy() {
        let mut lenient = MetricsSnapshot::new();
        lenient.fold(&outcome(OutcomeKind::HealthGated, 0), false);
        assert_eq!(lenient.total_requests, 0);
        assert_eq!(lenient.health_gated, 1);

        let mut strict = MetricsSnapshot::new();
        strict.fold(&outcome(OutcomeKind::HealthGated, 0), true);
        assert_eq!(strict.total_requests, 1);
        assert_eq!(strict.failed_requests, 1);
        assert!(strict.latency.is_empty());
    }

    #[test]
    fn test_checks_counted_independently_of_success() {
        let mut snapshot = MetricsSnapshot::new();
        let mut checks = BTreeMap::new();
        checks.insert("status is 200".to_string(), true);
        checks.insert("has prediction".to_string(), false);
        snapshot.fold(
            &outcome(OutcomeKind::Success, 5).with_status(200).with_checks(checks),
            false,
        );

        assert_eq!(snapshot.failure_rate(), 0.0);
        assert_eq!(snapshot.check_pass_rate("status is 200"), Some(1.0));
        assert_eq!(snapshot.check_pass_rate("has prediction"), Some(0.0));
        assert_eq!(snapshot.check_pass_rate("missing"), None);
        assert_eq!(snapshot.overall_check_pass_rate(), 0.5);
        assert_eq!(snapshot.status_codes.get(&200), Some(&1));
    }

    #[test]
    fn test_summary_lists_every_outcome_kind() {
        let summary = MetricsSnapshot::new().summary();
        assert_eq!(summary.outcomes.len(), OutcomeKind::ALL.len());
        assert_eq!(summary.outcomes["malformed_response"], 0);
    }
}

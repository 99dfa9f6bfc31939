//! Threshold evaluation: metrics in, verdict out.

use loadgate_core::{MetricsSnapshot, OutcomeKind, Threshold, ThresholdFailure, Verdict};

/// True when no main request was sent at all.
pub fn is_empty_run(snapshot: &MetricsSnapshot) -> bool {
    OutcomeKind::ALL
        .iter()
        .filter(|kind| kind.is_request())
        .all(|kind| snapshot.count(*kind) == 0)
}

/// Evaluate every threshold against a snapshot.
///
/// Pure and deterministic. A run that sent nothing never passes, whatever
/// the thresholds say. Every failing threshold is reported, in order.
pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &[Threshold]) -> Verdict {
    let failures = thresholds
        .iter()
        .filter_map(|threshold| failure_of(snapshot, threshold))
        .collect();

    Verdict::evaluated(is_empty_run(snapshot), failures)
}

/// First `abort_on_fail` threshold failing on a live snapshot, if any.
///
/// Empty snapshots are never judged; there is nothing to abort on yet.
pub fn first_abort(snapshot: &MetricsSnapshot, thresholds: &[Threshold]) -> Option<ThresholdFailure> {
    if is_empty_run(snapshot) {
        return None;
    }

    thresholds
        .iter()
        .filter(|threshold| threshold.abort_on_fail)
        .find_map(|threshold| failure_of(snapshot, threshold))
}

fn failure_of(snapshot: &MetricsSnapshot, threshold: &Threshold) -> Option<ThresholdFailure> {
    let (observed, holds) = threshold.check(snapshot);
    if holds {
        return None;
    }

    Some(ThresholdFailure {
        metric: threshold.metric_name(),
        description: threshold.description.clone(),
        observed,
        required: threshold.requirement(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgate_core::{Comparison, RequestOutcome, VerdictStatus};
    use std::time::{Duration, Instant};

    fn thresholds() -> Vec<Threshold> {
        vec![
            Threshold::parse("failure_rate < 0.01").unwrap(),
            Threshold::parse("p95 < 800ms").unwrap(),
        ]
    }

    fn snapshot_with(kind: OutcomeKind, status: u16, latency_ms: u64, n: usize) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new();
        let start = Instant::now();
        for _ in 0..n {
            let outcome = RequestOutcome::new(start, start + Duration::from_millis(latency_ms), kind)
                .with_status(status);
            snapshot.fold(&outcome, false);
        }
        snapshot
    }

    #[test]
    fn test_healthy_run_passes() {
        let snapshot = snapshot_with(OutcomeKind::Success, 200, 50, 500);
        let verdict = evaluate(&snapshot, &thresholds());
        assert!(verdict.passed);
        assert_eq!(verdict.status, VerdictStatus::Passed);
        assert!(verdict.failures.is_empty());
    }

    #[test]
    fn test_all_errors_fail_on_failure_rate() {
        let snapshot = snapshot_with(OutcomeKind::HttpFailure, 500, 5, 200);
        let verdict = evaluate(&snapshot, &thresholds());
        assert!(!verdict.passed);
        assert_eq!(verdict.failures.len(), 1);
        assert_eq!(verdict.failures[0].metric, "failure_rate");
        assert_eq!(verdict.failures[0].observed, 1.0);
    }

    #[test]
    fn test_every_failure_is_listed() {
        let snapshot = snapshot_with(OutcomeKind::HttpFailure, 500, 1_500, 10);
        let verdict = evaluate(&snapshot, &thresholds());
        let metrics: Vec<_> = verdict.failures.iter().map(|f| f.metric.as_str()).collect();
        assert_eq!(metrics, vec!["failure_rate", "p(95)"]);
    }

    #[test]
    fn test_empty_snapshot_fails() {
        let verdict = evaluate(&MetricsSnapshot::new(), &thresholds());
        assert!(!verdict.passed);
        assert!(verdict.empty_run);

        // Even with no thresholds at all.
        assert!(!evaluate(&MetricsSnapshot::new(), &[]).passed);
    }

    #[test]
    fn test_only_gated_iterations_is_empty() {
        let mut snapshot = MetricsSnapshot::new();
        let now = Instant::now();
        snapshot.fold(&RequestOutcome::health_gated(now, now), true);
        assert!(is_empty_run(&snapshot));
        assert!(!evaluate(&snapshot, &[]).passed);
    }

    #[test]
    fn test_first_abort_ignores_plain_thresholds() {
        let snapshot = snapshot_with(OutcomeKind::HttpFailure, 500, 5, 10);
        assert!(first_abort(&snapshot, &thresholds()).is_none());

        let mut gated = thresholds();
        gated[0] = gated[0].clone().with_abort_on_fail(true);
        let failure = first_abort(&snapshot, &gated).unwrap();
        assert_eq!(failure.metric, "failure_rate");

        assert!(first_abort(&MetricsSnapshot::new(), &gated).is_none());
    }

    #[test]
    fn test_custom_threshold() {
        let snapshot = snapshot_with(OutcomeKind::Success, 200, 10, 20);
        let threshold = Threshold::custom("served_500s", Comparison::Equal, 0.0, |s| {
            s.status_codes.get(&500).copied().unwrap_or(0) as f64
        });
        assert!(evaluate(&snapshot, &[threshold]).passed);
    }
}

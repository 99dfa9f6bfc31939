//! Metrics aggregator: the single owner of a run's counters.
//!
//! Runners fold outcomes in concurrently; readers take copies. After
//! [`MetricsAggregator::finalize`] the snapshot is frozen and late outcomes
//! are dropped.

use loadgate_core::{MetricsSnapshot, RequestOutcome};
use parking_lot::Mutex;
use tokio::time::Instant;

struct AggregatorState {
    snapshot: MetricsSnapshot,
    started_at: Option<Instant>,
    frozen: bool,
}

pub struct MetricsAggregator {
    state: Mutex<AggregatorState>,
    penalize_gated: bool,
}

impl MetricsAggregator {
    /// `penalize_gated` counts health-gated iterations as failed requests.
    pub fn new(penalize_gated: bool) -> Self {
        Self {
            state: Mutex::new(AggregatorState {
                snapshot: MetricsSnapshot::new(),
                started_at: None,
                frozen: false,
            }),
            penalize_gated,
        }
    }

    /// Mark the start of the measured window. Later calls are ignored.
    pub fn start(&self, at: Instant) {
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(at);
        }
    }

    /// Fold one outcome. Returns false when the aggregator is already frozen.
    pub fn record(&self, outcome: &RequestOutcome) -> bool {
        let mut state = self.state.lock();
        if state.frozen {
            tracing::trace!(kind = %outcome.kind, "Dropping outcome recorded after finalize");
            return false;
        }
        state.snapshot.fold(outcome, self.penalize_gated);
        true
    }

    /// Track the number of runners inside an iteration.
    pub fn observe_concurrency(&self, active: u32) {
        let mut state = self.state.lock();
        if !state.frozen && active > state.snapshot.peak_concurrency {
            state.snapshot.peak_concurrency = active;
        }
    }

    /// Count iterations cut off by a forced stop.
    pub fn record_interrupted(&self, count: u64) {
        let mut state = self.state.lock();
        if !state.frozen {
            state.snapshot.interrupted_iterations += count;
        }
    }

    /// Copy of the current counters, with `elapsed` measured up to now.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        let mut snapshot = state.snapshot.clone();
        if !state.frozen {
            snapshot.elapsed = state
                .started_at
                .map(|start| start.elapsed())
                .unwrap_or_default();
        }
        snapshot
    }

    /// Freeze and return the final snapshot. Idempotent.
    pub fn finalize(&self) -> MetricsSnapshot {
        let mut state = self.state.lock();
        if !state.frozen {
            state.snapshot.elapsed = state
                .started_at
                .map(|start| start.elapsed())
                .unwrap_or_default();
            state.frozen = true;
        }
        state.snapshot.clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().frozen
    }
}

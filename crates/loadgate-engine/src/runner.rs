//! Virtual user: a loop of iterations gated by the commanded concurrency.

use crate::aggregator::MetricsAggregator;
use crate::executor::RequestExecutor;
use crate::health::HealthGate;
use crate::scenario::RunnerBinding;
use loadgate_core::metrics::{self, ACTIVE_VUS};
use loadgate_core::RequestOutcome;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle of one virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Index at or above the commanded target; waiting.
    Idle,
    /// Executing iterations.
    Running,
    /// Drain requested; the in-flight iteration is finishing.
    Draining,
    /// Loop exited.
    Stopped,
}

/// Signals every runner of a run listens to.
#[derive(Clone)]
pub struct RunnerSignals {
    pub target: watch::Receiver<u32>,
    pub drain: watch::Receiver<bool>,
}

/// Counters shared by the runners and the controller.
#[derive(Clone)]
pub struct RunnerShared {
    pub aggregator: Arc<MetricsAggregator>,
    /// Runners currently inside an iteration.
    pub in_flight: Arc<AtomicU32>,
    pub think_time: Duration,
}

/// Final numbers of one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSummary {
    pub index: u32,
    pub iterations: u64,
}

pub struct VirtualUser {
    index: u32,
    executor: RequestExecutor,
    gate: Option<HealthGate>,
    shared: RunnerShared,
    signals: RunnerSignals,
    state: watch::Sender<RunnerState>,
    iterations: u64,
}

impl VirtualUser {
    pub fn new(index: u32, binding: RunnerBinding, shared: RunnerShared, signals: RunnerSignals) -> Self {
        Self {
            index,
            executor: binding.executor,
            gate: binding.gate,
            shared,
            signals,
            state: watch::channel(RunnerState::Idle).0,
            iterations: 0,
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Follow state changes after the runner has been moved into its task.
    pub fn watch_state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Loop until a drain is requested.
    ///
    /// An iteration that has started always completes. A drain arriving
    /// mid-iteration moves the runner to `Draining` until it does; retirement
    /// (target dropping below this runner's index) is only observed between
    /// iterations.
    pub async fn run(mut self) -> RunnerSummary {
        loop {
            if self.drain_requested() {
                break;
            }

            let target = *self.signals.target.borrow_and_update();
            if self.index >= target {
                self.transition(RunnerState::Idle);
                tokio::select! {
                    changed = self.signals.target.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.signals.drain.changed() => {}
                }
                continue;
            }

            self.transition(RunnerState::Running);
            let iteration = self.iterations;
            self.iterations += 1;

            let mut drain = self.signals.drain.clone();
            let pause = {
                let current = self.iterate(iteration);
                tokio::pin!(current);
                tokio::select! {
                    pause = &mut current => pause,
                    _ = drain_signalled(&mut drain) => {
                        self.transition(RunnerState::Draining);
                        current.await
                    }
                }
            };

            if self.drain_requested() {
                self.transition(RunnerState::Draining);
                break;
            }

            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.signals.drain.changed() => {}
                }
            }
        }

        self.transition(RunnerState::Stopped);
        RunnerSummary {
            index: self.index,
            iterations: self.iterations,
        }
    }

    /// One iteration; returns how long to pause before the next one.
    async fn iterate(&self, iteration: u64) -> Duration {
        let mut active = ActiveIteration::enter(&self.shared);

        if let Some(gate) = &self.gate {
            let start = Instant::now();
            if !gate.probe().await {
                let outcome = RequestOutcome::health_gated(start.into_std(), Instant::now().into_std());
                metrics::observe_outcome(outcome.kind, outcome.latency());
                self.shared.aggregator.record(&outcome);
                active.complete();
                return gate.backoff();
            }
        }

        let outcome = self.executor.execute(self.index, iteration).await;
        self.shared.aggregator.record(&outcome);
        active.complete();
        self.shared.think_time
    }

    fn drain_requested(&self) -> bool {
        // A dropped sender means the controller is gone.
        *self.signals.drain.borrow() || self.signals.drain.has_changed().is_err()
    }

    fn transition(&self, next: RunnerState) {
        let from = *self.state.borrow();
        if from != next {
            tracing::trace!(runner = self.index, from = ?from, to = ?next, "Runner state change");
            self.state.send_replace(next);
        }
    }
}

/// Resolves once a drain is requested or the controller is gone.
async fn drain_signalled(drain: &mut watch::Receiver<bool>) {
    let _ = drain.wait_for(|draining| *draining).await;
}

/// Marks a runner as inside an iteration for as long as it lives.
///
/// Dropped without [`ActiveIteration::complete`] means the task was cancelled
/// by a forced stop, and the iteration is counted as interrupted.
struct ActiveIteration<'a> {
    shared: &'a RunnerShared,
    completed: bool,
}

impl<'a> ActiveIteration<'a> {
    fn enter(shared: &'a RunnerShared) -> Self {
        let active = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.aggregator.observe_concurrency(active);
        ACTIVE_VUS.inc();
        Self {
            shared,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ActiveIteration<'_> {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        ACTIVE_VUS.dec();
        if !self.completed {
            self.shared.aggregator.record_interrupted(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;
    use crate::transport::{MockReply, MockTransport};
    use loadgate_core::RunPlan;
    use serde_json::json;

    struct Harness {
        shared: RunnerShared,
        target_tx: watch::Sender<u32>,
        drain_tx: watch::Sender<bool>,
        scenario: Scenario,
        plan: RunPlan,
        mock: MockTransport,
    }

    fn harness(initial_target: u32) -> Harness {
        let mut plan = RunPlan::default();
        plan.target.base_url = "http://mock.local".to_string();
        let mock = MockTransport::new().fixed(
            "/predict",
            Duration::from_millis(100),
            MockReply::json(200, json!({ "prediction": 1.0 })),
        );
        let scenario = Scenario::from_plan(&plan, Arc::new(mock.clone())).unwrap();
        let (target_tx, _) = watch::channel(initial_target);
        let (drain_tx, _) = watch::channel(false);

        Harness {
            shared: RunnerShared {
                aggregator: Arc::new(MetricsAggregator::new(false)),
                in_flight: Arc::new(AtomicU32::new(0)),
                think_time: Duration::from_secs(1),
            },
            target_tx,
            drain_tx,
            scenario,
            plan,
            mock,
        }
    }

    impl Harness {
        fn runner(&self, index: u32) -> VirtualUser {
            let config = self.plan.run_config().unwrap();
            VirtualUser::new(
                index,
                self.scenario.bind(index, &config).unwrap(),
                self.shared.clone(),
                RunnerSignals {
                    target: self.target_tx.subscribe(),
                    drain: self.drain_tx.subscribe(),
                },
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_iterations_with_think_time() {
        let h = harness(1);
        let task = tokio::spawn(h.runner(0).run());

        // Each iteration is 100ms of latency plus 1s of think time.
        tokio::time::sleep(Duration::from_millis(3_050)).await;
        h.drain_tx.send(true).unwrap();
        let summary = task.await.unwrap();

        assert_eq!(summary.iterations, 3);
        assert_eq!(h.shared.aggregator.snapshot().total_requests, 3);
        assert_eq!(h.shared.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_above_target_stays_idle() {
        let h = harness(1);
        let task = tokio::spawn(h.runner(1).run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.mock.total_calls(), 0);

        h.target_tx.send(2).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.mock.calls_to("/predict"), 1);

        h.drain_tx.send(true).unwrap();
        let summary = task.await.unwrap();
        assert_eq!(summary.index, 1);
        assert_eq!(summary.iterations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_lets_in_flight_iteration_finish() {
        let h = harness(1);
        let task = tokio::spawn(h.runner(0).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.drain_tx.send(true).unwrap();
        let summary = task.await.unwrap();

        assert_eq!(summary.iterations, 1);
        let snapshot = h.shared.aggregator.snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.successful_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_iteration_is_interrupted() {
        let h = harness(1);
        let task = tokio::spawn(h.runner(0).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let snapshot = h.shared.aggregator.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.interrupted_iterations, 1);
        assert_eq!(h.shared.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_mid_iteration_is_observable() {
        let h = harness(1);
        let runner = h.runner(0);
        let state = runner.watch_state();
        let task = tokio::spawn(runner.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*state.borrow(), RunnerState::Running);

        h.drain_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*state.borrow(), RunnerState::Draining);
        assert_eq!(h.shared.in_flight.load(Ordering::SeqCst), 1);

        let summary = task.await.unwrap();
        assert_eq!(summary.iterations, 1);
        assert_eq!(*state.borrow(), RunnerState::Stopped);
        assert_eq!(h.shared.aggregator.snapshot().total_requests, 1);
    }

    #[test]
    fn test_initial_state_is_idle() {
        let h = harness(0);
        assert_eq!(h.runner(0).state(), RunnerState::Idle);
    }
}

//! Run controller: owns the scheduler, the runner pool and the verdict.
//!
//! Lifecycle: [`RunController::configure`] → [`RunController::start`] →
//! (scheduler drives runners) → optional [`RunController::drain`] →
//! [`RunController::finalize`].
//!
//! ```rust,no_run
//! use loadgate_core::RunPlan;
//! use loadgate_engine::{HttpTransport, RunController, Scenario};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> loadgate_engine::EngineResult<()> {
//! let plan = RunPlan::load(None)?;
//! let transport = Arc::new(HttpTransport::new(Duration::from_secs(5))?);
//! let scenario = Scenario::from_plan(&plan, transport)?;
//!
//! let controller = RunController::configure(plan.run_config()?, scenario)?;
//! controller.start()?;
//! let result = controller.finalize().await;
//! std::process::exit(result.verdict.exit_code());
//! # }
//! ```

use crate::aggregator::MetricsAggregator;
use crate::error::{EngineError, EngineResult};
use crate::evaluator;
use crate::runner::{RunnerShared, RunnerSignals, RunnerSummary, VirtualUser};
use crate::scenario::Scenario;
use crate::scheduler::{SchedulerExit, StageScheduler};
use chrono::{DateTime, Utc};
use loadgate_core::metrics::{ACTIVE_VUS, TARGET_VUS};
use loadgate_core::{MetricsSnapshot, RampStage, RunConfig, ThresholdFailure, Verdict};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

/// Interval of the progress log line.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Configured,
    Running,
    Draining,
    Finalized,
}

/// Why the run stopped generating load.
#[derive(Debug, Clone, PartialEq)]
pub enum RunTermination {
    /// Every stage played out.
    Completed,
    /// [`RunController::drain`] was called before the profile ended.
    Drained,
    /// A periodic evaluation failed an `abort_on_fail` threshold.
    ThresholdAbort(ThresholdFailure),
    /// The run could not execute (runner setup failure).
    Aborted(String),
    /// Finalized without ever being started.
    NotStarted,
}

/// Everything known about a finished run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub verdict: Verdict,
    pub snapshot: MetricsSnapshot,
    pub termination: RunTermination,
    pub stages: Vec<RampStage>,
}

pub struct RunController {
    run_id: Uuid,
    config: RunConfig,
    scenario: Arc<Scenario>,
    aggregator: Arc<MetricsAggregator>,
    drain_tx: Arc<watch::Sender<bool>>,
    phase: Arc<Mutex<RunPhase>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    termination_rx: Mutex<Option<watch::Receiver<Option<RunTermination>>>>,
    result: OnceCell<RunResult>,
}

impl RunController {
    /// Validate the configuration and prepare a run. No traffic is sent.
    pub fn configure(config: RunConfig, scenario: Scenario) -> EngineResult<Self> {
        config.validate()?;

        let (drain_tx, _) = watch::channel(false);
        let aggregator = Arc::new(MetricsAggregator::new(scenario.penalize_gated()));
        let run_id = Uuid::new_v4();

        tracing::info!(
            %run_id,
            base_url = scenario.base_url(),
            stages = config.profile.stages().len(),
            peak_vus = config.profile.peak_target(),
            duration = %loadgate_core::duration::format(config.profile.total_duration()),
            health_gate = scenario.health_enabled(),
            "Run configured"
        );

        Ok(Self {
            run_id,
            config,
            scenario: Arc::new(scenario),
            aggregator,
            drain_tx: Arc::new(drain_tx),
            phase: Arc::new(Mutex::new(RunPhase::Configured)),
            started_at: Mutex::new(None),
            termination_rx: Mutex::new(None),
            result: OnceCell::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    /// Live copy of the metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.aggregator.snapshot()
    }

    /// Start the scheduler and the runner pool. Must be called within a tokio runtime.
    pub fn start(&self) -> EngineResult<()> {
        {
            let mut phase = self.phase.lock();
            if *phase != RunPhase::Configured {
                return Err(EngineError::InvalidState(format!(
                    "cannot start a run in phase {:?}",
                    *phase
                )));
            }
            self.config.validate()?;
            *phase = RunPhase::Running;
        }

        *self.started_at.lock() = Some(Utc::now());

        let (termination_tx, termination_rx) = watch::channel(None);
        *self.termination_rx.lock() = Some(termination_rx);

        let supervisor = Supervisor {
            config: self.config.clone(),
            scenario: Arc::clone(&self.scenario),
            aggregator: Arc::clone(&self.aggregator),
            drain_tx: Arc::clone(&self.drain_tx),
            phase: Arc::clone(&self.phase),
            in_flight: Arc::new(AtomicU32::new(0)),
        };

        tracing::info!(run_id = %self.run_id, "Run started");
        tokio::spawn(async move {
            let termination = supervisor.supervise().await;
            termination_tx.send_replace(Some(termination));
        });

        Ok(())
    }

    /// Stop starting new iterations and wind the run down. Idempotent.
    pub fn drain(&self) {
        let already = self.drain_tx.send_replace(true);
        if !already {
            let mut phase = self.phase.lock();
            if *phase == RunPhase::Running {
                *phase = RunPhase::Draining;
            }
            tracing::info!(run_id = %self.run_id, "Drain requested");
        }
    }

    /// Wait for the run to end and produce its verdict.
    ///
    /// The first call evaluates the frozen metrics; every later call returns
    /// the same result.
    pub async fn finalize(&self) -> RunResult {
        self.result.get_or_init(|| self.conclude()).await.clone()
    }

    /// `start` then `finalize`.
    pub async fn run(&self) -> EngineResult<RunResult> {
        self.start()?;
        Ok(self.finalize().await)
    }

    async fn conclude(&self) -> RunResult {
        let receiver = self.termination_rx.lock().clone();

        let termination = match receiver {
            None => RunTermination::NotStarted,
            Some(mut rx) => wait_for_termination(&mut rx).await,
        };

        let snapshot = self.aggregator.finalize();

        let verdict = match &termination {
            RunTermination::Aborted(reason) => Verdict::aborted(reason.clone()),
            RunTermination::ThresholdAbort(trigger) => {
                let verdict = evaluator::evaluate(&snapshot, &self.config.thresholds);
                if verdict.failures.iter().any(|f| f.description == trigger.description) {
                    verdict
                } else {
                    let mut failures = verdict.failures;
                    failures.push(trigger.clone());
                    Verdict::evaluated(verdict.empty_run, failures)
                }
            }
            _ => evaluator::evaluate(&snapshot, &self.config.thresholds),
        };

        *self.phase.lock() = RunPhase::Finalized;

        tracing::info!(
            run_id = %self.run_id,
            status = ?verdict.status,
            total_requests = snapshot.total_requests,
            failure_rate = snapshot.failure_rate(),
            p95_ms = snapshot.p95().as_secs_f64() * 1000.0,
            "Run finalized"
        );

        RunResult {
            run_id: self.run_id,
            started_at: *self.started_at.lock(),
            finished_at: Utc::now(),
            verdict,
            snapshot,
            termination,
            stages: self.config.profile.stages().to_vec(),
        }
    }
}

/// Task that owns the scheduler and the runner pool for one run.
struct Supervisor {
    config: RunConfig,
    scenario: Arc<Scenario>,
    aggregator: Arc<MetricsAggregator>,
    drain_tx: Arc<watch::Sender<bool>>,
    phase: Arc<Mutex<RunPhase>>,
    in_flight: Arc<AtomicU32>,
}

enum StopReason {
    /// The target channel closed; the scheduler's exit says why.
    SchedulerEnded,
    DrainRequested,
    ThresholdAbort(ThresholdFailure),
    SetupFailed(EngineError),
}

impl Supervisor {
    async fn supervise(self) -> RunTermination {
        let start = Instant::now();
        self.aggregator.start(start);

        let scheduler = StageScheduler::new(self.config.profile.clone(), self.config.scheduler_tick);
        let (target_tx, mut target_rx) = scheduler.channel();
        let mut drain_rx = self.drain_tx.subscribe();
        let scheduler_task = {
            let stop = self.drain_tx.subscribe();
            tokio::spawn(async move { scheduler.run(start, target_tx, stop).await })
        };

        let shared = RunnerShared {
            aggregator: Arc::clone(&self.aggregator),
            in_flight: Arc::clone(&self.in_flight),
            think_time: self.config.think_time,
        };

        let mut runners: Vec<JoinHandle<RunnerSummary>> = Vec::new();
        let mut threshold_checks = self
            .config
            .threshold_check_interval
            .map(|period| ticker(start + period, period));
        let mut progress = ticker(start + PROGRESS_INTERVAL, PROGRESS_INTERVAL);

        let reason = loop {
            if *drain_rx.borrow_and_update() {
                break StopReason::DrainRequested;
            }

            // Spawn runners lazily; retired ones park themselves.
            let target = *target_rx.borrow_and_update();
            if let Err(err) = self.grow_pool(&mut runners, target, &shared, &target_rx) {
                break StopReason::SetupFailed(err);
            }

            tokio::select! {
                biased;
                _ = drain_rx.changed() => {}
                changed = target_rx.changed() => {
                    if changed.is_err() {
                        break StopReason::SchedulerEnded;
                    }
                }
                _ = next_tick(&mut threshold_checks) => {
                    if let Some(failure) = self.check_thresholds() {
                        break StopReason::ThresholdAbort(failure);
                    }
                }
                _ = progress.tick() => self.log_progress(start, target),
            }
        };

        self.drain_tx.send_replace(true);
        {
            let mut phase = self.phase.lock();
            if *phase == RunPhase::Running {
                *phase = RunPhase::Draining;
            }
        }

        let scheduler_exit = match scheduler_task.await {
            Ok(exit) => exit,
            Err(err) => {
                tracing::warn!(error = %err, "Stage scheduler task failed");
                SchedulerExit::Stopped
            }
        };

        if let StopReason::SetupFailed(err) = &reason {
            tracing::error!(error = %err, "Runner setup failed, aborting run");
            stop_runners(&mut runners).await;
            return RunTermination::Aborted(err.to_string());
        }

        self.ramp_down(&mut runners).await;
        TARGET_VUS.set(0);

        match reason {
            StopReason::SchedulerEnded => match scheduler_exit {
                SchedulerExit::Completed => RunTermination::Completed,
                SchedulerExit::Stopped => RunTermination::Drained,
            },
            StopReason::DrainRequested => RunTermination::Drained,
            StopReason::ThresholdAbort(failure) => RunTermination::ThresholdAbort(failure),
            StopReason::SetupFailed(err) => RunTermination::Aborted(err.to_string()),
        }
    }

    fn grow_pool(
        &self,
        runners: &mut Vec<JoinHandle<RunnerSummary>>,
        target: u32,
        shared: &RunnerShared,
        target_rx: &watch::Receiver<u32>,
    ) -> EngineResult<()> {
        while (runners.len() as u32) < target {
            let index = runners.len() as u32;
            let binding = self.scenario.bind(index, &self.config)?;
            let runner = VirtualUser::new(
                index,
                binding,
                shared.clone(),
                RunnerSignals {
                    target: target_rx.clone(),
                    drain: self.drain_tx.subscribe(),
                },
            );
            tracing::debug!(runner = index, "Spawning virtual user");
            runners.push(tokio::spawn(runner.run()));
        }
        Ok(())
    }

    /// Give in-flight iterations `graceful_ramp_down` to finish, then force-stop.
    async fn ramp_down(&self, runners: &mut [JoinHandle<RunnerSummary>]) {
        let grace = self.config.graceful_ramp_down;
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            tracing::info!(
                in_flight,
                grace = %loadgate_core::duration::format(grace),
                "Waiting for in-flight iterations"
            );
        }

        let joined = tokio::time::timeout(grace, futures::future::join_all(runners.iter_mut())).await;

        match joined {
            Ok(results) => {
                let iterations: u64 = results
                    .into_iter()
                    .filter_map(Result::ok)
                    .map(|summary| summary.iterations)
                    .sum();
                tracing::debug!(runners = runners.len(), iterations, "All runners stopped");
            }
            Err(_) => {
                let still_running = self.in_flight.load(Ordering::SeqCst);
                tracing::warn!(
                    interrupted = still_running,
                    "Graceful ramp-down elapsed, force-stopping runners"
                );
                stop_runners(runners).await;
            }
        }
    }

    fn check_thresholds(&self) -> Option<ThresholdFailure> {
        let snapshot = self.aggregator.snapshot();
        let verdict = evaluator::evaluate(&snapshot, &self.config.thresholds);
        tracing::info!(
            failing = verdict.failures.len(),
            thresholds = self.config.thresholds.len(),
            total_requests = snapshot.total_requests,
            "Periodic threshold check"
        );

        let failure = evaluator::first_abort(&snapshot, &self.config.thresholds)?;
        tracing::warn!(
            metric = %failure.metric,
            observed = failure.observed,
            required = %failure.required,
            "Threshold marked abort_on_fail failed, draining early"
        );
        Some(failure)
    }

    fn log_progress(&self, start: Instant, target: u32) {
        let snapshot = self.aggregator.snapshot();
        tracing::info!(
            elapsed_s = start.elapsed().as_secs(),
            target_vus = target,
            active_vus = self.in_flight.load(Ordering::SeqCst),
            requests = snapshot.total_requests,
            failure_rate = snapshot.failure_rate(),
            p95_ms = snapshot.p95().as_secs_f64() * 1000.0,
            "Progress"
        );
    }
}

async fn wait_for_termination(rx: &mut watch::Receiver<Option<RunTermination>>) -> RunTermination {
    let published = rx.wait_for(Option::is_some).await.map(|value| value.clone());
    match published {
        Ok(Some(termination)) => termination,
        Ok(None) => RunTermination::NotStarted,
        Err(_) => RunTermination::Aborted("run supervisor exited unexpectedly".to_string()),
    }
}

/// Abort every runner and wait until each task has actually been dropped.
async fn stop_runners(runners: &mut [JoinHandle<RunnerSummary>]) {
    for handle in runners.iter() {
        handle.abort();
    }
    for handle in runners.iter_mut() {
        // Finished handles may already have been polled to completion.
        if !handle.is_finished() {
            let _ = handle.await;
        }
    }
    ACTIVE_VUS.set(0);
}

fn ticker(first: Instant, period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

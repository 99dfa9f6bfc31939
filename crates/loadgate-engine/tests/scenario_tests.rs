//! End-to-end runs against the mock transport on a paused clock.

use loadgate_core::{
    HealthConfig, OutcomeKind, RampStage, RunPlan, ThresholdSpec, VerdictStatus,
};
use loadgate_engine::{
    MockReply, MockTransport, RunController, RunPhase, RunResult, RunTermination, Scenario,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn plan(stages: Vec<RampStage>) -> RunPlan {
    let mut plan = RunPlan::default();
    plan.target.base_url = "http://mock.local".to_string();
    plan.stages = stages;
    plan
}

fn healthy_predict(mock: MockTransport) -> MockTransport {
    mock.fixed(
        "/predict",
        Duration::from_millis(50),
        MockReply::json(200, json!({ "prediction": 41200.5 })),
    )
}

fn controller(plan: &RunPlan, mock: &MockTransport) -> RunController {
    let scenario = Scenario::from_plan(plan, Arc::new(mock.clone())).expect("scenario");
    RunController::configure(plan.run_config().expect("run config"), scenario).expect("configure")
}

async fn run(plan: &RunPlan, mock: &MockTransport) -> RunResult {
    controller(plan, mock).run().await.expect("run")
}

#[tokio::test(start_paused = true)]
async fn test_healthy_target_passes_default_thresholds() {
    let mock = healthy_predict(MockTransport::new());
    let plan = plan(vec![
        RampStage::new(secs(10), 5),
        RampStage::new(secs(60), 30),
        RampStage::new(secs(10), 0),
    ]);

    let result = run(&plan, &mock).await;

    assert_eq!(result.termination, RunTermination::Completed);
    assert_eq!(result.verdict.status, VerdictStatus::Passed, "{:?}", result.verdict);
    assert_eq!(result.verdict.exit_code(), 0);
    assert!(result.snapshot.total_requests > 0);
    assert_eq!(result.snapshot.failed_requests, 0);
    assert_eq!(result.snapshot.total_requests as usize, mock.calls_to("/predict"));
    assert!(result.snapshot.p95() >= Duration::from_millis(50));
    assert!(result.snapshot.p95() < Duration::from_millis(800));
    assert_eq!(result.snapshot.check_pass_rate("status is 200"), Some(1.0));
    assert_eq!(result.snapshot.check_pass_rate("has prediction"), Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_fail_on_failure_rate() {
    let mock = MockTransport::new().fixed(
        "/predict",
        Duration::from_millis(5),
        MockReply::json(500, json!({ "error": "model not loaded" })),
    );
    let plan = plan(vec![RampStage::new(secs(5), 3), RampStage::new(secs(5), 0)]);

    let result = run(&plan, &mock).await;

    assert_eq!(result.verdict.status, VerdictStatus::Failed);
    assert_eq!(result.verdict.exit_code(), 1);
    assert!(result.verdict.failures.iter().any(|f| f.metric == "failure_rate"));
    assert_eq!(result.snapshot.failure_rate(), 1.0);
    assert_eq!(
        result.snapshot.count(OutcomeKind::HttpFailure),
        result.snapshot.total_requests
    );
    assert_eq!(result.snapshot.status_codes.get(&500).copied(), Some(result.snapshot.total_requests));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_gate_never_probes() {
    let mock = healthy_predict(MockTransport::new()).fixed(
        "/health",
        Duration::from_millis(1),
        MockReply::status(503),
    );
    let mut plan = plan(vec![RampStage::new(secs(5), 2), RampStage::new(secs(5), 0)]);
    plan.health = HealthConfig {
        path: Some("/health".to_string()),
        enabled: Some(false),
        ..HealthConfig::default()
    };

    let result = run(&plan, &mock).await;

    assert_eq!(mock.calls_to("/health"), 0);
    assert!(mock.calls_to("/predict") > 0);
    assert_eq!(result.snapshot.health_gated, 0);
    assert!(result.verdict.passed);
}

#[tokio::test(start_paused = true)]
async fn test_failing_gate_suppresses_main_request() {
    let mock = healthy_predict(MockTransport::new()).fixed(
        "/health",
        Duration::from_millis(1),
        MockReply::json(503, json!({ "status": "loading" })),
    );
    let mut plan = plan(vec![RampStage::new(secs(5), 2), RampStage::new(secs(5), 0)]);
    plan.health.path = Some("/health".to_string());

    let result = run(&plan, &mock).await;

    assert_eq!(mock.calls_to("/predict"), 0);
    assert!(mock.calls_to("/health") > 0);
    assert!(result.snapshot.health_gated > 0);
    assert_eq!(result.snapshot.total_requests, 0);

    // Nothing reached the target: an empty run never passes, but it is not an abort.
    assert_eq!(result.verdict.status, VerdictStatus::Failed);
    assert!(result.verdict.empty_run);
}

#[tokio::test(start_paused = true)]
async fn test_gate_recovers_when_probe_turns_healthy() {
    let mock = healthy_predict(MockTransport::new()).route(
        "/health",
        Duration::from_millis(1),
        |_, call| {
            if call < 3 {
                MockReply::status(503)
            } else {
                MockReply::json(200, json!({ "status": "ok" }))
            }
        },
    );
    let mut plan = plan(vec![
        RampStage::new(secs(1), 1),
        RampStage::new(secs(10), 1),
        RampStage::new(secs(1), 0),
    ]);
    plan.health.path = Some("/health".to_string());

    let result = run(&plan, &mock).await;

    assert_eq!(result.snapshot.health_gated, 3);
    assert!(result.snapshot.total_requests > 0);
    assert_eq!(result.snapshot.total_requests as usize, mock.calls_to("/predict"));
    assert!(result.verdict.passed, "{:?}", result.verdict);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_peak_target() {
    let mock = healthy_predict(MockTransport::new());
    let mut plan = plan(vec![
        RampStage::new(secs(5), 8),
        RampStage::new(secs(10), 8),
        RampStage::new(secs(5), 0),
    ]);
    plan.think_time = Duration::ZERO;

    let result = run(&plan, &mock).await;

    assert!(mock.max_in_flight() <= 8, "in flight {}", mock.max_in_flight());
    assert!(result.snapshot.peak_concurrency <= 8);
    assert!(result.snapshot.peak_concurrency >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_base_url_aborts() {
    let mock = healthy_predict(MockTransport::new());
    let mut plan = plan(vec![RampStage::new(secs(5), 2)]);
    plan.target.base_url = "http//no-scheme".to_string();

    let result = run(&plan, &mock).await;

    assert!(matches!(result.termination, RunTermination::Aborted(_)));
    assert_eq!(result.verdict.status, VerdictStatus::Aborted);
    assert_eq!(result.verdict.exit_code(), 2);
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_on_fail_ends_run_early() {
    let mock = MockTransport::new().fixed(
        "/predict",
        Duration::from_millis(5),
        MockReply::status(502),
    );
    let mut plan = plan(vec![RampStage::new(secs(1), 4), RampStage::new(secs(120), 4)]);
    plan.threshold_check_interval = Some(secs(1));
    plan.thresholds = vec![ThresholdSpec::Detailed {
        expression: "failure_rate < 0.05".to_string(),
        abort_on_fail: true,
    }];

    let result = run(&plan, &mock).await;

    match &result.termination {
        RunTermination::ThresholdAbort(failure) => assert_eq!(failure.metric, "failure_rate"),
        other => panic!("expected threshold abort, got {:?}", other),
    }
    assert_eq!(result.verdict.status, VerdictStatus::Failed);
    assert!(result.snapshot.elapsed < secs(10), "ran for {:?}", result.snapshot.elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_ramp_down_force_stops_slow_iterations() {
    let mock = MockTransport::new().fixed(
        "/predict",
        secs(30),
        MockReply::json(200, json!({ "prediction": 1.0 })),
    );
    let mut plan = plan(vec![RampStage::new(secs(2), 3)]);
    plan.graceful_ramp_down = secs(1);

    let result = run(&plan, &mock).await;

    assert_eq!(result.termination, RunTermination::Completed);
    assert_eq!(result.snapshot.total_requests, 0);
    assert!(result.snapshot.interrupted_iterations >= 1);
    assert!(result.snapshot.interrupted_iterations <= 3);
    assert!(result.snapshot.elapsed < secs(30));
    assert!(!result.verdict.passed);
}

#[tokio::test(start_paused = true)]
async fn test_drain_keeps_in_flight_results() {
    let mock = healthy_predict(MockTransport::new());
    let plan = plan(vec![RampStage::new(secs(1), 4), RampStage::new(secs(300), 4)]);
    let controller = Arc::new(controller(&plan, &mock));

    controller.start().unwrap();
    tokio::time::sleep(secs(5)).await;
    controller.drain();
    assert_eq!(controller.phase(), RunPhase::Draining);

    let result = controller.finalize().await;
    assert_eq!(result.termination, RunTermination::Drained);
    assert_eq!(controller.phase(), RunPhase::Finalized);
    assert_eq!(result.snapshot.interrupted_iterations, 0);
    assert_eq!(result.snapshot.total_requests as usize, mock.calls_to("/predict"));
    assert!(result.snapshot.elapsed < secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_finalize_is_idempotent() {
    let mock = healthy_predict(MockTransport::new());
    let plan = plan(vec![RampStage::new(secs(3), 2), RampStage::new(secs(2), 0)]);
    let controller = controller(&plan, &mock);

    controller.start().unwrap();
    let first = controller.finalize().await;
    tokio::time::sleep(secs(10)).await;
    let second = controller.finalize().await;

    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.snapshot.total_requests, second.snapshot.total_requests);
    assert_eq!(first.snapshot.elapsed, second.snapshot.elapsed);
    assert_eq!(first.finished_at, second.finished_at);
}

#[tokio::test(start_paused = true)]
async fn test_body_template_renders_per_iteration() {
    let mock = healthy_predict(MockTransport::new());
    let mut plan = plan(vec![RampStage::new(secs(1), 1), RampStage::new(secs(3), 1)]);
    plan.target.body = Some(r#"{"vu": {{vu}}, "iteration": {{iteration}}}"#.to_string());

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let mock = mock.route("/predict", Duration::from_millis(10), move |request, _| {
        let body: serde_json::Value =
            serde_json::from_slice(request.body.as_deref().unwrap_or_default()).unwrap();
        recorder.lock().push(body);
        MockReply::json(200, json!({ "prediction": 1.0 }))
    });

    let result = run(&plan, &mock).await;

    let bodies = seen.lock().clone();
    assert!(!bodies.is_empty());
    assert_eq!(bodies.len() as u64, result.snapshot.total_requests);
    for (i, body) in bodies.iter().enumerate() {
        assert_eq!(body["vu"], 0);
        assert_eq!(body["iteration"], i as u64);
    }
}

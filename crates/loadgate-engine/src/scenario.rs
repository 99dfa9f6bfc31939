//! Scenario: what one iteration of a virtual user does.

use crate::checks::CheckSet;
use crate::error::{EngineError, EngineResult};
use crate::executor::{BodyFn, RequestBody, RequestExecutor, RequestTemplate};
use crate::health::HealthGate;
use crate::transport::{PreparedRequest, Transport, TransportResponse};
use crate::url;
use bytes::Bytes;
use loadgate_core::config::DEFAULT_PROBE_TIMEOUT;
use loadgate_core::{HealthConfig, RunConfig, RunPlan, TargetConfig};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Per-runner request machinery.
pub struct RunnerBinding {
    pub executor: RequestExecutor,
    pub gate: Option<HealthGate>,
}

/// Target, probe and checks of a run, plus the transport they share.
pub struct Scenario {
    target: TargetConfig,
    method: Method,
    health: HealthConfig,
    health_method: Method,
    checks: CheckSet,
    body_builder: Option<BodyFn>,
    transport: Arc<dyn Transport>,
    last_healthy: Arc<AtomicBool>,
}

impl Scenario {
    /// Build from a validated plan.
    ///
    /// Method and header syntax are checked here; URLs are resolved per runner
    /// in [`Scenario::bind`].
    pub fn from_plan(plan: &RunPlan, transport: Arc<dyn Transport>) -> EngineResult<Self> {
        let method = parse_method(&plan.target.method, "target.method")?;
        let health_method = parse_method(
            plan.health.method.as_deref().unwrap_or("GET"),
            "health.method",
        )?;

        for (name, value) in &plan.target.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| EngineError::config(format!("invalid header name `{}`", name)))?;
            HeaderValue::from_str(value).map_err(|_| {
                EngineError::config(format!("invalid value for header `{}`", name))
            })?;
        }

        if plan.target.acceptable_statuses.is_empty() {
            return Err(EngineError::config(
                "target.acceptable_statuses must list at least one status",
            ));
        }

        Ok(Self {
            target: plan.target.clone(),
            method,
            health: plan.health.clone(),
            health_method,
            checks: CheckSet::new(plan.checks.clone()),
            body_builder: None,
            transport,
            last_healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Replace the configured body template with a function of `(vu, iteration)`.
    pub fn with_body_builder<F>(mut self, build: F) -> Self
    where
        F: Fn(u32, u64) -> Bytes + Send + Sync + 'static,
    {
        self.body_builder = Some(Arc::new(build));
        self
    }

    /// Register a named response predicate next to the configured checks.
    pub fn with_check<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&TransportResponse, Option<&Value>) -> bool + Send + Sync + 'static,
    {
        self.checks = self.checks.with_custom(name, check);
        self
    }

    pub fn health_enabled(&self) -> bool {
        self.health.is_enabled()
    }

    /// Whether gated iterations count as failed requests.
    pub fn penalize_gated(&self) -> bool {
        self.health.penalize
    }

    pub fn base_url(&self) -> &str {
        &self.target.base_url
    }

    /// Prepare the executor (and gate) for runner `runner`.
    ///
    /// Fails with [`EngineError::Setup`] when a URL cannot be resolved.
    pub fn bind(&self, runner: u32, config: &RunConfig) -> EngineResult<RunnerBinding> {
        let target_url = url::resolve(&self.target.base_url, &self.target.path)
            .map_err(|message| EngineError::setup(runner, message))?;

        let template = RequestTemplate {
            method: self.method.clone(),
            url: target_url,
            headers: self.target.headers.clone(),
            body: match &self.body_builder {
                Some(build) => RequestBody::Builder(Arc::clone(build)),
                None => RequestBody::from(self.target.body.clone()),
            },
        };

        let executor = RequestExecutor::new(
            Arc::clone(&self.transport),
            template,
            self.target.acceptable_statuses.iter().copied(),
            self.checks.clone(),
            config.request_timeout,
        );

        let gate = match (&self.health.path, self.health.is_enabled()) {
            (Some(path), true) => {
                let probe_url = url::resolve(&self.target.base_url, path)
                    .map_err(|message| EngineError::setup(runner, message))?;
                let timeout = self
                    .health
                    .timeout
                    .unwrap_or_else(|| DEFAULT_PROBE_TIMEOUT.min(config.request_timeout));

                Some(HealthGate::new(
                    Arc::clone(&self.transport),
                    PreparedRequest::new(self.health_method.clone(), probe_url, timeout),
                    self.health.expected_status.unwrap_or(200),
                    self.health.body_field_equals.clone(),
                    self.health.backoff.unwrap_or(config.think_time),
                    Arc::clone(&self.last_healthy),
                ))
            }
            _ => None,
        };

        Ok(RunnerBinding { executor, gate })
    }
}

fn parse_method(method: &str, key: &str) -> EngineResult<Method> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| EngineError::config(format!("{} `{}` is not an HTTP method", key, method)))
}

//! Run configuration
//!
//! A [`RunPlan`] is the file/environment schema. It is loaded from several
//! layered sources and then validated into a [`RunConfig`] (timing and gates)
//! plus the target, health and check sections the engine turns into a
//! scenario.
//!
//! Precedence, lowest to highest:
//! 1. Built-in defaults (the prediction-service smoke profile)
//! 2. `./loadgate.{toml,yaml,json}` in the working directory
//! 3. The file named by `LOADGATE_CONFIG` or passed explicitly
//! 4. Environment variables, e.g. `LOADGATE__TARGET__BASE_URL=http://svc:8000`

use crate::error::{CoreError, CoreResult};
use crate::stage::{RampProfile, RampStage};
use crate::threshold::{Threshold, ThresholdSpec};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Largest accepted scheduler tick; bounds how far live concurrency lags the ramp.
pub const MAX_SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Default probe timeout ceiling.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Body sent by the default profile: one row of EV features.
pub const DEFAULT_BODY: &str = r#"{"Acceleration":5.0,"TopSpeed_KmH":180,"Range_Km":420,"Battery_kWh":75,"Efficiency_WhKm":170,"FastCharge_kW":150,"Seats":5,"PriceEuro":45000,"PowerTrain":"AWD"}"#;

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default = "default_checks")]
    pub checks: Vec<CheckSpec>,

    #[serde(default = "default_stages")]
    pub stages: Vec<RampStage>,

    #[serde(with = "crate::duration", default = "default_graceful_ramp_down")]
    pub graceful_ramp_down: Duration,

    #[serde(with = "crate::duration", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Pause between iterations of one virtual user.
    #[serde(with = "crate::duration", default = "default_think_time")]
    pub think_time: Duration,

    #[serde(with = "crate::duration", default = "default_scheduler_tick")]
    pub scheduler_tick: Duration,

    /// Evaluate thresholds periodically while the run is live.
    #[serde(with = "crate::duration::option", default)]
    pub threshold_check_interval: Option<Duration>,

    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<ThresholdSpec>,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            health: HealthConfig::default(),
            checks: default_checks(),
            stages: default_stages(),
            graceful_ramp_down: default_graceful_ramp_down(),
            request_timeout: default_request_timeout(),
            think_time: default_think_time(),
            scheduler_tick: default_scheduler_tick(),
            threshold_check_interval: None,
            thresholds: default_thresholds(),
        }
    }
}

impl RunPlan {
    /// Load from defaults, the working-directory file, `LOADGATE_CONFIG` or
    /// `path`, and `LOADGATE__*` environment variables, then validate.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let plan = Self::layered(path)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Same layering as [`RunPlan::load`] without validation, so that callers
    /// can apply their own overrides first.
    pub fn layered(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&RunPlan::default())?)
            .add_source(File::with_name("./loadgate").required(false));

        if let Ok(config_path) = std::env::var("LOADGATE_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Example: LOADGATE__HEALTH__PATH=/health
        builder = builder.add_source(
            Environment::with_prefix("LOADGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load a single file on top of the defaults, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let plan: RunPlan = Config::builder()
            .add_source(Config::try_from(&RunPlan::default())?)
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        plan.validate()?;
        Ok(plan)
    }

    /// Validate everything that can be checked without a network.
    pub fn validate(&self) -> CoreResult<()> {
        if self.target.base_url.trim().is_empty() {
            return Err(CoreError::config("target.base_url is required"));
        }

        if self.target.acceptable_statuses.is_empty() {
            return Err(CoreError::config(
                "target.acceptable_statuses must list at least one status",
            ));
        }

        if let Some(path) = &self.health.path {
            if path.trim().is_empty() {
                return Err(CoreError::config("health.path must not be empty when set"));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for check in &self.checks {
            if check.name().trim().is_empty() {
                return Err(CoreError::config("checks[].name must not be empty"));
            }
            if !seen.insert(check.name()) {
                return Err(CoreError::config(format!(
                    "duplicate check name `{}`",
                    check.name()
                )));
            }
        }

        self.run_config().map(|_| ())
    }

    /// Timing and gating half of the plan.
    pub fn run_config(&self) -> CoreResult<RunConfig> {
        let thresholds = self
            .thresholds
            .iter()
            .map(ThresholdSpec::to_threshold)
            .collect::<CoreResult<Vec<_>>>()?;

        let config = RunConfig {
            profile: RampProfile::new(self.stages.clone())?,
            graceful_ramp_down: self.graceful_ramp_down,
            request_timeout: self.request_timeout,
            think_time: self.think_time,
            scheduler_tick: self.scheduler_tick,
            thresholds,
            threshold_check_interval: self.threshold_check_interval,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validated timing and gating configuration owned by the run controller.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub profile: RampProfile,
    pub graceful_ramp_down: Duration,
    pub request_timeout: Duration,
    pub think_time: Duration,
    pub scheduler_tick: Duration,
    pub thresholds: Vec<Threshold>,
    pub threshold_check_interval: Option<Duration>,
}

impl RunConfig {
    /// Build with default timings around a stage list.
    pub fn new(stages: Vec<RampStage>) -> CoreResult<Self> {
        let config = Self {
            profile: RampProfile::new(stages)?,
            graceful_ramp_down: default_graceful_ramp_down(),
            request_timeout: default_request_timeout(),
            think_time: default_think_time(),
            scheduler_tick: default_scheduler_tick(),
            thresholds: Vec::new(),
            threshold_check_interval: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_thresholds(mut self, thresholds: Vec<Threshold>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_graceful_ramp_down(mut self, grace: Duration) -> Self {
        self.graceful_ramp_down = grace;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn with_threshold_check_interval(mut self, interval: Duration) -> Self {
        self.threshold_check_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.request_timeout.is_zero() {
            return Err(CoreError::config("request_timeout must be > 0"));
        }

        if self.scheduler_tick.is_zero() || self.scheduler_tick > MAX_SCHEDULER_TICK {
            return Err(CoreError::config(format!(
                "scheduler_tick must be in (0, {}]",
                crate::duration::format(MAX_SCHEDULER_TICK)
            )));
        }

        if let Some(interval) = self.threshold_check_interval {
            if interval.is_zero() {
                return Err(CoreError::config("threshold_check_interval must be > 0"));
            }
        }

        Ok(())
    }
}

/// The endpoint under load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,

    /// Body template; `{{vu}}` and `{{iteration}}` are substituted per request.
    #[serde(default = "default_body")]
    pub body: Option<String>,

    #[serde(default = "default_acceptable_statuses")]
    pub acceptable_statuses: Vec<u16>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            path: default_path(),
            method: default_method(),
            headers: default_headers(),
            body: default_body(),
            acceptable_statuses: default_acceptable_statuses(),
        }
    }
}

/// Liveness probe gating each iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe path; setting it enables the gate unless `enabled` says otherwise.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub expected_status: Option<u16>,

    /// Require a JSON body field to equal a value, e.g. `status == "ok"`.
    #[serde(default)]
    pub body_field_equals: Option<FieldEquals>,

    #[serde(with = "crate::duration::option", default)]
    pub timeout: Option<Duration>,

    /// Sleep after a failed probe before the next iteration.
    #[serde(with = "crate::duration::option", default)]
    pub backoff: Option<Duration>,

    /// Count gated iterations as failed requests.
    #[serde(default)]
    pub penalize: bool,
}

impl HealthConfig {
    /// The gate runs when a path is configured, unless explicitly disabled.
    pub fn is_enabled(&self) -> bool {
        self.path.is_some() && self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEquals {
    pub field: String,
    pub value: serde_json::Value,
}

/// Named boolean check over a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckSpec {
    StatusEquals {
        name: String,
        status: u16,
    },
    ContentTypeContains {
        name: String,
        substring: String,
    },
    /// Body is a JSON object carrying at least one of `fields`.
    BodyHasAnyField {
        name: String,
        #[serde(default = "default_prediction_fields")]
        fields: Vec<String>,
    },
    BodyFieldIsNumber {
        name: String,
        field: String,
    },
    BodyFieldEquals {
        name: String,
        field: String,
        value: serde_json::Value,
    },
}

impl CheckSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::StatusEquals { name, .. }
            | Self::ContentTypeContains { name, .. }
            | Self::BodyHasAnyField { name, .. }
            | Self::BodyFieldIsNumber { name, .. }
            | Self::BodyFieldEquals { name, .. } => name,
        }
    }

    /// Whether evaluating this check requires a JSON body.
    pub fn needs_json_body(&self) -> bool {
        matches!(
            self,
            Self::BodyHasAnyField { .. } | Self::BodyFieldIsNumber { .. } | Self::BodyFieldEquals { .. }
        )
    }
}

fn default_path() -> String {
    "/predict".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers
}

fn default_body() -> Option<String> {
    Some(DEFAULT_BODY.to_string())
}

fn default_acceptable_statuses() -> Vec<u16> {
    vec![200]
}

/// Response fields that carry a model output.
pub fn default_prediction_fields() -> Vec<String> {
    ["prediction", "predictions", "result", "outputs"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_checks() -> Vec<CheckSpec> {
    vec![
        CheckSpec::StatusEquals {
            name: "status is 200".to_string(),
            status: 200,
        },
        CheckSpec::BodyFieldIsNumber {
            name: "has prediction".to_string(),
            field: "prediction".to_string(),
        },
    ]
}

fn default_stages() -> Vec<RampStage> {
    vec![
        RampStage::new(Duration::from_secs(20), 10),
        RampStage::new(Duration::from_secs(40), 30),
        RampStage::new(Duration::from_secs(20), 0),
    ]
}

fn default_graceful_ramp_down() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_think_time() -> Duration {
    Duration::from_secs(1)
}

fn default_scheduler_tick() -> Duration {
    Duration::from_millis(250)
}

fn default_thresholds() -> Vec<ThresholdSpec> {
    vec![
        ThresholdSpec::from("failure_rate < 0.01"),
        ThresholdSpec::from("p95 < 800ms"),
    ]
}

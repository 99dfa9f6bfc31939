//! Build-gate verdict.

use serde::{Deserialize, Serialize};

/// How a run ended, from the gate's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    /// Traffic ran and every threshold held.
    Passed,
    /// Traffic ran (or was attempted) and the service missed thresholds.
    Failed,
    /// The run could not execute; thresholds were not evaluated.
    Aborted,
}

impl VerdictStatus {
    /// Process exit code consumed by CI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed => 1,
            Self::Aborted => 2,
        }
    }
}

/// One threshold that did not hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdFailure {
    pub metric: String,
    pub description: String,
    pub observed: f64,
    /// Requirement, e.g. `< 0.01`.
    pub required: String,
}

/// Final, immutable result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub passed: bool,
    /// True when nothing was sent, which can never pass.
    pub empty_run: bool,
    /// Every failing threshold, in configuration order.
    pub failures: Vec<ThresholdFailure>,
    /// Why the run could not execute; set only for `Aborted`.
    pub abort_reason: Option<String>,
}

impl Verdict {
    pub fn evaluated(empty_run: bool, failures: Vec<ThresholdFailure>) -> Self {
        let passed = !empty_run && failures.is_empty();
        Self {
            status: if passed {
                VerdictStatus::Passed
            } else {
                VerdictStatus::Failed
            },
            passed,
            empty_run,
            failures,
            abort_reason: None,
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Aborted,
            passed: false,
            empty_run: false,
            failures: Vec::new(),
            abort_reason: Some(reason.into()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.status == VerdictStatus::Aborted
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// One line per failure, or a pass/abort note.
    pub fn failure_summary(&self) -> String {
        match self.status {
            VerdictStatus::Passed => "All thresholds passed".to_string(),
            VerdictStatus::Aborted => format!(
                "Run aborted: {}",
                self.abort_reason.as_deref().unwrap_or("unknown reason")
            ),
            VerdictStatus::Failed => {
                let mut lines = Vec::new();
                if self.empty_run {
                    lines.push("No requests were completed".to_string());
                }
                lines.extend(self.failures.iter().map(|f| {
                    format!(
                        "{}: observed {:.4}, required {} ({})",
                        f.metric, f.observed, f.required, f.description
                    )
                }));
                lines.join("\n")
            }
        }
    }
}

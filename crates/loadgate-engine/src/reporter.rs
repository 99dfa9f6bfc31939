//! Report generation for finished runs

use crate::controller::{RunResult, RunTermination};
use chrono::{DateTime, Utc};
use loadgate_core::{CoreError, CoreResult, RampStage, SnapshotSummary, Verdict, VerdictStatus};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Report format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Markdown,
    Json,
}

impl FromStr for ReportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(CoreError::config(format!("unknown report format `{}`", other))),
        }
    }
}

/// Serializable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    /// `completed`, `drained`, `threshold_abort`, `aborted` or `not_started`.
    pub termination: String,
    pub verdict: Verdict,
    pub summary: SnapshotSummary,
    pub stages: Vec<RampStage>,
    pub peak_concurrency: u32,
    pub interrupted_iterations: u64,
}

impl From<&RunResult> for RunReport {
    fn from(result: &RunResult) -> Self {
        let termination = match &result.termination {
            RunTermination::Completed => "completed",
            RunTermination::Drained => "drained",
            RunTermination::ThresholdAbort(_) => "threshold_abort",
            RunTermination::Aborted(_) => "aborted",
            RunTermination::NotStarted => "not_started",
        };

        Self {
            run_id: result.run_id,
            started_at: result.started_at,
            finished_at: result.finished_at,
            termination: termination.to_string(),
            verdict: result.verdict.clone(),
            summary: result.snapshot.summary(),
            stages: result.stages.clone(),
            peak_concurrency: result.snapshot.peak_concurrency,
            interrupted_iterations: result.snapshot.interrupted_iterations,
        }
    }
}

impl RunReport {
    pub fn passes(&self) -> bool {
        self.verdict.passed
    }

    pub fn render(&self, format: ReportFormat) -> CoreResult<String> {
        match format {
            ReportFormat::Markdown => Ok(self.generate_markdown()),
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
        }
    }

    /// Write report to file
    pub fn write_report(&self, path: impl AsRef<Path>, format: ReportFormat) -> CoreResult<()> {
        let content = self.render(format)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    /// Generate Markdown report
    fn generate_markdown(&self) -> String {
        let (status_emoji, status_text) = match self.verdict.status {
            VerdictStatus::Passed => ("✅", "PASSED"),
            VerdictStatus::Failed => ("❌", "FAILED"),
            VerdictStatus::Aborted => ("⚠️", "ABORTED"),
        };
        let s = &self.summary;

        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                format!(
                    "| {} | {} | {} |",
                    i + 1,
                    loadgate_core::duration::format(stage.duration),
                    stage.target
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let checks = if s.checks.is_empty() {
            "No checks recorded".to_string()
        } else {
            let rows = s
                .checks
                .iter()
                .map(|(name, c)| {
                    format!(
                        "| {} | {} | {} | {:.2}% |",
                        name,
                        c.passes,
                        c.fails,
                        c.pass_rate * 100.0
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("| Check | Passes | Fails | Pass Rate |\n|-------|--------|-------|-----------|\n{}", rows)
        };

        let outcomes = s
            .outcomes
            .iter()
            .map(|(kind, n)| format!("- **{}**: {}", kind, n))
            .collect::<Vec<_>>()
            .join("\n");

        let thresholds = match self.verdict.status {
            VerdictStatus::Passed => "✅ **All thresholds passed**".to_string(),
            VerdictStatus::Aborted => format!(
                "⚠️ **Run aborted, thresholds not evaluated**: {}",
                self.verdict.abort_reason.as_deref().unwrap_or("unknown reason")
            ),
            VerdictStatus::Failed => {
                let mut lines = Vec::new();
                if self.verdict.empty_run {
                    lines.push("No requests were completed; an empty run never passes.".to_string());
                }
                if !self.verdict.failures.is_empty() {
                    lines.push("| Metric | Threshold | Observed | Required |".to_string());
                    lines.push("|--------|-----------|----------|----------|".to_string());
                    lines.extend(self.verdict.failures.iter().map(|f| {
                        format!(
                            "| {} | {} | {:.4} | {} |",
                            f.metric, f.description, f.observed, f.required
                        )
                    }));
                }
                format!("❌ **Failed thresholds**:\n\n{}", lines.join("\n"))
            }
        };

        format!(
            r#"# Load Run Report: {}

**Status**: {} {}

---

## Summary

- **Duration**: {:.1} seconds
- **Total Requests**: {}
- **Successful**: {}
- **Failed**: {}
- **Failure Rate**: {:.4}%
- **Health-Gated Iterations**: {}
- **Interrupted Iterations**: {}
- **Peak Concurrency**: {}
- **Throughput**: {:.1} req/s

---

## Latency

| Statistic | Latency |
|-----------|---------|
| Min | {:.2}ms |
| Mean | {:.2}ms |
| P50 | {:.2}ms |
| P90 | {:.2}ms |
| P95 | {:.2}ms |
| P99 | {:.2}ms |
| Max | {:.2}ms |

---

## Outcomes

{}

---

## Checks

{}

---

## Stages

| Stage | Duration | Target VUs |
|-------|----------|------------|
{}

---

## Thresholds

{}

---

**Report Generated**: {}
"#,
            self.run_id,
            status_emoji,
            status_text,
            s.duration_seconds,
            s.total_requests,
            s.successful_requests,
            s.failed_requests,
            s.failure_rate * 100.0,
            s.health_gated,
            self.interrupted_iterations,
            self.peak_concurrency,
            s.throughput_rps,
            s.latency_ms.min,
            s.latency_ms.mean,
            s.latency_ms.p50,
            s.latency_ms.p90,
            s.latency_ms.p95,
            s.latency_ms.p99,
            s.latency_ms.max,
            outcomes,
            checks,
            stages,
            thresholds,
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

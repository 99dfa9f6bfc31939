//! Core data model for staged load runs and their pass/fail gate.

pub mod config;
pub mod duration;
pub mod error;
pub mod metrics;
pub mod outcome;
pub mod snapshot;
pub mod stage;
pub mod threshold;
pub mod verdict;

pub use config::{CheckSpec, FieldEquals, HealthConfig, RunConfig, RunPlan, TargetConfig};
pub use error::{CoreError, CoreResult};
pub use outcome::{OutcomeKind, RequestOutcome};
pub use snapshot::{CheckCounter, MetricsSnapshot, SnapshotSummary};
pub use stage::{RampProfile, RampStage, StagePosition};
pub use threshold::{Comparison, Threshold, ThresholdMetric, ThresholdSpec};
pub use verdict::{ThresholdFailure, Verdict, VerdictStatus};

//! Ramp stages and the target-concurrency function they define.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One step of a ramp profile.
///
/// Within a stage the commanded concurrency moves linearly from the previous
/// stage's target (0 before the first stage) to this stage's `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampStage {
    /// How long the stage lasts.
    #[serde(with = "crate::duration")]
    pub duration: Duration,

    /// Concurrency reached at the end of the stage.
    pub target: u32,
}

impl RampStage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Validated, ordered ramp profile.
///
/// Insertion order is playback order. Built once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampProfile {
    stages: Vec<RampStage>,
    total: Duration,
    peak: u32,
}

/// Where the virtual clock sits within a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePosition {
    /// Inside stage `index` (0-based).
    Running { index: usize },
    /// Past the end of the last stage.
    Finished,
}

impl RampProfile {
    /// Validate and build a profile.
    ///
    /// Fails with a configuration error when there are no stages or when a
    /// stage has zero duration.
    pub fn new(stages: Vec<RampStage>) -> CoreResult<Self> {
        if stages.is_empty() {
            return Err(CoreError::config("at least one ramp stage is required"));
        }

        if let Some(index) = stages.iter().position(|s| s.duration.is_zero()) {
            return Err(CoreError::config(format!(
                "stages[{index}].duration must be > 0"
            )));
        }

        let total = stages.iter().map(|s| s.duration).sum();
        let peak = stages.iter().map(|s| s.target).max().unwrap_or(0);

        Ok(Self {
            stages,
            total,
            peak,
        })
    }

    pub fn stages(&self) -> &[RampStage] {
        &self.stages
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest target across all stages.
    pub fn peak_target(&self) -> u32 {
        self.peak
    }

    /// Which stage is playing at `elapsed`.
    pub fn position_at(&self, elapsed: Duration) -> StagePosition {
        let mut stage_start = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                return StagePosition::Running { index };
            }
            stage_start = stage_end;
        }
        StagePosition::Finished
    }

    /// Commanded concurrency at `elapsed` since run start.
    ///
    /// Linear interpolation between consecutive stage targets, rounded down.
    /// After the last stage the last target is held.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut from = 0u32;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress =
                    (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let delta = (f64::from(stage.target) - f64::from(from)) * progress;
                return (f64::from(from) + delta).floor().max(0.0) as u32;
            }
            from = stage.target;
            stage_start = stage_end;
        }

        from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_empty_profile_is_config_error() {
        let err = RampProfile::new(Vec::new()).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_zero_duration_stage_rejected() {
        let err = RampProfile::new(vec![RampStage::new(secs(10), 5), RampStage::new(secs(0), 3)])
            .unwrap_err();
        assert!(err.to_string().contains("stages[1]"));
    }

    #[test]
    fn test_ramp_interpolates_between_stages() {
        let profile = RampProfile::new(vec![
            RampStage::new(secs(10), 10),
            RampStage::new(secs(10), 30),
            RampStage::new(secs(10), 0),
        ])
        .unwrap();

        assert_eq!(profile.target_at(secs(0)), 0);
        assert_eq!(profile.target_at(secs(5)), 5); // Midpoint of 0 -> 10
        assert_eq!(profile.target_at(secs(10)), 10);
        assert_eq!(profile.target_at(secs(15)), 20); // Midpoint of 10 -> 30
        assert_eq!(profile.target_at(secs(25)), 15); // Midpoint of 30 -> 0
        assert_eq!(profile.target_at(secs(30)), 0);
        assert_eq!(profile.target_at(secs(100)), 0);
    }

    #[test]
    fn test_hold_stage_keeps_target() {
        let profile =
            RampProfile::new(vec![RampStage::new(secs(5), 8), RampStage::new(secs(20), 8)])
                .unwrap();
        assert_eq!(profile.target_at(secs(12)), 8);
        assert_eq!(profile.target_at(secs(24)), 8);
    }

    #[test]
    fn test_totals_and_positions() {
        let profile = RampProfile::new(vec![
            RampStage::new(secs(10), 5),
            RampStage::new(secs(60), 30),
            RampStage::new(secs(10), 0),
        ])
        .unwrap();

        assert_eq!(profile.total_duration(), secs(80));
        assert_eq!(profile.peak_target(), 30);
        assert_eq!(profile.position_at(secs(3)), StagePosition::Running { index: 0 });
        assert_eq!(profile.position_at(secs(10)), StagePosition::Running { index: 1 });
        assert_eq!(profile.position_at(secs(79)), StagePosition::Running { index: 2 });
        assert_eq!(profile.position_at(secs(80)), StagePosition::Finished);
    }
}

//! Stage scheduler: turns the ramp profile into a live concurrency target.

use loadgate_core::metrics::TARGET_VUS;
use loadgate_core::{RampProfile, StagePosition};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// How the scheduler loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// The last stage elapsed.
    Completed,
    /// The run was stopped before the profile finished.
    Stopped,
}

/// Publishes the commanded concurrency every tick on a watch channel.
///
/// Runner `i` is expected to execute iterations only while `i < target`.
#[derive(Debug, Clone)]
pub struct StageScheduler {
    profile: RampProfile,
    tick: Duration,
}

impl StageScheduler {
    pub fn new(profile: RampProfile, tick: Duration) -> Self {
        Self { profile, tick }
    }

    pub fn profile(&self) -> &RampProfile {
        &self.profile
    }

    /// Channel carrying the target, seeded with the value at t=0.
    pub fn channel(&self) -> (watch::Sender<u32>, watch::Receiver<u32>) {
        watch::channel(self.profile.target_at(Duration::ZERO))
    }

    /// Drive the target until the profile completes or `stop` flips to true.
    pub async fn run(
        &self,
        start: Instant,
        target_tx: watch::Sender<u32>,
        mut stop: watch::Receiver<bool>,
    ) -> SchedulerExit {
        let total = self.profile.total_duration();
        let mut current_stage = None;

        loop {
            if *stop.borrow() {
                return SchedulerExit::Stopped;
            }

            let elapsed = start.elapsed();
            let target = self.profile.target_at(elapsed);

            target_tx.send_if_modified(|current| {
                if *current != target {
                    *current = target;
                    true
                } else {
                    false
                }
            });
            TARGET_VUS.set(i64::from(target));

            match self.profile.position_at(elapsed) {
                StagePosition::Running { index } => {
                    if current_stage != Some(index) {
                        let stage = &self.profile.stages()[index];
                        tracing::info!(
                            stage = index + 1,
                            stages = self.profile.stages().len(),
                            target = stage.target,
                            duration = %loadgate_core::duration::format(stage.duration),
                            "Entering ramp stage"
                        );
                        current_stage = Some(index);
                    }
                }
                StagePosition::Finished => {
                    tracing::info!(target, "Ramp profile complete");
                    return SchedulerExit::Completed;
                }
            }

            let wait = self.tick.min(total.saturating_sub(elapsed));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return SchedulerExit::Stopped;
                    }
                }
            }
        }
    }
}

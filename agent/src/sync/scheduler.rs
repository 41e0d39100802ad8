//! Periodic trigger for full sync passes.

use super::{PassSummary, SyncCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What a scheduler tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The last pass is recent enough
    Fresh,
    /// A pass for the owner was already running
    Busy,
    Completed(PassSummary),
    Failed(String),
}

/// Runs a pass for one owner on every tick where the data is stale, and
/// whenever [`Scheduler::trigger`] is called.
pub struct Scheduler {
    coordinator: Arc<SyncCoordinator>,
    owner: String,
    interval: Duration,
    stale_after: Duration,
    nudge: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        owner: impl Into<String>,
        tick: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            coordinator,
            owner: owner.into(),
            interval: tick,
            stale_after,
            nudge: Arc::new(Notify::new()),
        }
    }

    /// Handle that forces a pass on the next loop iteration.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        self.nudge.clone()
    }

    pub fn trigger(&self) {
        self.nudge.notify_one();
    }

    /// One scheduling decision. `forced` bypasses the staleness check but
    /// never overlaps a running pass.
    pub async fn tick(&self, forced: bool) -> TickOutcome {
        if !forced {
            match self.coordinator.needs_sync(&self.owner, self.stale_after).await {
                Ok(false) => return TickOutcome::Fresh,
                Ok(true) => {}
                // unknown staleness: sync anyway
                Err(e) => tracing::warn!(owner = %self.owner, error = %e, "Staleness check failed"),
            }
        }

        match self.coordinator.try_perform_full_sync(&self.owner).await {
            None => TickOutcome::Busy,
            Some(Ok(summary)) => TickOutcome::Completed(summary),
            Some(Err(e)) => TickOutcome::Failed(e.to_string()),
        }
    }

    /// Tick until `cancel` fires. A pass in flight is finished first.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            owner = %self.owner,
            interval = ?self.interval,
            stale_after = ?self.stale_after,
            "Scheduler started"
        );

        loop {
            let forced = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => false,
                _ = self.nudge.notified() => true,
            };

            match self.tick(forced).await {
                TickOutcome::Busy => {
                    tracing::debug!(owner = %self.owner, "Skipped tick, pass in progress")
                }
                TickOutcome::Failed(error) => {
                    tracing::debug!(owner = %self.owner, %error, "Scheduled pass failed")
                }
                TickOutcome::Fresh | TickOutcome::Completed(_) => {}
            }
        }

        tracing::info!(owner = %self.owner, "Scheduler stopped");
    }
}

//! Observers for pass outcomes and degraded health.

use super::PassSummary;
use crate::now_millis;
use dashmap::DashMap;
use mise_engine::{OwnerId, Timestamp};
use serde::Serialize;
use std::sync::Arc;

/// Raised once consecutive failed passes reach the configured threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedHealth {
    pub owner_id: OwnerId,
    pub consecutive_failures: u32,
    pub last_error: String,
}

/// Receives sync events. Implementations must not block.
pub trait SyncObserver: Send + Sync {
    fn pass_completed(&self, owner: &str, summary: &PassSummary);

    fn degraded(&self, event: &DegradedHealth);
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn pass_completed(&self, owner: &str, summary: &PassSummary) {
        tracing::info!(
            owner,
            created = summary.created,
            updated = summary.updated,
            pushed = summary.pushed,
            relinked = summary.relinked,
            skipped = summary.skipped,
            tombstoned = summary.tombstoned,
            failed = summary.failed,
            purged_tombstones = summary.purged_tombstones,
            "Sync pass completed"
        );
    }

    fn degraded(&self, event: &DegradedHealth) {
        tracing::error!(
            owner = %event.owner_id,
            consecutive_failures = event.consecutive_failures,
            last_error = %event.last_error,
            "Sync health degraded"
        );
    }
}

/// Health of one owner's sync as seen by the HTTP surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerHealth {
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_summary: Option<PassSummary>,
    pub last_pass_at: Option<Timestamp>,
}

/// Shared snapshot of sync health, updated from observer events.
#[derive(Debug, Default)]
pub struct HealthState {
    owners: DashMap<OwnerId, OwnerHealth>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current health for an owner; healthy if nothing was reported yet.
    pub fn get(&self, owner: &str) -> OwnerHealth {
        self.owners
            .get(owner)
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

impl SyncObserver for HealthState {
    fn pass_completed(&self, owner: &str, summary: &PassSummary) {
        let mut health = self.owners.entry(owner.to_string()).or_default();
        health.degraded = false;
        health.consecutive_failures = 0;
        health.last_error = None;
        health.last_summary = Some(summary.clone());
        health.last_pass_at = Some(now_millis());
    }

    fn degraded(&self, event: &DegradedHealth) {
        let mut health = self.owners.entry(event.owner_id.clone()).or_default();
        health.degraded = true;
        health.consecutive_failures = event.consecutive_failures;
        health.last_error = Some(event.last_error.clone());
    }
}

/// Forwards events to several observers in order.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn SyncObserver>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl SyncObserver for FanoutObserver {
    fn pass_completed(&self, owner: &str, summary: &PassSummary) {
        for observer in &self.observers {
            observer.pass_completed(owner, summary);
        }
    }

    fn degraded(&self, event: &DegradedHealth) {
        for observer in &self.observers {
            observer.degraded(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_then_recovered() {
        let health = HealthState::new();
        assert!(!health.get("alice").degraded);

        health.degraded(&DegradedHealth {
            owner_id: "alice".into(),
            consecutive_failures: 3,
            last_error: "offline".into(),
        });
        let snapshot = health.get("alice");
        assert!(snapshot.degraded);
        assert_eq!(snapshot.consecutive_failures, 3);
        assert!(!health.get("bob").degraded);

        let summary = PassSummary {
            pushed: 2,
            ..Default::default()
        };
        health.pass_completed("alice", &summary);
        let snapshot = health.get("alice");
        assert!(!snapshot.degraded);
        assert_eq!(snapshot.last_summary, Some(summary));
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn fanout_reaches_every_observer() {
        let a = HealthState::new_shared();
        let b = HealthState::new_shared();
        let fanout = FanoutObserver::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingObserver));

        fanout.degraded(&DegradedHealth {
            owner_id: "alice".into(),
            consecutive_failures: 4,
            last_error: "timeout".into(),
        });
        assert!(a.get("alice").degraded);
        assert!(b.get("alice").degraded);
    }
}

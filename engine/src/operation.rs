//! Queued remote writes and their retry state machine.
//!
//! A [`SyncOperation`] records a remote write that must eventually succeed.
//! Its status only moves through three transitions:
//!
//! ```text
//! pending|failed --mark_in_progress--> inProgress
//! inProgress     --mark_completed----> completed
//! inProgress     --with_retry--------> failed (attempts += 1, nextRetryAt set)
//! ```
//!
//! `failed -> pending` happens implicitly once `next_retry_at` has elapsed
//! (see [`SyncOperation::requeue`]).

use crate::{backoff::BackoffPolicy, error::Result, EntityId, Error, Timestamp};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Unique identifier for a queued operation.
pub type OperationId = String;

/// Kind of remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    /// Accept a share invitation
    Accept,
    /// Reject a share invitation
    Reject,
}

impl OperationType {
    /// Stable lowercase name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Accept => "accept",
            OperationType::Reject => "reject",
        }
    }

    /// Parse a stored name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationType::Create),
            "update" => Some(OperationType::Update),
            "delete" => Some(OperationType::Delete),
            "accept" => Some(OperationType::Accept),
            "reject" => Some(OperationType::Reject),
            _ => None,
        }
    }
}

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Failed,
    Completed,
}

impl OperationStatus {
    /// Stable camelCase name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "inProgress",
            OperationStatus::Failed => "failed",
            OperationStatus::Completed => "completed",
        }
    }

    /// Parse a stored name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "inProgress" => Some(OperationStatus::InProgress),
            "failed" => Some(OperationStatus::Failed),
            "completed" => Some(OperationStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote write queued for reliable delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Entity type name, e.g. "recipe"
    pub entity_type: String,
    pub entity_id: EntityId,
    /// Operation-specific data (the remote document for create/update)
    pub payload: serde_json::Value,
    pub status: OperationStatus,
    /// Number of failed attempts so far
    pub attempts: u32,
    pub last_attempt_at: Option<Timestamp>,
    pub next_retry_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
}

impl SyncOperation {
    /// Create a new pending operation.
    pub fn new(
        id: impl Into<OperationId>,
        op_type: OperationType,
        entity_type: impl Into<String>,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            op_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            status: OperationStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            error_message: None,
            created_at: now,
        }
    }

    fn invalid(&self, to: OperationStatus) -> Error {
        Error::InvalidTransition {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// `pending|failed -> inProgress`.
    pub fn mark_in_progress(&mut self, now: Timestamp) -> Result<()> {
        match self.status {
            OperationStatus::Pending | OperationStatus::Failed => {
                self.status = OperationStatus::InProgress;
                self.last_attempt_at = Some(now);
                Ok(())
            }
            _ => Err(self.invalid(OperationStatus::InProgress)),
        }
    }

    /// `inProgress -> completed`. Clears retry scheduling and the error.
    pub fn mark_completed(&mut self) -> Result<()> {
        if self.status != OperationStatus::InProgress {
            return Err(self.invalid(OperationStatus::Completed));
        }
        self.status = OperationStatus::Completed;
        self.next_retry_at = None;
        self.error_message = None;
        Ok(())
    }

    /// `inProgress -> failed`. Records the error and schedules the next try.
    ///
    /// Never fails: whatever the current status, the result is a failed
    /// operation with a fresh `next_retry_at`.
    pub fn with_retry<R: Rng + ?Sized>(
        &mut self,
        error: impl Into<String>,
        now: Timestamp,
        policy: &BackoffPolicy,
        rng: &mut R,
    ) {
        self.attempts = self.attempts.saturating_add(1);
        self.status = OperationStatus::Failed;
        self.error_message = Some(error.into());
        let delay = policy.delay(self.attempts, rng);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.next_retry_at = Some(now.saturating_add(delay_ms));
    }

    /// Failed and either unscheduled or past its retry time.
    pub fn is_ready_for_retry(&self, now: Timestamp) -> bool {
        self.status == OperationStatus::Failed
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Eligible for the worker: pending, or failed and ready.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == OperationStatus::Pending || self.is_ready_for_retry(now)
    }

    /// `failed -> pending` once the retry time has elapsed.
    pub fn requeue(&mut self, now: Timestamp) -> Result<()> {
        if !self.is_ready_for_retry(now) {
            return Err(self.invalid(OperationStatus::Pending));
        }
        self.status = OperationStatus::Pending;
        Ok(())
    }

    /// Whether the operation reached its terminal state.
    pub fn is_completed(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    const NOW: Timestamp = 1_706_745_600_000;

    fn op() -> SyncOperation {
        SyncOperation::new(
            "op-1",
            OperationType::Update,
            "recipe",
            "r1",
            json!({"title": "Dal"}),
            NOW,
        )
    }

    #[test]
    fn new_operation_is_pending() {
        let op = op();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempts, 0);
        assert!(op.is_due(NOW));
        assert!(!op.is_ready_for_retry(NOW));
    }

    #[test]
    fn happy_path() {
        let mut op = op();
        op.mark_in_progress(NOW + 5).unwrap();
        assert_eq!(op.status, OperationStatus::InProgress);
        assert_eq!(op.last_attempt_at, Some(NOW + 5));

        op.mark_completed().unwrap();
        assert!(op.is_completed());
        assert_eq!(op.next_retry_at, None);
        assert_eq!(op.error_message, None);
    }

    #[test]
    fn completed_cannot_restart() {
        let mut op = op();
        op.mark_in_progress(NOW).unwrap();
        op.mark_completed().unwrap();

        let err = op.mark_in_progress(NOW).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: OperationStatus::Completed,
                to: OperationStatus::InProgress,
                ..
            }
        ));
    }

    #[test]
    fn pending_cannot_complete() {
        let mut op = op();
        assert!(op.mark_completed().is_err());
    }

    #[test]
    fn three_failures() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut op = op();

        for _ in 0..3 {
            op.mark_in_progress(NOW).unwrap();
            op.with_retry("network down", NOW, &policy, &mut rng);
        }

        assert_eq!(op.attempts, 3);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error_message.as_deref(), Some("network down"));

        let wait = op.next_retry_at.unwrap() - NOW;
        assert!((384_000..=576_000).contains(&wait), "wait was {wait}ms");
    }

    #[test]
    fn ready_for_retry_after_delay() {
        let policy = BackoffPolicy::default().without_jitter();
        let mut rng = StdRng::seed_from_u64(0);
        let mut op = op();
        op.mark_in_progress(NOW).unwrap();
        op.with_retry("timeout", NOW, &policy, &mut rng);

        // one attempt: 120s
        assert!(!op.is_ready_for_retry(NOW + 119_999));
        assert!(op.is_ready_for_retry(NOW + 120_000));

        assert!(op.requeue(NOW).is_err());
        op.requeue(NOW + 120_000).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[test]
    fn failed_without_schedule_is_ready() {
        let mut op = op();
        op.status = OperationStatus::Failed;
        assert!(op.is_ready_for_retry(0));
    }

    #[test]
    fn failed_can_go_straight_to_in_progress() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(3);
        let mut op = op();
        op.mark_in_progress(NOW).unwrap();
        op.with_retry("boom", NOW, &policy, &mut rng);
        op.mark_in_progress(NOW + 1).unwrap();
        assert_eq!(op.status, OperationStatus::InProgress);
        assert_eq!(op.attempts, 1);
    }

    #[test]
    fn names_round_trip_through_storage_form() {
        for t in [
            OperationType::Create,
            OperationType::Update,
            OperationType::Delete,
            OperationType::Accept,
            OperationType::Reject,
        ] {
            assert_eq!(OperationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(
            OperationStatus::parse("inProgress"),
            Some(OperationStatus::InProgress)
        );
        assert_eq!(OperationStatus::parse("bogus"), None);
    }

    #[test]
    fn serialization_format() {
        let json = serde_json::to_value(op()).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["status"], "pending");
        assert!(json.get("entityId").is_some());
        assert!(json.get("nextRetryAt").is_some());
    }
}

//! Delivery of queued remote writes.
//!
//! The worker drains due operations from the [`OperationQueue`], persisting
//! every state transition so a crash mid-attempt is recovered on restart.

use super::{DeletePayload, SavePayload};
use crate::error::{SyncError, SyncResult};
use crate::now_millis;
use crate::store::{OperationQueue, RemoteRecord, RemoteStore};
use mise_engine::{BackoffPolicy, OperationStatus, OperationType, SyncOperation, Timestamp};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one call to [`RetryWorker::process_due`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub attempted: u32,
    pub completed: u32,
    pub failed: u32,
}

/// Background worker for the operation queue.
pub struct RetryWorker {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<dyn OperationQueue>,
    backoff: BackoffPolicy,
    remote_timeout: Duration,
    poll_interval: Duration,
    batch_size: usize,
}

impl RetryWorker {
    pub fn new(remote: Arc<dyn RemoteStore>, queue: Arc<dyn OperationQueue>) -> Self {
        Self {
            remote,
            queue,
            backoff: BackoffPolicy::default(),
            remote_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fail operations a previous run left in progress so they are retried.
    pub async fn recover_interrupted(&self, now: Timestamp) -> SyncResult<usize> {
        self.recover_stalled(now, None).await
    }

    /// Fail in-progress operations whose attempt started more than `grace`
    /// ago, or all of them when `grace` is `None`.
    async fn recover_stalled(
        &self,
        now: Timestamp,
        grace: Option<Duration>,
    ) -> SyncResult<usize> {
        let grace_ms = grace.map(|g| u64::try_from(g.as_millis()).unwrap_or(u64::MAX));
        let stalled: Vec<SyncOperation> = self
            .queue
            .in_progress()
            .await?
            .into_iter()
            .filter(|op| match (grace_ms, op.last_attempt_at) {
                (Some(grace_ms), Some(at)) => at.saturating_add(grace_ms) <= now,
                _ => true,
            })
            .collect();

        let mut rng = StdRng::from_entropy();
        let mut recovered = 0;
        for mut op in stalled {
            op.with_retry("interrupted before completion", now, &self.backoff, &mut rng);
            match self.queue.save(&op).await {
                Ok(()) => recovered += 1,
                Err(e) => tracing::error!(
                    operation_id = %op.id,
                    error = %e,
                    "Could not reschedule interrupted operation"
                ),
            }
        }
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered interrupted operations");
        }
        Ok(recovered)
    }

    /// Attempt every operation due at `now`.
    ///
    /// A storage error on one operation is logged and the batch goes on;
    /// anything it leaves in progress is picked up by a later call once the
    /// remote timeout has passed.
    pub async fn process_due(&self, now: Timestamp) -> SyncResult<RetryReport> {
        // an attempt never outlives the remote timeout
        if let Err(e) = self.recover_stalled(now, Some(self.remote_timeout)).await {
            tracing::error!(error = %e, "Failed to scan for stalled operations");
        }

        let due = self.queue.due(now, self.batch_size).await?;
        let mut report = RetryReport::default();
        let mut rng = StdRng::from_entropy();

        for op in due {
            report.attempted += 1;
            let id = op.id.clone();
            match self.attempt(op, now, &mut rng).await {
                Ok(true) => report.completed += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        operation_id = %id,
                        error = %e,
                        "Could not persist operation state"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Walk one operation through its attempt. `Ok(true)` when delivered.
    async fn attempt(
        &self,
        mut op: SyncOperation,
        now: Timestamp,
        rng: &mut StdRng,
    ) -> SyncResult<bool> {
        if op.status == OperationStatus::Failed {
            op.requeue(now)?;
        }
        op.mark_in_progress(now)?;
        self.queue.save(&op).await?;

        match self.execute(&op).await {
            Ok(()) => {
                op.mark_completed()?;
                if let Err(e) = self.queue.remove(&op.id).await {
                    // completed records are never selected again
                    tracing::warn!(
                        operation_id = %op.id,
                        error = %e,
                        "Could not remove completed operation"
                    );
                    self.queue.save(&op).await?;
                }
                tracing::debug!(
                    operation_id = %op.id,
                    entity_id = %op.entity_id,
                    "Operation completed"
                );
                Ok(true)
            }
            Err(e) => {
                op.with_retry(e.to_string(), now, &self.backoff, rng);
                self.queue.save(&op).await?;
                tracing::warn!(
                    operation_id = %op.id,
                    entity_id = %op.entity_id,
                    attempts = op.attempts,
                    next_retry_at = ?op.next_retry_at,
                    error = %e,
                    "Operation failed, scheduled retry"
                );
                Ok(false)
            }
        }
    }

    async fn execute(&self, op: &SyncOperation) -> SyncResult<()> {
        tokio::time::timeout(self.remote_timeout, self.dispatch(op))
            .await
            .map_err(|_| SyncError::Timeout(self.remote_timeout))?
    }

    async fn dispatch(&self, op: &SyncOperation) -> SyncResult<()> {
        match op.op_type {
            OperationType::Create | OperationType::Update => {
                let payload: SavePayload = serde_json::from_value(op.payload.clone())?;
                let record = RemoteRecord {
                    handle: payload.handle,
                    document: payload.document,
                };
                self.remote.save(&record, &payload.owner_id).await
            }
            OperationType::Delete => {
                let payload: DeletePayload = serde_json::from_value(op.payload.clone())?;
                self.remote.delete(&payload.handle).await
            }
            OperationType::Accept => self.remote.respond_to_share(&op.entity_id, true).await,
            OperationType::Reject => self.remote.respond_to_share(&op.entity_id, false).await,
        }
    }

    /// Poll the queue until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if let Err(e) = self.recover_interrupted(now_millis()).await {
            tracing::error!(error = %e, "Failed to recover interrupted operations");
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Retry worker stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.process_due(now_millis()).await {
                        Ok(report) if report.attempted > 0 => {
                            tracing::info!(
                                attempted = report.attempted,
                                completed = report.completed,
                                failed = report.failed,
                                "Processed retry queue"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Retry queue processing failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryOperationQueue, MemoryRemoteStore};
    use serde_json::json;

    #[tokio::test]
    async fn malformed_payload_is_retried_not_dropped() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let queue = Arc::new(MemoryOperationQueue::new());
        let op = SyncOperation::new("op-1", OperationType::Update, "recipe", "r1", json!(42), 0);
        queue.enqueue(&op).await.unwrap();

        let worker = RetryWorker::new(remote, queue.clone());
        let report = worker.process_due(1_000).await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = queue.get("op-1").await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.error_message.is_some());
    }

    #[tokio::test]
    async fn share_answers_are_delivered() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let queue = Arc::new(MemoryOperationQueue::new());
        let op = SyncOperation::new("op-1", OperationType::Reject, "recipe", "r9", json!(null), 0);
        queue.enqueue(&op).await.unwrap();

        let worker = RetryWorker::new(remote.clone(), queue.clone());
        let report = worker.process_due(1).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(remote.share_response("r9"), Some(false));
        assert!(queue.get("op-1").await.unwrap().is_none());
    }
}

//! Integration tests for the retry worker.

use mise_agent::store::{MemoryOperationQueue, MemoryRemoteStore, OperationQueue, RemoteRecord};
use mise_agent::sync::{DeletePayload, RetryWorker, SavePayload};
use mise_engine::{OperationStatus, OperationType, SyncOperation};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NOW: u64 = 1_706_745_600_000;
const SECOND: u64 = 1_000;

fn save_op(id: &str, entity_id: &str) -> SyncOperation {
    let payload = serde_json::to_value(SavePayload {
        handle: format!("rec-{entity_id}"),
        owner_id: "alice".into(),
        document: json!({"id": entity_id, "updatedAt": 1, "title": "Stew"}),
    })
    .unwrap();
    SyncOperation::new(id, OperationType::Update, "recipe", entity_id, payload, NOW)
}

fn setup() -> (Arc<MemoryRemoteStore>, Arc<MemoryOperationQueue>, RetryWorker) {
    let remote = Arc::new(MemoryRemoteStore::new());
    let queue = Arc::new(MemoryOperationQueue::new());
    let worker = RetryWorker::new(remote.clone(), queue.clone());
    (remote, queue, worker)
}

#[cfg(test)]
mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_operation_is_delivered_and_removed() {
        let (remote, queue, worker) = setup();
        queue.enqueue(&save_op("op-1", "r1")).await.unwrap();

        let report = worker.process_due(NOW).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(remote.document("rec-r1").unwrap()["title"], json!("Stew"));
        assert!(queue.get("op-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_three_failures_back_off_exponentially() {
        let (remote, queue, worker) = setup();
        queue.enqueue(&save_op("op-1", "r1")).await.unwrap();
        remote.set_available(false);

        let mut now = NOW;
        for _ in 0..3 {
            let report = worker.process_due(now).await.unwrap();
            assert_eq!(report.failed, 1);
            let op = queue.get("op-1").await.unwrap().unwrap();
            now = op.next_retry_at.unwrap();
        }

        let op = queue.get("op-1").await.unwrap().unwrap();
        assert_eq!(op.attempts, 3);
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.error_message.is_some());

        let last_attempt = op.last_attempt_at.unwrap();
        let delay = op.next_retry_at.unwrap() - last_attempt;
        assert!(
            (384 * SECOND..=576 * SECOND).contains(&delay),
            "delay {delay}ms outside [384s, 576s]"
        );
    }

    #[tokio::test]
    async fn test_failed_operation_waits_for_retry_time() {
        let (remote, queue, worker) = setup();
        queue.enqueue(&save_op("op-1", "r1")).await.unwrap();
        remote.fail_next_writes(1);

        worker.process_due(NOW).await.unwrap();
        let op = queue.get("op-1").await.unwrap().unwrap();
        let retry_at = op.next_retry_at.unwrap();
        assert!(retry_at >= NOW + 48 * SECOND);

        // not yet due
        let report = worker.process_due(retry_at - 1).await.unwrap();
        assert_eq!(report.attempted, 0);

        let report = worker.process_due(retry_at).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queued_delete_is_delivered() {
        let (remote, queue, worker) = setup();
        remote.insert(
            RemoteRecord {
                handle: "rec-gone".into(),
                document: json!({"id": "gone"}),
            },
            "alice",
        );
        let payload = serde_json::to_value(DeletePayload {
            handle: "rec-gone".into(),
        })
        .unwrap();
        let op = SyncOperation::new("op-d", OperationType::Delete, "recipe", "gone", payload, NOW);
        queue.enqueue(&op).await.unwrap();

        let report = worker.process_due(NOW).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_operations_are_rescheduled() {
        let (_, queue, worker) = setup();
        let mut op = save_op("op-1", "r1");
        op.mark_in_progress(NOW).unwrap();
        queue.enqueue(&op).await.unwrap();

        assert_eq!(worker.recover_interrupted(NOW).await.unwrap(), 1);
        let op = queue.get("op-1").await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempts, 1);
        assert!(op.is_ready_for_retry(op.next_retry_at.unwrap()));
    }

    #[tokio::test]
    async fn test_storage_error_does_not_abort_batch() {
        let (remote, queue, worker) = setup();
        queue.enqueue(&save_op("op-1", "r1")).await.unwrap();
        queue
            .enqueue(&SyncOperation::new(
                "op-2",
                OperationType::Update,
                "recipe",
                "r2",
                save_op("op-2", "r2").payload,
                NOW + 1,
            ))
            .await
            .unwrap();
        // the first operation cannot even be marked in progress
        queue.fail_next_saves(1);

        let report = worker.process_due(NOW).await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert!(remote.document("rec-r2").is_some());
        assert_eq!(
            queue.get("op-1").await.unwrap().unwrap().status,
            OperationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_operation_stuck_in_progress_is_rescheduled() {
        let (_, queue, worker) = setup();
        let worker = worker.with_remote_timeout(Duration::from_secs(30));

        // saving the failed state did not persist, leaving it in progress
        let mut stuck = save_op("op-1", "r1");
        stuck.mark_in_progress(NOW).unwrap();
        queue.enqueue(&stuck).await.unwrap();

        // still within the remote timeout: may be running
        worker.process_due(NOW + 10 * SECOND).await.unwrap();
        assert_eq!(
            queue.get("op-1").await.unwrap().unwrap().status,
            OperationStatus::InProgress
        );

        worker.process_due(NOW + 31 * SECOND).await.unwrap();
        let op = queue.get("op-1").await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempts, 1);
        assert!(op.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_slow_remote_times_out() {
        let (remote, queue, worker) = setup();
        let worker = worker.with_remote_timeout(Duration::from_millis(20));
        remote.set_write_delay(Duration::from_millis(200));
        queue.enqueue(&save_op("op-1", "r1")).await.unwrap();

        let report = worker.process_due(NOW).await.unwrap();
        assert_eq!(report.failed, 1);
        let op = queue.get("op-1").await.unwrap().unwrap();
        assert!(op.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_cancelled() {
        let (remote, queue, worker) = setup();
        let worker = worker.with_poll_interval(Duration::from_millis(10));
        queue.enqueue(&save_op("op-1", "r1")).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(remote.saves(), 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}

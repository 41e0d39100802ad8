//! Integration tests for the HTTP surface.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use mise_agent::now_millis;
use mise_agent::routes::create_routes;
use mise_agent::store::{
    MemoryLocalStore, MemoryMetadataStore, MemoryOperationQueue, MemoryRemoteStore,
    MemoryTombstoneStore,
};
use mise_agent::sync::{Collaborators, HealthState, SyncCoordinator, SyncSettings};
use mise_agent::AppState;
use mise_engine::{Entity, EntitySchema};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const OWNER: &str = "alice";

fn app() -> (Router, Arc<MemoryRemoteStore>, Arc<MemoryLocalStore>) {
    let remote = Arc::new(MemoryRemoteStore::new());
    let local = Arc::new(MemoryLocalStore::new());
    let health = HealthState::new_shared();

    let coordinator = Arc::new(SyncCoordinator::new(
        Collaborators {
            remote: remote.clone(),
            local: local.clone(),
            tombstones: Arc::new(MemoryTombstoneStore::new()),
            queue: Arc::new(MemoryOperationQueue::new()),
            metadata: Arc::new(MemoryMetadataStore::new()),
            assets: None,
            observer: health.clone(),
        },
        SyncSettings::default(),
        EntitySchema::recipe(),
    ));

    let state = AppState {
        coordinator,
        health,
        owner_id: Arc::from(OWNER),
    };
    (create_routes().with_state(state), remote, local)
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[cfg(test)]
mod route_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_is_ok_initially() {
        let (app, _, _) = app();
        let (status, body) = send(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["consecutiveFailures"], json!(0));
    }

    #[tokio::test]
    async fn test_sync_runs_a_pass() {
        let (app, remote, local) = app();
        local.insert(Entity::new("r1", OWNER, now_millis()).with_shared("title", json!("Dal")));

        let (status, body) = send(&app, "POST", "/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pushed"], json!(1));
        assert!(remote.document("r1").is_some());

        let (status, body) = send(&app, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ownerId"], json!(OWNER));
        assert!(body["bookkeeping"]["lastSyncAt"].is_u64());
        assert_eq!(body["queueDepth"], json!(0));
        assert_eq!(body["health"]["lastSummary"]["pushed"], json!(1));
    }

    #[tokio::test]
    async fn test_unavailable_remote_maps_to_503_and_degrades() {
        let (app, remote, _) = app();
        remote.set_available(false);

        for _ in 0..3 {
            let (status, body) = send(&app, "POST", "/sync").await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body["error"], json!("Remote store unavailable"));
        }

        let (status, body) = send(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], json!("degraded"));
        assert_eq!(body["consecutiveFailures"], json!(3));

        let (_, body) = send(&app, "GET", "/status").await;
        assert_eq!(body["bookkeeping"]["consecutiveFailures"], json!(3));
    }

    #[tokio::test]
    async fn test_force_sync_pushes_everything() {
        let (app, remote, local) = app();
        let t = now_millis();
        local.insert(Entity::new("a", OWNER, t).with_shared("title", json!("A")));
        local.insert(Entity::new("b", OWNER, t).with_shared("title", json!("B")));

        let (status, body) = send(&app, "POST", "/sync/force").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pushed"], json!(2));
        assert_eq!(remote.len(), 2);
    }
}

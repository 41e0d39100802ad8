//! Mise sync agent.
//!
//! Keeps the device-local recipe store consistent with the remote store:
//! periodic full passes through the [`sync::SyncCoordinator`], durable
//! retries through the [`sync::RetryWorker`], and a small HTTP surface for
//! health and manual triggers.

pub mod config;
pub mod db;
pub mod error;
pub mod remote;
pub mod routes;
pub mod store;
pub mod sync;

use mise_engine::Timestamp;
use std::sync::Arc;
use sync::{HealthState, SyncCoordinator};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub health: Arc<HealthState>,
    /// Owner whose recipes this agent syncs
    pub owner_id: Arc<str>,
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

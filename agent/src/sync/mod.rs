//! The sync runtime: full-pass coordinator, periodic scheduler, retry worker
//! and health reporting.

mod coordinator;
mod health;
mod retry;
mod scheduler;

pub use coordinator::*;
pub use health::*;
pub use retry::*;
pub use scheduler::*;

use serde::{Deserialize, Serialize};

/// Payload of a queued create/update operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePayload {
    pub handle: String,
    pub owner_id: String,
    pub document: serde_json::Value,
}

/// Payload of a queued delete operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePayload {
    pub handle: String,
}

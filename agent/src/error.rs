//! Unified error handling for the agent.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mise_engine::EntityId;
use serde::Serialize;
use std::time::Duration;

/// Errors raised while syncing.
///
/// Only [`SyncError::Unavailable`] (and failures to read either side in bulk)
/// abort a full pass; everything else is recorded per entity.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote write failed for {entity_id}: {message}")]
    TransientWrite { entity_id: EntityId, message: String },

    #[error("could not decode remote record {handle}: {source}")]
    Decode {
        handle: String,
        #[source]
        source: mise_engine::Error,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("local store error: {0}")]
    Local(String),

    /// The local copy changed after it was read, so a sync write was dropped.
    #[error("local copy of {0} changed since it was read")]
    Superseded(EntityId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("engine error: {0}")]
    Engine(#[from] mise_engine::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Unavailable(_)
                | SyncError::TransientWrite { .. }
                | SyncError::Timeout(_)
                | SyncError::Remote(_)
        )
    }

    /// Wrap a remote failure for one entity's write.
    pub fn transient(entity_id: impl Into<EntityId>, err: SyncError) -> Self {
        match err {
            // timeouts stay recognisable
            SyncError::Timeout(_) => err,
            other => SyncError::TransientWrite {
                entity_id: entity_id.into(),
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            SyncError::Unavailable(err.to_string())
        } else if err.is_decode() {
            SyncError::Local(format!("malformed remote response: {err}"))
        } else {
            SyncError::Remote(err.to_string())
        }
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// HTTP-facing error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Sync(SyncError::Unavailable(msg)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Remote store unavailable".to_string(),
                Some(msg.clone()),
            ),
            AppError::Sync(SyncError::InvariantViolation(msg)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), None)
            }
            AppError::Sync(e) => {
                tracing::error!("Sync error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Sync failed".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

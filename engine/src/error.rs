//! Error types for the Mise engine.

use crate::{EntityId, OperationStatus};
use thiserror::Error;

/// All possible errors from the Mise engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Decode errors
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // State machine errors
    #[error("invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    // Guards
    #[error("entity {0} has no owner")]
    MissingOwner(EntityId),

    #[error("entity {entity} is owned by {actual}, not {expected}")]
    OwnerMismatch {
        entity: EntityId,
        expected: String,
        actual: String,
    },
}

impl Error {
    /// True for failures that mean a document could not be reconstructed.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            Error::InvalidDocument(_) | Error::MissingRequiredField(_) | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

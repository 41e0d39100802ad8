//! Collaborator interfaces consumed by the sync core.
//!
//! The coordinator only talks to storage through these traits. SQLite-backed
//! implementations live in [`crate::db`], in-memory ones in [`memory`], and
//! the HTTP remote client in [`crate::remote`].

pub mod memory;

use crate::error::SyncResult;
use async_trait::async_trait;
use mise_engine::{Entity, EntityId, Linkage, SyncOperation, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use memory::{
    MemoryAssetStore, MemoryLocalStore, MemoryMetadataStore, MemoryOperationQueue,
    MemoryRemoteStore, MemoryTombstoneStore,
};

/// A record as held by the remote store: its handle and flat document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub handle: String,
    pub document: serde_json::Value,
}

/// The remote authoritative store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether the store is reachable and the user is signed in.
    async fn is_available(&self) -> bool;

    /// All records owned by `owner`.
    async fn fetch_all_owned_by(&self, owner: &str) -> SyncResult<Vec<RemoteRecord>>;

    /// Create or replace a record.
    async fn save(&self, record: &RemoteRecord, owner: &str) -> SyncResult<()>;

    /// Delete a record. A missing record is not an error.
    async fn delete(&self, handle: &str) -> SyncResult<()>;

    /// Accept or reject a share invitation for an entity.
    async fn respond_to_share(&self, entity_id: &str, accepted: bool) -> SyncResult<()>;
}

/// What happened to a local entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Change notification emitted by local stores.
///
/// Writes made by the sync engine set the flags so listeners do not bounce
/// them back to the remote store or re-upload assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChange {
    pub entity_id: EntityId,
    pub kind: ChangeKind,
    /// Listeners should push this change to the remote store
    pub wants_remote_sync: bool,
    /// Listeners should upload the entity's asset
    pub wants_asset_sync: bool,
}

/// The device-local entity store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn fetch_all(&self) -> SyncResult<Vec<Entity>>;

    /// Insert a new entity. `skip_remote_sync` suppresses the upload trigger.
    async fn create(&self, entity: &Entity, skip_remote_sync: bool) -> SyncResult<()>;

    /// Replace an entity.
    ///
    /// With `update_timestamp` the stored `updated_at` becomes
    /// `max(previous, now)`. Without it this is a sync write: it only applies
    /// when the stored `updated_at` is not newer than the entity's, and fails
    /// with [`SyncError::Superseded`] otherwise.
    ///
    /// [`SyncError::Superseded`]: crate::error::SyncError::Superseded
    async fn update(
        &self,
        entity: &Entity,
        update_timestamp: bool,
        skip_asset_sync: bool,
    ) -> SyncResult<()>;

    /// Overwrite only the linkage fields, leaving content and `updated_at`
    /// untouched.
    async fn update_linkage(&self, entity_id: &str, linkage: &Linkage) -> SyncResult<()>;

    async fn delete(&self, entity_id: &str) -> SyncResult<()>;
}

/// Durable record of local deletions.
#[async_trait]
pub trait TombstoneStore: Send + Sync {
    /// Whether a live tombstone exists for the entity.
    async fn is_deleted(&self, entity_id: &str) -> SyncResult<bool>;

    /// Record a deletion; recording twice keeps the first time.
    async fn record_deletion(&self, entity_id: &str) -> SyncResult<()>;

    /// Remove tombstones older than `retention`. Returns how many went.
    async fn purge_older_than(&self, retention: Duration) -> SyncResult<u64>;

    async fn count(&self) -> SyncResult<u64>;
}

/// Durable queue of remote writes awaiting delivery.
#[async_trait]
pub trait OperationQueue: Send + Sync {
    async fn enqueue(&self, op: &SyncOperation) -> SyncResult<()>;

    /// Persist the current state of an operation.
    async fn save(&self, op: &SyncOperation) -> SyncResult<()>;

    async fn remove(&self, id: &str) -> SyncResult<()>;

    async fn get(&self, id: &str) -> SyncResult<Option<SyncOperation>>;

    /// Pending operations plus failed ones ready for retry, oldest first.
    async fn due(&self, now: Timestamp, limit: usize) -> SyncResult<Vec<SyncOperation>>;

    /// Operations left in progress, e.g. by a crash mid-attempt.
    async fn in_progress(&self) -> SyncResult<Vec<SyncOperation>>;

    /// Number of operations not yet completed.
    async fn depth(&self) -> SyncResult<u64>;

    /// Drop queued create/update operations for an entity that is not being
    /// attempted right now. Returns how many were dropped.
    async fn discard_saves(&self, entity_id: &str) -> SyncResult<u64>;
}

/// Persisted sync bookkeeping.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn last_sync_at(&self, owner: &str) -> SyncResult<Option<Timestamp>>;

    async fn set_last_sync_at(&self, owner: &str, at: Timestamp) -> SyncResult<()>;
}

/// Binary asset transfer.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Download the entity's asset if the remote copy is newer than what is
    /// cached. Returns a local reference (path) when something was fetched.
    async fn download_if_newer(
        &self,
        entity_id: &str,
        remote_modified_at: Option<Timestamp>,
    ) -> SyncResult<Option<String>>;
}

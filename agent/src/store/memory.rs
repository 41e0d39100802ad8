//! In-memory collaborators.
//!
//! Used by the test suites and by the agent when no remote URL is configured.
//! The remote store can simulate outages, failing writes and slow calls.

use super::{
    AssetStore, ChangeKind, LocalChange, LocalStore, MetadataStore, OperationQueue, RemoteRecord,
    RemoteStore, TombstoneStore,
};
use crate::error::{SyncError, SyncResult};
use crate::now_millis;
use async_trait::async_trait;
use dashmap::DashMap;
use mise_engine::{
    Entity, EntityId, Linkage, OperationStatus, OperationType, SyncOperation, Timestamp,
    Tombstone, TombstoneLedger,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Remote store held in memory.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    /// Records keyed by handle: (owner, document)
    records: DashMap<String, (String, serde_json::Value)>,
    share_responses: DashMap<String, bool>,
    available: AtomicBool,
    failing_writes: AtomicU32,
    delay_ms: AtomicU64,
    saves: AtomicUsize,
    deletes: AtomicUsize,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            share_responses: DashMap::new(),
            available: AtomicBool::new(true),
            failing_writes: AtomicU32::new(0),
            delay_ms: AtomicU64::new(0),
            saves: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Seed a record without counting it as a save.
    pub fn insert(&self, record: RemoteRecord, owner: impl Into<String>) {
        self.records
            .insert(record.handle, (owner.into(), record.document));
    }

    pub fn document(&self, handle: &str) -> Option<serde_json::Value> {
        self.records.get(handle).map(|r| r.1.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` saves/deletes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Successful deletes so far.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn share_response(&self, entity_id: &str) -> Option<bool> {
        self.share_responses.get(entity_id).map(|r| *r)
    }

    async fn before_write(&self) -> SyncResult<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::Remote("injected write failure".into()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::Unavailable("memory remote offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn fetch_all_owned_by(&self, owner: &str) -> SyncResult<Vec<RemoteRecord>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::Unavailable("memory remote offline".into()));
        }
        let mut records: Vec<RemoteRecord> = self
            .records
            .iter()
            .filter(|r| r.value().0 == owner)
            .map(|r| RemoteRecord {
                handle: r.key().clone(),
                document: r.value().1.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(records)
    }

    async fn save(&self, record: &RemoteRecord, owner: &str) -> SyncResult<()> {
        self.before_write().await?;
        self.records.insert(
            record.handle.clone(),
            (owner.to_string(), record.document.clone()),
        );
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, handle: &str) -> SyncResult<()> {
        self.before_write().await?;
        self.records.remove(handle);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn respond_to_share(&self, entity_id: &str, accepted: bool) -> SyncResult<()> {
        self.before_write().await?;
        self.share_responses.insert(entity_id.to_string(), accepted);
        Ok(())
    }
}

/// Local store held in memory.
#[derive(Debug)]
pub struct MemoryLocalStore {
    entities: DashMap<EntityId, Entity>,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    changes: broadcast::Sender<LocalChange>,
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entities: DashMap::new(),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            changes,
        }
    }

    /// Seed an entity without counting it as a write.
    pub fn insert(&self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.entities.get(id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Total creates, updates and deletes so far.
    pub fn writes(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalChange> {
        self.changes.subscribe()
    }

    fn notify(&self, entity_id: &str, kind: ChangeKind, remote: bool, asset: bool) {
        // no subscribers is fine
        let _ = self.changes.send(LocalChange {
            entity_id: entity_id.to_string(),
            kind,
            wants_remote_sync: remote,
            wants_asset_sync: asset,
        });
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn fetch_all(&self) -> SyncResult<Vec<Entity>> {
        let mut all: Vec<Entity> = self.entities.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn create(&self, entity: &Entity, skip_remote_sync: bool) -> SyncResult<()> {
        if self.entities.contains_key(&entity.id) {
            return Err(SyncError::Local(format!("entity {} already exists", entity.id)));
        }
        self.entities.insert(entity.id.clone(), entity.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.notify(&entity.id, ChangeKind::Created, !skip_remote_sync, !skip_remote_sync);
        Ok(())
    }

    async fn update(
        &self,
        entity: &Entity,
        update_timestamp: bool,
        skip_asset_sync: bool,
    ) -> SyncResult<()> {
        let mut stored = self
            .entities
            .get_mut(&entity.id)
            .ok_or_else(|| SyncError::Local(format!("entity {} not found", entity.id)))?;
        let mut next = entity.clone();
        if update_timestamp {
            next.updated_at = stored.updated_at;
            next.touch(now_millis());
        } else if stored.updated_at > entity.updated_at {
            return Err(SyncError::Superseded(entity.id.clone()));
        }
        *stored = next;
        drop(stored);
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.notify(&entity.id, ChangeKind::Updated, update_timestamp, !skip_asset_sync);
        Ok(())
    }

    async fn update_linkage(&self, entity_id: &str, linkage: &Linkage) -> SyncResult<()> {
        let mut stored = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| SyncError::Local(format!("entity {entity_id} not found")))?;
        stored.linkage = linkage.clone();
        drop(stored);
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.notify(entity_id, ChangeKind::Updated, false, false);
        Ok(())
    }

    async fn delete(&self, entity_id: &str) -> SyncResult<()> {
        if self.entities.remove(entity_id).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.notify(entity_id, ChangeKind::Deleted, false, false);
        }
        Ok(())
    }
}

/// Tombstone store held in memory.
#[derive(Debug, Default)]
pub struct MemoryTombstoneStore {
    ledger: RwLock<TombstoneLedger>,
}

impl MemoryTombstoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tombstone with an explicit deletion time.
    pub async fn insert(&self, tombstone: Tombstone) {
        self.ledger.write().await.insert(tombstone);
    }

    pub async fn get(&self, entity_id: &str) -> Option<Tombstone> {
        self.ledger.read().await.get(entity_id).cloned()
    }
}

#[async_trait]
impl TombstoneStore for MemoryTombstoneStore {
    async fn is_deleted(&self, entity_id: &str) -> SyncResult<bool> {
        Ok(self.ledger.read().await.is_deleted(entity_id, now_millis()))
    }

    async fn record_deletion(&self, entity_id: &str) -> SyncResult<()> {
        self.ledger.write().await.record(entity_id, now_millis());
        Ok(())
    }

    async fn purge_older_than(&self, retention: Duration) -> SyncResult<u64> {
        let purged = self
            .ledger
            .write()
            .await
            .purge_older_than(retention, now_millis());
        Ok(purged as u64)
    }

    async fn count(&self) -> SyncResult<u64> {
        Ok(self.ledger.read().await.len() as u64)
    }
}

/// Operation queue held in memory.
#[derive(Debug, Default)]
pub struct MemoryOperationQueue {
    ops: DashMap<String, SyncOperation>,
    failing_saves: AtomicU32,
}

impl MemoryOperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail with a local store error.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<SyncOperation> {
        let mut ops: Vec<SyncOperation> = self.ops.iter().map(|o| o.value().clone()).collect();
        ops.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        ops
    }
}

#[async_trait]
impl OperationQueue for MemoryOperationQueue {
    async fn enqueue(&self, op: &SyncOperation) -> SyncResult<()> {
        self.ops.insert(op.id.clone(), op.clone());
        Ok(())
    }

    async fn save(&self, op: &SyncOperation) -> SyncResult<()> {
        let injected = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::Local(format!("injected save failure for {}", op.id)));
        }
        self.ops.insert(op.id.clone(), op.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> SyncResult<()> {
        self.ops.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> SyncResult<Option<SyncOperation>> {
        Ok(self.ops.get(id).map(|o| o.clone()))
    }

    async fn due(&self, now: Timestamp, limit: usize) -> SyncResult<Vec<SyncOperation>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|op| op.is_due(now))
            .take(limit)
            .collect())
    }

    async fn in_progress(&self) -> SyncResult<Vec<SyncOperation>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|op| op.status == OperationStatus::InProgress)
            .collect())
    }

    async fn depth(&self) -> SyncResult<u64> {
        Ok(self.ops.iter().filter(|o| !o.is_completed()).count() as u64)
    }

    async fn discard_saves(&self, entity_id: &str) -> SyncResult<u64> {
        let before = self.ops.len();
        self.ops.retain(|_, op| {
            let stale_save = op.entity_id == entity_id
                && matches!(op.op_type, OperationType::Create | OperationType::Update)
                && matches!(op.status, OperationStatus::Pending | OperationStatus::Failed);
            !stale_save
        });
        Ok(before.saturating_sub(self.ops.len()) as u64)
    }
}

/// Sync bookkeeping held in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    last_sync: DashMap<String, Timestamp>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn last_sync_at(&self, owner: &str) -> SyncResult<Option<Timestamp>> {
        Ok(self.last_sync.get(owner).map(|t| *t))
    }

    async fn set_last_sync_at(&self, owner: &str, at: Timestamp) -> SyncResult<()> {
        self.last_sync.insert(owner.to_string(), at);
        Ok(())
    }
}

/// Asset collaborator that records requested downloads.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    /// Cached asset modification time per entity
    cached: DashMap<EntityId, Option<Timestamp>>,
    failing: AtomicBool,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether an asset was ever fetched for the entity.
    pub fn has_asset(&self, entity_id: &str) -> bool {
        self.cached.contains_key(entity_id)
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn download_if_newer(
        &self,
        entity_id: &str,
        remote_modified_at: Option<Timestamp>,
    ) -> SyncResult<Option<String>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Remote(format!("asset download failed for {entity_id}")));
        }
        let newer = match self.cached.get(entity_id).map(|c| *c) {
            None => true,
            Some(cached) => remote_modified_at > cached,
        };
        if !newer {
            return Ok(None);
        }
        self.cached.insert(entity_id.to_string(), remote_modified_at);
        Ok(Some(format!("assets/{entity_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mise_engine::TOMBSTONE_RETENTION;
    use serde_json::json;

    #[tokio::test]
    async fn remote_filters_by_owner_and_treats_missing_delete_as_success() {
        let remote = MemoryRemoteStore::new();
        remote.insert(
            RemoteRecord {
                handle: "a".into(),
                document: json!({"id": "a"}),
            },
            "alice",
        );
        remote.insert(
            RemoteRecord {
                handle: "b".into(),
                document: json!({"id": "b"}),
            },
            "bob",
        );

        let mine = remote.fetch_all_owned_by("alice").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].handle, "a");

        remote.delete("missing").await.unwrap();
        assert_eq!(remote.len(), 2);
    }

    #[tokio::test]
    async fn remote_failure_injection() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next_writes(1);
        let record = RemoteRecord {
            handle: "a".into(),
            document: json!({}),
        };
        assert!(remote.save(&record, "alice").await.is_err());
        assert!(remote.save(&record, "alice").await.is_ok());
        assert_eq!(remote.saves(), 1);

        remote.set_available(false);
        assert!(!remote.is_available().await);
        assert!(matches!(
            remote.fetch_all_owned_by("alice").await,
            Err(SyncError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn local_update_timestamp_is_monotonic() {
        let local = MemoryLocalStore::new();
        let entity = Entity::new("r1", "alice", u64::MAX - 1);
        local.create(&entity, false).await.unwrap();

        let mut older = entity.clone();
        older.updated_at = 5;
        local.update(&older, true, false).await.unwrap();
        assert_eq!(local.get("r1").unwrap().updated_at, u64::MAX - 1);

        // a sync write carrying an older clock is refused
        assert!(matches!(
            local.update(&older, false, true).await,
            Err(SyncError::Superseded(_))
        ));
        assert_eq!(local.get("r1").unwrap().updated_at, u64::MAX - 1);
    }

    #[tokio::test]
    async fn local_linkage_update_leaves_content() {
        let local = MemoryLocalStore::new();
        let entity = Entity::new("r1", "alice", 7).with_shared("title", serde_json::json!("Soup"));
        local.create(&entity, false).await.unwrap();

        let linkage = Linkage {
            remote_handle: Some("rec-1".into()),
            ..Linkage::default()
        };
        local.update_linkage("r1", &linkage).await.unwrap();

        let stored = local.get("r1").unwrap();
        assert_eq!(stored.linkage, linkage);
        assert_eq!(stored.updated_at, 7);
        assert_eq!(stored.shared["title"], serde_json::json!("Soup"));
        assert!(local.update_linkage("nope", &linkage).await.is_err());
    }

    #[tokio::test]
    async fn local_emits_flagged_changes() {
        let local = MemoryLocalStore::new();
        let mut rx = local.subscribe();

        local
            .create(&Entity::new("r1", "alice", 1), true)
            .await
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Created);
        assert!(!change.wants_remote_sync);

        assert!(local.create(&Entity::new("r1", "alice", 1), true).await.is_err());
        assert!(local.update(&Entity::new("nope", "alice", 1), false, true).await.is_err());
    }

    #[tokio::test]
    async fn tombstones_purge() {
        let store = MemoryTombstoneStore::new();
        store.record_deletion("fresh").await.unwrap();
        store
            .insert(Tombstone::new("old", now_millis() - 31 * 24 * 60 * 60 * 1000))
            .await;

        assert!(store.is_deleted("fresh").await.unwrap());
        assert!(!store.is_deleted("old").await.unwrap());
        assert_eq!(store.purge_older_than(TOMBSTONE_RETENTION).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_due_ordering() {
        let queue = MemoryOperationQueue::new();
        let a = SyncOperation::new("a", OperationType::Update, "recipe", "r1", json!({}), 20);
        let b = SyncOperation::new("b", OperationType::Delete, "recipe", "r2", json!({}), 10);
        let mut c = SyncOperation::new("c", OperationType::Update, "recipe", "r3", json!({}), 5);
        c.status = OperationStatus::Failed;
        c.next_retry_at = Some(1_000);

        for op in [&a, &b, &c] {
            queue.enqueue(op).await.unwrap();
        }

        let due: Vec<_> = queue.due(100, 10).await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(due, vec!["b", "a"]);

        let due: Vec<_> = queue.due(1_000, 2).await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(due, vec!["c", "b"]);
        assert_eq!(queue.depth().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn assets_download_only_when_newer() {
        let assets = MemoryAssetStore::new();
        assert_eq!(
            assets.download_if_newer("r1", Some(10)).await.unwrap().as_deref(),
            Some("assets/r1")
        );
        assert!(assets.download_if_newer("r1", Some(10)).await.unwrap().is_none());
        assert!(assets.download_if_newer("r1", Some(11)).await.unwrap().is_some());
    }
}

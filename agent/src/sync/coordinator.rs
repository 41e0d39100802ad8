//! Full sync passes and entity-level remote writes.
//!
//! A pass pulls the owner's remote records and every local entity, pairs
//! them by id, asks the resolver for a [`Decision`] per entity and applies
//! it. Local writes are applied inline; remote writes run with bounded
//! parallelism, each push followed by its own local relink. Passes for the
//! same owner never overlap.

use super::{DeletePayload, DegradedHealth, SavePayload, SyncObserver};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::now_millis;
use crate::store::{
    AssetStore, LocalStore, MetadataStore, OperationQueue, RemoteRecord, RemoteStore,
    TombstoneStore,
};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use mise_engine::{
    pair_by_id, resolve, BackoffPolicy, Decision, Entity, EntitySchema, OperationId, OperationType,
    OwnerId, SyncOperation, Timestamp, TOMBSTONE_RETENTION,
};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Local-only field that receives the downloaded asset reference.
const ASSET_PATH_FIELD: &str = "imagePath";

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    /// Entities created locally from remote copies
    pub created: u32,
    /// Local entities overwritten by newer remote copies
    pub updated: u32,
    /// Entities written to the remote store
    pub pushed: u32,
    /// Metadata-only linkage reconciliations
    pub relinked: u32,
    /// Entities left alone: other owners' or undecodable
    pub skipped: u32,
    /// Entities suppressed by a live tombstone
    pub tombstoned: u32,
    /// Per-entity failures; the pass still completed
    pub failed: u32,
    pub purged_tombstones: u64,
}

/// Everything the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub remote: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalStore>,
    pub tombstones: Arc<dyn TombstoneStore>,
    pub queue: Arc<dyn OperationQueue>,
    pub metadata: Arc<dyn MetadataStore>,
    pub assets: Option<Arc<dyn AssetStore>>,
    pub observer: Arc<dyn SyncObserver>,
}

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Upper bound on every remote call
    pub remote_timeout: Duration,
    /// Concurrent remote writes within a pass
    pub push_concurrency: usize,
    /// Consecutive failed passes before health is degraded
    pub failure_threshold: u32,
    pub tombstone_retention: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(30),
            push_concurrency: 4,
            failure_threshold: 3,
            tombstone_retention: TOMBSTONE_RETENTION,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl From<&Config> for SyncSettings {
    fn from(config: &Config) -> Self {
        Self {
            remote_timeout: config.remote_timeout,
            push_concurrency: config.push_concurrency.max(1),
            failure_threshold: config.failure_threshold,
            ..Self::default()
        }
    }
}

/// Sync bookkeeping for one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookkeeping {
    /// Persisted time of the last successful pass
    pub last_sync_at: Option<Timestamp>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_summary: Option<PassSummary>,
}

/// Result of an entity-level remote write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "operationId", rename_all = "camelCase")]
pub enum WriteOutcome {
    /// The remote store accepted the write
    Written,
    /// The write failed transiently and was queued for retry
    Queued(OperationId),
    /// Nothing to do remotely
    NotLinked,
}

/// A remote write scheduled during a pass.
enum RemoteJob {
    /// Save `merged`; relink locally afterwards when its linkage changed
    Push { merged: Entity, relink: bool },
    /// Rewrite the remote copy with reconciled linkage only
    Relink { remote: Entity },
}

enum JobOutcome {
    Pushed,
    Relinked,
    Skipped,
    Failed,
}

/// Orchestrates sync for any number of owners.
pub struct SyncCoordinator {
    stores: Collaborators,
    settings: SyncSettings,
    schema: EntitySchema,
    passes: DashMap<OwnerId, Arc<Mutex<()>>>,
    bookkeeping: DashMap<OwnerId, Bookkeeping>,
}

impl SyncCoordinator {
    pub fn new(stores: Collaborators, settings: SyncSettings, schema: EntitySchema) -> Self {
        Self {
            stores,
            settings,
            schema,
            passes: DashMap::new(),
            bookkeeping: DashMap::new(),
        }
    }

    pub fn stores(&self) -> &Collaborators {
        &self.stores
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn owner_lock(&self, owner: &str) -> Arc<Mutex<()>> {
        self.passes.entry(owner.to_string()).or_default().clone()
    }

    /// Run a full pass, waiting for any pass already running for `owner`.
    ///
    /// Only pass-level failures are returned as errors: the remote store
    /// being unavailable, or either side failing to load. Entity-level
    /// failures are counted in the summary.
    pub async fn perform_full_sync(&self, owner: &str) -> SyncResult<PassSummary> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;
        self.run_pass(owner).await
    }

    /// Run a full pass unless one is already running for `owner`.
    pub async fn try_perform_full_sync(&self, owner: &str) -> Option<SyncResult<PassSummary>> {
        let lock = self.owner_lock(owner);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(owner, "Sync pass already in progress, skipping");
            return None;
        };
        Some(self.run_pass(owner).await)
    }

    /// Whether the last successful pass is older than `stale_after`.
    pub async fn needs_sync(&self, owner: &str, stale_after: Duration) -> SyncResult<bool> {
        let Some(last) = self.stores.metadata.last_sync_at(owner).await? else {
            return Ok(true);
        };
        let stale_ms = u64::try_from(stale_after.as_millis()).unwrap_or(u64::MAX);
        Ok(now_millis().saturating_sub(last) >= stale_ms)
    }

    pub async fn bookkeeping(&self, owner: &str) -> SyncResult<Bookkeeping> {
        let mut bookkeeping = self
            .bookkeeping
            .get(owner)
            .map(|b| b.clone())
            .unwrap_or_default();
        bookkeeping.last_sync_at = self.stores.metadata.last_sync_at(owner).await?;
        Ok(bookkeeping)
    }

    async fn run_pass(&self, owner: &str) -> SyncResult<PassSummary> {
        let started = Instant::now();
        tracing::debug!(owner, "Starting sync pass");

        match self.merge_pass(owner).await {
            Ok(summary) => {
                {
                    let mut book = self.bookkeeping.entry(owner.to_string()).or_default();
                    book.consecutive_failures = 0;
                    book.last_error = None;
                    book.last_summary = Some(summary.clone());
                }
                self.stores.observer.pass_completed(owner, &summary);
                tracing::debug!(
                    owner,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sync pass finished"
                );
                Ok(summary)
            }
            Err(e) => {
                let failures = {
                    let mut book = self.bookkeeping.entry(owner.to_string()).or_default();
                    book.consecutive_failures = book.consecutive_failures.saturating_add(1);
                    book.last_error = Some(e.to_string());
                    book.consecutive_failures
                };
                tracing::warn!(
                    owner,
                    error = %e,
                    consecutive_failures = failures,
                    "Sync pass failed"
                );
                if failures >= self.settings.failure_threshold {
                    self.stores.observer.degraded(&DegradedHealth {
                        owner_id: owner.to_string(),
                        consecutive_failures: failures,
                        last_error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn merge_pass(&self, owner: &str) -> SyncResult<PassSummary> {
        self.ensure_available().await?;

        let records = self
            .remote_call(self.stores.remote.fetch_all_owned_by(owner))
            .await?;
        let locals = self.stores.local.fetch_all().await?;

        let mut summary = PassSummary::default();

        // Undecodable remote copies are skipped, and so are their local
        // counterparts: the remote state is unknown, not absent.
        let mut undecodable_ids = HashSet::new();
        let mut undecodable_handles = HashSet::new();
        let mut remotes = Vec::with_capacity(records.len());
        for record in records {
            match self.schema.decode(&record.document) {
                Ok(mut entity) => {
                    entity
                        .linkage
                        .remote_handle
                        .get_or_insert_with(|| record.handle.clone());
                    entity.owner_id.get_or_insert_with(|| owner.to_string());
                    remotes.push(entity);
                }
                Err(source) => {
                    let err = SyncError::Decode {
                        handle: record.handle.clone(),
                        source,
                    };
                    tracing::warn!(owner, error = %err, "Skipping undecodable remote record");
                    if let Some(id) = record.document.get("id").and_then(|v| v.as_str()) {
                        undecodable_ids.insert(id.to_string());
                    }
                    undecodable_handles.insert(record.handle);
                    summary.skipped += 1;
                }
            }
        }

        let locals = locals.into_iter().filter(|entity| {
            let blocked = undecodable_ids.contains(&entity.id)
                || entity
                    .linkage
                    .remote_handle
                    .as_ref()
                    .is_some_and(|h| undecodable_handles.contains(h));
            !blocked
        });

        let mut jobs = Vec::new();
        for (id, pair) in pair_by_id(locals, remotes) {
            let tombstoned = match self.stores.tombstones.is_deleted(&id).await {
                Ok(tombstoned) => tombstoned,
                Err(e) => {
                    tracing::warn!(entity_id = %id, error = %e, "Tombstone lookup failed");
                    summary.failed += 1;
                    continue;
                }
            };

            let decision = resolve(pair.local.as_ref(), pair.remote.as_ref(), tombstoned, owner);
            tracing::trace!(entity_id = %id, decision = decision.kind(), "Resolved");

            match decision {
                Decision::PullRemoteIntoLocal {
                    merged,
                    is_new,
                    asset_changed,
                } => match self.pull(merged, is_new, asset_changed).await {
                    Ok(()) if is_new => summary.created += 1,
                    Ok(()) => summary.updated += 1,
                    Err(SyncError::Superseded(_)) => {
                        tracing::debug!(entity_id = %id, "Local edit landed mid-pass");
                        summary.skipped += 1;
                    }
                    Err(e) => {
                        tracing::warn!(entity_id = %id, error = %e, "Local write failed");
                        summary.failed += 1;
                    }
                },
                Decision::PushLocalToRemote { merged } => {
                    let relink = pair
                        .local
                        .as_ref()
                        .map_or(true, |local| local.linkage != merged.linkage);
                    jobs.push(RemoteJob::Push { merged, relink });
                }
                Decision::ReconcileLinkage {
                    linkage,
                    update_local,
                    update_remote,
                } => {
                    if update_local && pair.local.is_some() {
                        match self.stores.local.update_linkage(&id, &linkage).await {
                            Ok(()) => summary.relinked += 1,
                            Err(e) => {
                                tracing::warn!(entity_id = %id, error = %e, "Local relink failed");
                                summary.failed += 1;
                            }
                        }
                    }
                    if let (true, Some(mut remote)) = (update_remote, pair.remote) {
                        remote.linkage = linkage;
                        jobs.push(RemoteJob::Relink { remote });
                    }
                }
                Decision::KeepLocalOnly => summary.skipped += 1,
                Decision::SuppressedByTombstone => {
                    summary.tombstoned += 1;
                    // a deleted entity must not linger locally
                    if pair.local.is_some() {
                        if let Err(e) = self.stores.local.delete(&id).await {
                            tracing::warn!(entity_id = %id, error = %e, "Local delete failed");
                            summary.failed += 1;
                        }
                    }
                }
                Decision::Noop => {}
            }
        }

        let outcomes: Vec<JobOutcome> = stream::iter(jobs)
            .map(|job| self.run_job(owner, job))
            .buffer_unordered(self.settings.push_concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                JobOutcome::Pushed => summary.pushed += 1,
                JobOutcome::Relinked => summary.relinked += 1,
                JobOutcome::Skipped => summary.skipped += 1,
                JobOutcome::Failed => summary.failed += 1,
            }
        }

        self.stores
            .metadata
            .set_last_sync_at(owner, now_millis())
            .await?;
        summary.purged_tombstones = self
            .stores
            .tombstones
            .purge_older_than(self.settings.tombstone_retention)
            .await?;

        Ok(summary)
    }

    /// Write a pulled entity locally, then fetch its asset if it changed.
    async fn pull(&self, mut merged: Entity, is_new: bool, asset_changed: bool) -> SyncResult<()> {
        if is_new {
            self.stores.local.create(&merged, true).await?;
        } else {
            self.stores.local.update(&merged, false, true).await?;
        }

        let Some(assets) = &self.stores.assets else {
            return Ok(());
        };
        if !asset_changed || merged.linkage.asset_handle.is_none() {
            return Ok(());
        }

        // asset failures never fail the pull
        match assets
            .download_if_newer(&merged.id, merged.linkage.asset_modified_at)
            .await
        {
            Ok(Some(path)) => {
                merged
                    .local
                    .insert(ASSET_PATH_FIELD.to_string(), serde_json::Value::String(path));
                if let Err(e) = self.stores.local.update(&merged, false, true).await {
                    tracing::warn!(entity_id = %merged.id, error = %e, "Asset relink failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(entity_id = %merged.id, error = %e, "Asset download failed");
            }
        }
        Ok(())
    }

    async fn run_job(&self, owner: &str, job: RemoteJob) -> JobOutcome {
        match job {
            RemoteJob::Push { merged, relink } => match self.push(owner, merged, relink).await {
                Ok(_) => JobOutcome::Pushed,
                Err(SyncError::InvariantViolation(msg)) => {
                    tracing::warn!(owner, "Refusing to push: {}", msg);
                    JobOutcome::Skipped
                }
                Err(e) => {
                    tracing::warn!(owner, error = %e, "Push failed");
                    JobOutcome::Failed
                }
            },
            RemoteJob::Relink { remote } => {
                let record = self.remote_record(&remote);
                match self.remote_call(self.stores.remote.save(&record, owner)).await {
                    Ok(()) => JobOutcome::Relinked,
                    Err(e) => {
                        let err = SyncError::transient(&remote.id, e);
                        tracing::warn!(owner, error = %err, "Remote relink failed");
                        JobOutcome::Failed
                    }
                }
            }
        }
    }

    /// Save `entity` remotely, then relink it locally. The local write only
    /// happens after the remote save succeeded.
    async fn push(&self, owner: &str, mut entity: Entity, relink: bool) -> SyncResult<Entity> {
        self.check_owner(&entity, owner)?;
        let relink = relink || entity.linkage.remote_handle.is_none();
        entity
            .linkage
            .remote_handle
            .get_or_insert_with(|| entity.id.clone());

        let record = self.remote_record(&entity);
        self.remote_call(self.stores.remote.save(&record, owner))
            .await
            .map_err(|e| SyncError::transient(&entity.id, e))?;

        // queued saves carry older content than what just went out
        match self.stores.queue.discard_saves(&entity.id).await {
            Ok(0) => {}
            Ok(dropped) => {
                tracing::debug!(entity_id = %entity.id, dropped, "Dropped superseded queued saves")
            }
            Err(e) => {
                tracing::warn!(entity_id = %entity.id, error = %e, "Could not prune queued saves")
            }
        }

        if relink {
            self.stores
                .local
                .update_linkage(&entity.id, &entity.linkage)
                .await?;
        }
        Ok(entity)
    }

    fn check_owner(&self, entity: &Entity, owner: &str) -> SyncResult<()> {
        match entity.owner_id.as_deref() {
            None => Err(SyncError::InvariantViolation(format!(
                "entity {} has no owner",
                entity.id
            ))),
            Some(actual) if actual != owner => Err(SyncError::InvariantViolation(format!(
                "entity {} is owned by {actual}, not {owner}",
                entity.id
            ))),
            Some(_) => Ok(()),
        }
    }

    fn remote_record(&self, entity: &Entity) -> RemoteRecord {
        RemoteRecord {
            handle: entity
                .linkage
                .remote_handle
                .clone()
                .unwrap_or_else(|| entity.id.clone()),
            document: self.schema.encode_remote(entity),
        }
    }

    async fn ensure_available(&self) -> SyncResult<()> {
        match tokio::time::timeout(self.settings.remote_timeout, self.stores.remote.is_available())
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(SyncError::Unavailable(
                "remote store unreachable or not signed in".into(),
            )),
            Err(_) => Err(SyncError::Unavailable(format!(
                "availability check timed out after {:?}",
                self.settings.remote_timeout
            ))),
        }
    }

    /// Bound a remote call by the configured timeout.
    async fn remote_call<T>(&self, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.settings.remote_timeout, call)
            .await
            .map_err(|_| SyncError::Timeout(self.settings.remote_timeout))?
    }

    async fn enqueue(
        &self,
        op_type: OperationType,
        entity_id: &str,
        payload: serde_json::Value,
        error: &SyncError,
    ) -> SyncResult<OperationId> {
        let op = SyncOperation::new(
            Uuid::new_v4().to_string(),
            op_type,
            self.schema.entity_type.clone(),
            entity_id,
            payload,
            now_millis(),
        );
        self.stores.queue.enqueue(&op).await?;
        tracing::info!(
            entity_id,
            operation_id = %op.id,
            op_type = op_type.as_str(),
            error = %error,
            "Queued remote write for retry"
        );
        Ok(op.id)
    }

    /// Push one entity now, bypassing the merge.
    ///
    /// Retryable failures are queued and reported as
    /// [`WriteOutcome::Queued`]; anything else is returned as an error.
    pub async fn sync_entity_to_cloud(
        &self,
        entity: &Entity,
        owner: &str,
    ) -> SyncResult<WriteOutcome> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;
        self.push_or_enqueue(entity, owner).await
    }

    async fn push_or_enqueue(&self, entity: &Entity, owner: &str) -> SyncResult<WriteOutcome> {
        match self.push(owner, entity.clone(), false).await {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(e) if e.is_retryable() => {
                let mut linked = entity.clone();
                linked
                    .linkage
                    .remote_handle
                    .get_or_insert_with(|| entity.id.clone());
                let record = self.remote_record(&linked);
                let payload = serde_json::to_value(SavePayload {
                    handle: record.handle,
                    owner_id: owner.to_string(),
                    document: record.document,
                })?;
                let op_type = if entity.is_linked() {
                    OperationType::Update
                } else {
                    OperationType::Create
                };
                let id = self.enqueue(op_type, &entity.id, payload, &e).await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Push every local entity owned by `owner`, bypassing the merge.
    pub async fn force_sync_all_to_cloud(&self, owner: &str) -> SyncResult<PassSummary> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;

        self.ensure_available().await?;
        let locals = self.stores.local.fetch_all().await?;

        let mut summary = PassSummary::default();
        let mut owned = Vec::new();
        for entity in locals {
            if entity.is_owned_by(owner) {
                owned.push(entity);
            } else {
                summary.skipped += 1;
            }
        }

        let outcomes: Vec<SyncResult<WriteOutcome>> = stream::iter(owned)
            .map(|entity| async move { self.push_or_enqueue(&entity, owner).await })
            .buffer_unordered(self.settings.push_concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                Ok(WriteOutcome::Written) => summary.pushed += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    tracing::warn!(owner, error = %e, "Forced push failed");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            owner,
            pushed = summary.pushed,
            failed = summary.failed,
            "Forced re-push finished"
        );
        Ok(summary)
    }

    /// Delete an entity locally and remotely.
    ///
    /// Entities that were ever linked get a tombstone first, so a stale
    /// remote copy cannot bring them back. A failed remote delete is queued.
    pub async fn delete_entity_from_cloud(&self, entity: &Entity) -> SyncResult<WriteOutcome> {
        let lock = entity.owner_id.as_deref().map(|owner| self.owner_lock(owner));
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        if entity.is_linked() {
            self.stores.tombstones.record_deletion(&entity.id).await?;
        }
        self.stores.local.delete(&entity.id).await?;

        let Some(handle) = entity.linkage.remote_handle.clone() else {
            return Ok(WriteOutcome::NotLinked);
        };

        match self.remote_call(self.stores.remote.delete(&handle)).await {
            Ok(()) => Ok(WriteOutcome::Written),
            Err(e) if e.is_retryable() => {
                let e = SyncError::transient(&entity.id, e);
                let payload = serde_json::to_value(DeletePayload { handle })?;
                let id = self
                    .enqueue(OperationType::Delete, &entity.id, payload, &e)
                    .await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Accept or reject a share invitation, queueing the answer on failure.
    pub async fn respond_to_share(
        &self,
        entity_id: &str,
        accepted: bool,
    ) -> SyncResult<WriteOutcome> {
        let call = self.stores.remote.respond_to_share(entity_id, accepted);
        match self.remote_call(call).await {
            Ok(()) => Ok(WriteOutcome::Written),
            Err(e) if e.is_retryable() => {
                let op_type = if accepted {
                    OperationType::Accept
                } else {
                    OperationType::Reject
                };
                let id = self
                    .enqueue(op_type, entity_id, serde_json::Value::Null, &e)
                    .await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => Err(e),
        }
    }
}

//! Database operations for the entities table.

use crate::error::{SyncError, SyncResult};
use crate::now_millis;
use crate::store::{ChangeKind, LocalChange, LocalStore};
use async_trait::async_trait;
use mise_engine::{Entity, FieldMap, Linkage};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;

/// A stored entity row from the database.
#[derive(Debug)]
pub struct StoredEntity {
    pub id: String,
    pub owner_id: Option<String>,
    pub updated_at: i64,
    pub shared: String,
    pub local: String,
    pub remote_handle: Option<String>,
    pub asset_handle: Option<String>,
    pub asset_modified_at: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredEntity {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntity {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            updated_at: row.try_get("updated_at")?,
            shared: row.try_get("shared")?,
            local: row.try_get("local")?,
            remote_handle: row.try_get("remote_handle")?,
            asset_handle: row.try_get("asset_handle")?,
            asset_modified_at: row.try_get("asset_modified_at")?,
        })
    }
}

impl StoredEntity {
    /// Convert a database row to an engine entity.
    pub fn to_entity(&self) -> SyncResult<Entity> {
        let shared: FieldMap = serde_json::from_str(&self.shared)?;
        let local: FieldMap = serde_json::from_str(&self.local)?;
        Ok(Entity {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            updated_at: self.updated_at.max(0) as u64,
            shared,
            local,
            linkage: Linkage {
                remote_handle: self.remote_handle.clone(),
                asset_handle: self.asset_handle.clone(),
                asset_modified_at: self.asset_modified_at.map(|t| t.max(0) as u64),
            },
        })
    }
}

/// [`LocalStore`] over the `entities` table.
#[derive(Debug, Clone)]
pub struct SqliteLocalStore {
    pool: SqlitePool,
    changes: broadcast::Sender<LocalChange>,
}

impl SqliteLocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { pool, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalChange> {
        self.changes.subscribe()
    }

    /// Get an entity by id.
    pub async fn get(&self, id: &str) -> SyncResult<Option<Entity>> {
        let row = sqlx::query_as::<_, StoredEntity>(
            r#"
            SELECT id, owner_id, updated_at, shared, local,
                   remote_handle, asset_handle, asset_modified_at
            FROM entities
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.to_entity()).transpose()
    }

    /// Why a guarded update touched no row.
    async fn missing_or_superseded(&self, entity_id: &str) -> SyncError {
        match self.get(entity_id).await {
            Ok(Some(_)) => SyncError::Superseded(entity_id.to_string()),
            Ok(None) => SyncError::Local(format!("entity {entity_id} not found")),
            Err(e) => e,
        }
    }

    fn notify(&self, entity_id: &str, kind: ChangeKind, remote: bool, asset: bool) {
        let _ = self.changes.send(LocalChange {
            entity_id: entity_id.to_string(),
            kind,
            wants_remote_sync: remote,
            wants_asset_sync: asset,
        });
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn fetch_all(&self) -> SyncResult<Vec<Entity>> {
        let rows = sqlx::query_as::<_, StoredEntity>(
            r#"
            SELECT id, owner_id, updated_at, shared, local,
                   remote_handle, asset_handle, asset_modified_at
            FROM entities
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(StoredEntity::to_entity).collect()
    }

    async fn create(&self, entity: &Entity, skip_remote_sync: bool) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (
                id, owner_id, updated_at, shared, local,
                remote_handle, asset_handle, asset_modified_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entity.id)
        .bind(&entity.owner_id)
        .bind(entity.updated_at as i64)
        .bind(serde_json::to_string(&entity.shared)?)
        .bind(serde_json::to_string(&entity.local)?)
        .bind(&entity.linkage.remote_handle)
        .bind(&entity.linkage.asset_handle)
        .bind(entity.linkage.asset_modified_at.map(|t| t as i64))
        .execute(&self.pool)
        .await?;

        self.notify(&entity.id, ChangeKind::Created, !skip_remote_sync, !skip_remote_sync);
        Ok(())
    }

    async fn update(
        &self,
        entity: &Entity,
        update_timestamp: bool,
        skip_asset_sync: bool,
    ) -> SyncResult<()> {
        // bumping keeps the stored clock monotonic; sync writes never
        // replace a newer local edit
        let (clock_sql, guard_sql, clock) = if update_timestamp {
            ("MAX(updated_at, ?1)", "", now_millis() as i64)
        } else {
            ("?1", "AND updated_at <= ?1", entity.updated_at as i64)
        };
        let sql = format!(
            r#"
            UPDATE entities SET
                updated_at = {clock_sql},
                owner_id = ?2,
                shared = ?3,
                local = ?4,
                remote_handle = ?5,
                asset_handle = ?6,
                asset_modified_at = ?7
            WHERE id = ?8 {guard_sql}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(clock)
            .bind(&entity.owner_id)
            .bind(serde_json::to_string(&entity.shared)?)
            .bind(serde_json::to_string(&entity.local)?)
            .bind(&entity.linkage.remote_handle)
            .bind(&entity.linkage.asset_handle)
            .bind(entity.linkage.asset_modified_at.map(|t| t as i64))
            .bind(&entity.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or_superseded(&entity.id).await);
        }

        self.notify(&entity.id, ChangeKind::Updated, update_timestamp, !skip_asset_sync);
        Ok(())
    }

    async fn update_linkage(&self, entity_id: &str, linkage: &Linkage) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE entities SET
                remote_handle = ?,
                asset_handle = ?,
                asset_modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&linkage.remote_handle)
        .bind(&linkage.asset_handle)
        .bind(linkage.asset_modified_at.map(|t| t as i64))
        .bind(entity_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Local(format!("entity {entity_id} not found")));
        }

        self.notify(entity_id, ChangeKind::Updated, false, false);
        Ok(())
    }

    async fn delete(&self, entity_id: &str) -> SyncResult<()> {
        let result = sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(entity_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            self.notify(entity_id, ChangeKind::Deleted, false, false);
        }
        Ok(())
    }
}

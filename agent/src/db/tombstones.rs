//! Database operations for the tombstones table.

use crate::error::SyncResult;
use crate::now_millis;
use crate::store::TombstoneStore;
use async_trait::async_trait;
use mise_engine::{expiry_cutoff, Tombstone, TOMBSTONE_RETENTION};
use sqlx::SqlitePool;
use std::time::Duration;

/// [`TombstoneStore`] over the `tombstones` table.
#[derive(Debug, Clone)]
pub struct SqliteTombstoneStore {
    pool: SqlitePool,
    retention: Duration,
}

impl SqliteTombstoneStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retention: TOMBSTONE_RETENTION,
        }
    }

    /// Insert a tombstone with an explicit deletion time, replacing any
    /// existing one.
    pub async fn insert(&self, tombstone: &Tombstone) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tombstones (entity_id, deleted_at) VALUES (?, ?)
            ON CONFLICT (entity_id) DO UPDATE SET deleted_at = excluded.deleted_at
            "#,
        )
        .bind(&tombstone.entity_id)
        .bind(tombstone.deleted_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, entity_id: &str) -> SyncResult<Option<Tombstone>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT deleted_at FROM tombstones WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(deleted_at,)| Tombstone::new(entity_id, deleted_at.max(0) as u64)))
    }
}

#[async_trait]
impl TombstoneStore for SqliteTombstoneStore {
    async fn is_deleted(&self, entity_id: &str) -> SyncResult<bool> {
        Ok(self
            .get(entity_id)
            .await?
            .is_some_and(|t| !t.is_expired(now_millis(), self.retention)))
    }

    async fn record_deletion(&self, entity_id: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tombstones (entity_id, deleted_at) VALUES (?, ?)
            ON CONFLICT (entity_id) DO NOTHING
            "#,
        )
        .bind(entity_id)
        .bind(now_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_older_than(&self, retention: Duration) -> SyncResult<u64> {
        let cutoff = expiry_cutoff(now_millis(), retention);
        let result = sqlx::query("DELETE FROM tombstones WHERE deleted_at < ?")
            .bind(cutoff as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> SyncResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tombstones")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

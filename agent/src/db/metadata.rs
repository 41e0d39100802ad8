//! Database operations for the sync_metadata table.

use crate::error::SyncResult;
use crate::store::MetadataStore;
use async_trait::async_trait;
use mise_engine::Timestamp;
use sqlx::SqlitePool;

/// [`MetadataStore`] over the `sync_metadata` table.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn last_sync_at(&self, owner: &str) -> SyncResult<Option<Timestamp>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_sync_at FROM sync_metadata WHERE owner_id = ?")
                .bind(owner)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(at,)| at.max(0) as u64))
    }

    async fn set_last_sync_at(&self, owner: &str, at: Timestamp) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (owner_id, last_sync_at) VALUES (?, ?)
            ON CONFLICT (owner_id) DO UPDATE SET last_sync_at = excluded.last_sync_at
            "#,
        )
        .bind(owner)
        .bind(at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

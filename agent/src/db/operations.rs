//! Database operations for the sync_operations table.

use crate::error::{SyncError, SyncResult};
use crate::store::OperationQueue;
use async_trait::async_trait;
use mise_engine::{OperationStatus, OperationType, SyncOperation, Timestamp};
use sqlx::{Row, SqlitePool};

/// A stored operation row from the database.
#[derive(Debug)]
pub struct StoredOperation {
    pub id: String,
    pub op_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredOperation {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredOperation {
            id: row.try_get("id")?,
            op_type: row.try_get("op_type")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StoredOperation {
    /// Convert database row to an engine operation.
    pub fn to_operation(&self) -> SyncResult<SyncOperation> {
        let op_type = OperationType::parse(&self.op_type).ok_or_else(|| {
            SyncError::Local(format!("Unknown operation type: {}", self.op_type))
        })?;
        let status = OperationStatus::parse(&self.status).ok_or_else(|| {
            SyncError::Local(format!("Unknown operation status: {}", self.status))
        })?;

        Ok(SyncOperation {
            id: self.id.clone(),
            op_type,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            payload: serde_json::from_str(&self.payload)?,
            status,
            attempts: u32::try_from(self.attempts.max(0)).unwrap_or(u32::MAX),
            last_attempt_at: self.last_attempt_at.map(|t| t.max(0) as u64),
            next_retry_at: self.next_retry_at.map(|t| t.max(0) as u64),
            error_message: self.error_message.clone(),
            created_at: self.created_at.max(0) as u64,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, op_type, entity_type, entity_id, payload, status,
           attempts, last_attempt_at, next_retry_at, error_message, created_at
    FROM sync_operations
"#;

/// Durable [`OperationQueue`] over the `sync_operations` table.
#[derive(Debug, Clone)]
pub struct SqliteOperationQueue {
    pool: SqlitePool,
}

impl SqliteOperationQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert(&self, op: &SyncOperation) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_operations (
                id, op_type, entity_type, entity_id, payload, status,
                attempts, last_attempt_at, next_retry_at, error_message, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                payload = excluded.payload,
                status = excluded.status,
                attempts = excluded.attempts,
                last_attempt_at = excluded.last_attempt_at,
                next_retry_at = excluded.next_retry_at,
                error_message = excluded.error_message
            "#,
        )
        .bind(&op.id)
        .bind(op.op_type.as_str())
        .bind(&op.entity_type)
        .bind(&op.entity_id)
        .bind(serde_json::to_string(&op.payload)?)
        .bind(op.status.as_str())
        .bind(i64::from(op.attempts))
        .bind(op.last_attempt_at.map(|t| t as i64))
        .bind(op.next_retry_at.map(|t| t as i64))
        .bind(&op.error_message)
        .bind(op.created_at as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(
        &self,
        sql: String,
        now: Option<Timestamp>,
        limit: Option<i64>,
    ) -> SyncResult<Vec<SyncOperation>> {
        let mut query = sqlx::query_as::<_, StoredOperation>(&sql);
        if let Some(now) = now {
            query = query.bind(now as i64);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(StoredOperation::to_operation).collect()
    }
}

#[async_trait]
impl OperationQueue for SqliteOperationQueue {
    async fn enqueue(&self, op: &SyncOperation) -> SyncResult<()> {
        self.upsert(op).await
    }

    async fn save(&self, op: &SyncOperation) -> SyncResult<()> {
        self.upsert(op).await
    }

    async fn remove(&self, id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_operations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> SyncResult<Option<SyncOperation>> {
        let row = sqlx::query_as::<_, StoredOperation>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.to_operation()).transpose()
    }

    async fn due(&self, now: Timestamp, limit: usize) -> SyncResult<Vec<SyncOperation>> {
        let sql = format!(
            r#"{SELECT_COLUMNS}
            WHERE status = 'pending'
               OR (status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= ?))
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.fetch(sql, Some(now), Some(limit)).await
    }

    async fn in_progress(&self) -> SyncResult<Vec<SyncOperation>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'inProgress' ORDER BY created_at ASC, id ASC"
        );
        self.fetch(sql, None, None).await
    }

    async fn depth(&self) -> SyncResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sync_operations WHERE status != 'completed'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn discard_saves(&self, entity_id: &str) -> SyncResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_operations
            WHERE entity_id = ?
              AND op_type IN ('create', 'update')
              AND status IN ('pending', 'failed')
            "#,
        )
        .bind(entity_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

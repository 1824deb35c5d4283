//! PostgreSQL implementation of InstanceStore
//!
//! Production persistence using PostgreSQL with:
//! - One row per workflow instance (meta, state and lease in the same row)
//! - Conditional lease updates guarded by a per-row version counter
//! - Checkpoint and transition log written in one transaction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::workflow::{CallbackRequest, Meta};

/// PostgreSQL implementation of InstanceStore
///
/// Uses a connection pool shared by every request handled by the replica.
///
/// # Example
///
/// ```ignore
/// use leaseflow_durable::PostgresInstanceStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresInstanceStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

impl PostgresInstanceStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM workflow_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    #[instrument(skip(self, instance), fields(workflow_id = %instance.id()))]
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let meta = to_json(&instance.meta)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_instances (id, workflow_type, meta, state, lock_expiry)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(instance.id())
        .bind(&instance.meta.workflow)
        .bind(&meta)
        .bind(&instance.state)
        .bind(instance.lock_expiry)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(instance.id().to_string()));
        }

        debug!(workflow_type = %instance.meta.workflow, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<VersionedInstance, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT meta, state, lock_expiry, version
            FROM workflow_instances
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get workflow: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        parse_instance(&row)
    }

    #[instrument(skip(self))]
    async fn set_lock_if_unchanged(
        &self,
        id: &str,
        expected_version: u64,
        lock_expiry: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lock_expiry = $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(id)
        .bind(expected_version as i64)
        .bind(lock_expiry)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lock workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => Ok(row.get::<i64, _>("version") as u64),
            None => {
                if self.exists(id).await? {
                    Err(StoreError::PreconditionFailed(id.to_string()))
                } else {
                    Err(StoreError::NotFound(id.to_string()))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn clear_lock(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lock_expiry = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to unlock workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_lock_if_held(
        &self,
        id: &str,
        lock_expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lock_expiry = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND lock_expiry = $2
            "#,
        )
        .bind(id)
        .bind(lock_expiry)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to unlock workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    #[instrument(skip(self, checkpoint), fields(pc = checkpoint.meta.pc, release_lock = checkpoint.release_lock))]
    async fn checkpoint(&self, id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let meta = to_json(&checkpoint.meta)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET meta = $2,
                state = $3,
                lock_expiry = CASE WHEN $4 THEN NULL ELSE lock_expiry END,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&meta)
        .bind(&checkpoint.state)
        .bind(checkpoint.release_lock)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to save workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        if let Some(record) = checkpoint.transition {
            let record_meta = to_json(&record.meta)?;
            let callback = record.callback.as_ref().map(to_json).transpose()?;

            sqlx::query(
                r#"
                INSERT INTO workflow_transitions (
                    workflow_id, pc, meta, state, recorded_at, exec_duration_ms,
                    input, output, callback
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (workflow_id, pc) DO UPDATE SET
                    meta = EXCLUDED.meta,
                    state = EXCLUDED.state,
                    recorded_at = EXCLUDED.recorded_at,
                    exec_duration_ms = EXCLUDED.exec_duration_ms,
                    input = EXCLUDED.input,
                    output = EXCLUDED.output,
                    callback = EXCLUDED.callback
                "#,
            )
            .bind(&record.workflow_id)
            .bind(record.pc as i64)
            .bind(&record_meta)
            .bind(&record.state)
            .bind(record.recorded_at)
            .bind(record.exec_duration_ms as i64)
            .bind(&record.input)
            .bind(&record.output)
            .bind(&callback)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to record transition: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!("saved workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transitions(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, pc, meta, state, recorded_at, exec_duration_ms,
                   input, output, callback
            FROM workflow_transitions
            WHERE workflow_id = $1
            ORDER BY pc
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load transitions: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let meta: serde_json::Value = row.get("meta");
            let callback: Option<serde_json::Value> = row.get("callback");
            records.push(TransitionRecord {
                workflow_id: row.get("workflow_id"),
                pc: row.get::<i64, _>("pc") as u64,
                meta: from_json(meta)?,
                state: row.get("state"),
                recorded_at: row.get("recorded_at"),
                exec_duration_ms: row.get::<i64, _>("exec_duration_ms") as u64,
                input: row.get("input"),
                output: row.get("output"),
                callback: callback.map(from_json::<CallbackRequest>).transpose()?,
            });
        }

        Ok(records)
    }
}

fn parse_instance(row: &PgRow) -> Result<VersionedInstance, StoreError> {
    let meta: serde_json::Value = row.get("meta");
    let meta: Meta = from_json(meta)?;

    Ok(VersionedInstance {
        instance: WorkflowInstance {
            meta,
            state: row.get("state"),
            lock_expiry: row.get("lock_expiry"),
        },
        version: row.get::<i64, _>("version") as u64,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

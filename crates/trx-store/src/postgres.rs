//! Postgres-backed claim store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use trx_models::{
    CreateTaskForm, EncoderKind, Task, TaskError, TaskId, TaskSettings, TaskSource, TaskStatus,
};

use crate::claim::{Affinity, ClaimRequest, ClaimStore, RoutingBacklog};
use crate::{StoreError, StoreResult};

const TASK_COLUMNS: &str = "task_id, source, encoder, status, routing, hostname, duration, \
     file_size, settings, parts_total, error, created_at, updated_at, deleted_at";

// Host-bound rows sort before unbound ones; oldest first within each group.
const CLAIM_PREFER_SQL: &str = r#"
    UPDATE transcode_tasks
    SET status = $2, hostname = $3, updated_at = NOW()
    WHERE task_id = (
        SELECT task_id FROM transcode_tasks
        WHERE status = $1
          AND hostname IN ($3, '')
          AND deleted_at IS NULL
        ORDER BY LENGTH(hostname) DESC, created_at
        FOR UPDATE SKIP LOCKED
        LIMIT 1
    )
    RETURNING "#;

const CLAIM_REQUIRE_SQL: &str = r#"
    UPDATE transcode_tasks
    SET status = $2, updated_at = NOW()
    WHERE task_id = (
        SELECT task_id FROM transcode_tasks
        WHERE status = $1
          AND hostname = $3
          AND deleted_at IS NULL
        ORDER BY created_at
        FOR UPDATE SKIP LOCKED
        LIMIT 1
    )
    RETURNING "#;

#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: Uuid,
    source: Json<TaskSource>,
    encoder: String,
    status: String,
    routing: String,
    hostname: String,
    duration: f64,
    file_size: i64,
    settings: Json<TaskSettings>,
    parts_total: Option<i32>,
    error: Option<Json<TaskError>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = TaskId(row.task_id);
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::corrupt(id, e.to_string()))?;
        let encoder = row
            .encoder
            .parse::<EncoderKind>()
            .map_err(|e| StoreError::corrupt(id, e))?;
        let parts_total = row
            .parts_total
            .map(u32::try_from)
            .transpose()
            .map_err(|e| StoreError::corrupt(id, e.to_string()))?;

        Ok(Task {
            id,
            source: row.source.0,
            encoder,
            status,
            routing: row.routing,
            hostname: row.hostname,
            duration: row.duration,
            file_size: row.file_size,
            settings: row.settings.0,
            parts_total,
            error: row.error.map(|e| e.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Claim store configuration.
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub dsn: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Claim store on a Postgres `transcode_tasks` table.
#[derive(Clone)]
pub struct PgClaimStore {
    pool: PgPool,
}

impl PgClaimStore {
    /// Connect and run pending migrations.
    pub async fn connect(config: &PgStoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.dsn)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(max_connections = config.max_connections, "Connected to claim store");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ClaimStore for PgClaimStore {
    async fn create(&self, form: CreateTaskForm) -> StoreResult<Task> {
        let task = Task::from_form(form);
        let sql = format!(
            "INSERT INTO transcode_tasks \
             (task_id, source, encoder, status, duration, file_size, settings, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task.id.0)
            .bind(Json(&task.source))
            .bind(task.encoder.as_str())
            .bind(task.status.as_str())
            .bind(task.duration)
            .bind(task.file_size)
            .bind(Json(&task.settings))
            .bind(task.created_at)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get(&self, id: TaskId) -> StoreResult<Task> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM transcode_tasks WHERE task_id = $1");
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?
            .try_into()
    }

    async fn claim_next(&self, request: &ClaimRequest) -> StoreResult<Option<Task>> {
        let head = match request.affinity {
            Affinity::Prefer => CLAIM_PREFER_SQL,
            Affinity::Require => CLAIM_REQUIRE_SQL,
        };
        let sql = format!("{head}{TASK_COLUMNS}");

        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(request.eligible.as_str())
            .bind(request.claimed.as_str())
            .bind(&request.hostname)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let task = Task::try_from(row)?;
                debug!(task_id = %task.id, status = %task.status, "Claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<&TaskError>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_tasks
            SET status = $2, error = COALESCE($3, error), updated_at = NOW()
            WHERE task_id = $1 AND status <> 'done'
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(error.map(Json))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn start_encoding(&self, id: TaskId, parts_total: u32) -> StoreResult<bool> {
        let parts = i32::try_from(parts_total)
            .map_err(|_| StoreError::corrupt(id, format!("parts total {parts_total} out of range")))?;
        let result = sqlx::query(
            r#"
            UPDATE transcode_tasks
            SET status = 'encoding', parts_total = $2, updated_at = NOW()
            WHERE task_id = $1 AND status = 'splitting' AND deleted_at IS NULL
            "#,
        )
        .bind(id.0)
        .bind(parts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_canceled(&self, id: TaskId) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT (deleted_at IS NOT NULL OR status = 'canceled') FROM transcode_tasks WHERE task_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))
    }

    async fn get_duration(&self, id: TaskId) -> StoreResult<f64> {
        sqlx::query_scalar::<_, f64>("SELECT duration FROM transcode_tasks WHERE task_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn soft_delete(&self, id: TaskId) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE transcode_tasks SET deleted_at = NOW(), updated_at = NOW() \
             WHERE task_id = $1 AND deleted_at IS NULL",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(&self, limit: i64) -> StoreResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM transcode_tasks \
             WHERE status = 'pending' AND deleted_at IS NULL \
             ORDER BY created_at LIMIT $1"
        );
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Task::try_from)
            .collect()
    }

    async fn routing_backlog(&self, routing: &str) -> StoreResult<RoutingBacklog> {
        let (tasks, duration, file_size) = sqlx::query_as::<_, (i64, f64, i64)>(
            r#"
            SELECT COUNT(*)::BIGINT,
                   COALESCE(SUM(duration), 0)::DOUBLE PRECISION,
                   COALESCE(SUM(file_size), 0)::BIGINT
            FROM transcode_tasks
            WHERE routing = $1
              AND status IN ('waiting-splitting', 'splitting')
              AND deleted_at IS NULL
            "#,
        )
        .bind(routing)
        .fetch_one(&self.pool)
        .await?;

        Ok(RoutingBacklog {
            tasks,
            duration,
            file_size,
        })
    }

    async fn admit(&self, id: TaskId, routing: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_tasks
            SET status = 'waiting-splitting', routing = $2, updated_at = NOW()
            WHERE task_id = $1 AND status = 'pending' AND deleted_at IS NULL
            "#,
        )
        .bind(id.0)
        .bind(routing)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

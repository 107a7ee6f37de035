//! PostgreSQL-backed job store.
//!
//! The claim uses a conditional update over a `FOR UPDATE SKIP LOCKED`
//! selection so concurrent workers never receive the same record.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{JobRecord, JobStatus, NewJob};
use crate::error::{ConveyorError, Result};

use super::{JobStore, ABANDONED_ERROR};

// "position" is quoted: it is a reserved word in SQL
const RECORD_COLUMNS: &str = "id, job_type, queue_name, arguments, status, \"position\", block_id, \
                              attempts, last_error, not_before, created_at, updated_at";

/// PostgreSQL storage adapter for job records
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Connect a new store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool (zero-cost reuse)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_record(row: &PgRow) -> Result<JobRecord> {
        let status: String = row.get("status");
        Ok(JobRecord {
            id: row.get("id"),
            job_type: row.get("job_type"),
            queue_name: row.get("queue_name"),
            arguments: row.get("arguments"),
            status: JobStatus::try_from(status.as_str())?,
            position: row.get("position"),
            block_id: row.get("block_id"),
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            not_before: row.get("not_before"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Conditional status transition; fails if the row is not `running`.
    async fn transition_from_running(
        &self,
        id: i64,
        to: JobStatus,
        last_error: Option<String>,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = $2,
                last_error = COALESCE($3, last_error),
                not_before = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(last_error)
        .bind(not_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Distinguish a missing row from an illegal transition
        match self.get(id).await? {
            None => Err(ConveyorError::JobNotFound(id)),
            Some(record) => Err(ConveyorError::InvalidStateTransition {
                from: record.status.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(job_type = %new.job_type, queue = %new.queue_name))]
    async fn enqueue(&self, new: NewJob) -> Result<JobRecord> {
        new.validate()?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_records (job_type, queue_name, arguments, status, "position", block_id)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(&new.job_type)
        .bind(&new.queue_name)
        .bind(&new.arguments)
        .bind(new.position)
        .bind(new.block_id)
        .fetch_one(&self.pool)
        .await?;

        let record = Self::map_record(&row)?;
        debug!(id = record.id, "enqueued job");
        Ok(record)
    }

    async fn claim_next_due(&self, queue_name: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_records AS j
            SET status = 'running', updated_at = NOW()
            FROM (
                SELECT id FROM job_records
                WHERE queue_name = $1
                  AND status IN ('pending', 'reset')
                  AND (not_before IS NULL OR not_before <= NOW())
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ) AS due
            WHERE j.id = due.id AND j.status IN ('pending', 'reset')
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(queue_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_record).transpose()
    }

    async fn mark_completed(&self, id: i64, last_error: Option<String>) -> Result<()> {
        self.transition_from_running(id, JobStatus::Completed, last_error, None)
            .await
    }

    async fn mark_failed(&self, id: i64, error: String) -> Result<()> {
        self.transition_from_running(id, JobStatus::Failed, Some(error), None)
            .await
    }

    async fn reset_to_pending(&self, id: i64, not_before: Option<DateTime<Utc>>) -> Result<()> {
        self.transition_from_running(id, JobStatus::Reset, None, not_before)
            .await
    }

    async fn increment_attempts(&self, id: i64) -> Result<i32> {
        let row = sqlx::query(
            r#"
            UPDATE job_records
            SET attempts = attempts + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.get("attempts"))
            .ok_or(ConveyorError::JobNotFound(id))
    }

    async fn get(&self, id: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_record).transpose()
    }

    async fn find_block_sibling(
        &self,
        block_id: Uuid,
        position: i32,
    ) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_records WHERE block_id = $1 AND \"position\" = $2"
        ))
        .bind(block_id)
        .bind(position)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_record).transpose()
    }

    #[instrument(skip(self))]
    async fn abandon_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE status IN ('pending', 'reset') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(ABANDONED_ERROR)
        .execute(&self.pool)
        .await?;

        let abandoned = result.rows_affected();
        if abandoned > 0 {
            info!(abandoned, "abandoned stale job records");
        }
        Ok(abandoned)
    }
}

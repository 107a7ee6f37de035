//! In-process job store used by dry-run mode and tests.
//!
//! A single async mutex over the table gives the same atomic-claim guarantee
//! the Postgres implementation gets from conditional updates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{JobRecord, JobStatus, NewJob};
use crate::error::{ConveyorError, Result};

use super::{JobStore, ABANDONED_ERROR};

#[derive(Default)]
struct Inner {
    next_id: i64,
    jobs: BTreeMap<i64, JobRecord>,
}

/// Memory-backed `JobStore`
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition_error(record: &JobRecord, to: JobStatus) -> ConveyorError {
        ConveyorError::InvalidStateTransition {
            from: record.status.to_string(),
            to: to.to_string(),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<JobRecord> {
        new.validate()?;
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let now = Utc::now();
        let record = JobRecord {
            id: inner.next_id,
            job_type: new.job_type,
            queue_name: new.queue_name,
            arguments: new.arguments,
            status: JobStatus::Pending,
            position: new.position,
            block_id: new.block_id,
            attempts: 0,
            last_error: None,
            not_before: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(record.id, record.clone());
        debug!(id = record.id, job_type = %record.job_type, "enqueued job");
        Ok(record)
    }

    async fn claim_next_due(&self, queue_name: &str) -> Result<Option<JobRecord>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let due_id = inner
            .jobs
            .values()
            .find(|j| {
                j.queue_name == queue_name
                    && j.status.is_due()
                    && j.not_before.map_or(true, |t| t <= now)
            })
            .map(|j| j.id);

        let Some(id) = due_id else {
            return Ok(None);
        };
        let record = inner
            .jobs
            .get_mut(&id)
            .ok_or(ConveyorError::JobNotFound(id))?;
        record.status = JobStatus::Running;
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn mark_completed(&self, id: i64, last_error: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .jobs
            .get_mut(&id)
            .ok_or(ConveyorError::JobNotFound(id))?;
        if record.status != JobStatus::Running {
            return Err(Self::transition_error(record, JobStatus::Completed));
        }
        record.status = JobStatus::Completed;
        if last_error.is_some() {
            record.last_error = last_error;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: String) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .jobs
            .get_mut(&id)
            .ok_or(ConveyorError::JobNotFound(id))?;
        if record.status != JobStatus::Running {
            return Err(Self::transition_error(record, JobStatus::Failed));
        }
        record.status = JobStatus::Failed;
        record.last_error = Some(error);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_to_pending(&self, id: i64, not_before: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .jobs
            .get_mut(&id)
            .ok_or(ConveyorError::JobNotFound(id))?;
        if record.status != JobStatus::Running {
            return Err(Self::transition_error(record, JobStatus::Reset));
        }
        record.status = JobStatus::Reset;
        record.not_before = not_before;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_attempts(&self, id: i64) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .jobs
            .get_mut(&id)
            .ok_or(ConveyorError::JobNotFound(id))?;
        record.attempts += 1;
        record.updated_at = Utc::now();
        Ok(record.attempts)
    }

    async fn get(&self, id: i64) -> Result<Option<JobRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn find_block_sibling(
        &self,
        block_id: Uuid,
        position: i32,
    ) -> Result<Option<JobRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .find(|j| j.block_id == Some(block_id) && j.position == Some(position))
            .cloned())
    }

    async fn abandon_stale(&self, older_than: Duration) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - older_than;
        let mut abandoned = 0u64;
        for record in inner.jobs.values_mut() {
            if record.status.is_due() && record.updated_at < cutoff {
                record.status = JobStatus::Failed;
                record.last_error = Some(ABANDONED_ERROR.to_string());
                record.updated_at = Utc::now();
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }
}

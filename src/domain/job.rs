use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConveyorError, Result};

/// Reserved argument key carrying the account a job calls out on behalf of.
pub const ARG_ACCOUNT_ID: &str = "account_id";
/// Reserved argument key carrying the canonical API system name.
pub const ARG_API_SYSTEM: &str = "api_system";

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, never claimed
    Pending,
    /// Claimed by a worker, handler may be executing
    Running,
    /// Handler finished successfully (or failure was classified Ignore)
    Completed,
    /// Handler failed fatally
    Failed,
    /// Returned to the queue by a deferral or retry
    Reset,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Reset => "reset",
        }
    }

    /// Due statuses are eligible for `claim_next_due`.
    pub fn is_due(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Reset)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = ConveyorError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "reset" => Ok(JobStatus::Reset),
            other => Err(ConveyorError::Validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// One unit of schedulable work, owned by the job store.
///
/// Workers hold a transient reference while executing; all mutation goes
/// through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    /// Identifies which registered handler to invoke
    pub job_type: String,
    /// Logical lane for worker assignment
    pub queue_name: String,
    /// Opaque payload passed to the handler (flat key -> value object)
    pub arguments: Value,
    pub status: JobStatus,
    /// Ordinal within the block; None for unordered jobs
    pub position: Option<i32>,
    /// Grouping identifier shared by all jobs of one workflow instance
    pub block_id: Option<Uuid>,
    /// Execution attempts against the handler; deferrals are not counted
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Retry backoff gate; claim skips the record until this has elapsed
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Account the job acts on behalf of, read from the reserved argument key.
    pub fn account_id(&self) -> Option<&str> {
        self.arguments.get(ARG_ACCOUNT_ID).and_then(|v| v.as_str())
    }

    /// Canonical API system name, read from the reserved argument key.
    pub fn api_system(&self) -> Option<&str> {
        self.arguments.get(ARG_API_SYSTEM).and_then(|v| v.as_str())
    }

    /// Whether this job calls an external API (and so passes the limiter gate).
    pub fn is_api_bound(&self) -> bool {
        self.account_id().is_some() && self.api_system().is_some()
    }
}

/// Enqueue request; the only way new records enter the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub queue_name: String,
    pub arguments: Value,
    pub position: Option<i32>,
    pub block_id: Option<Uuid>,
}

impl NewJob {
    /// An independent job with no ordering constraints.
    pub fn unordered(job_type: impl Into<String>, queue_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            job_type: job_type.into(),
            queue_name: queue_name.into(),
            arguments,
            position: None,
            block_id: None,
        }
    }

    /// A job at a given position inside an ordered block.
    pub fn in_block(
        job_type: impl Into<String>,
        queue_name: impl Into<String>,
        arguments: Value,
        block_id: Uuid,
        position: i32,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            queue_name: queue_name.into(),
            arguments,
            position: Some(position),
            block_id: Some(block_id),
        }
    }

    /// Enforce the block/position pairing invariant.
    pub fn validate(&self) -> Result<()> {
        match (self.position, self.block_id) {
            (Some(pos), Some(_)) if pos < 1 => Err(ConveyorError::Validation(format!(
                "block position must start at 1, got {pos}"
            ))),
            (Some(_), None) => Err(ConveyorError::Validation(
                "position set without a block_id".to_string(),
            )),
            (None, Some(_)) => Err(ConveyorError::Validation(
                "block_id set without a position".to_string(),
            )),
            _ => {
                if !self.arguments.is_object() {
                    return Err(ConveyorError::Validation(
                        "job arguments must be a JSON object".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

//! Job record store: the durable table of queued/running/completed jobs.
//!
//! Two implementations share one contract: `PostgresJobStore` for production
//! and `MemoryJobStore` for dry-run mode and tests. All status mutation goes
//! through the store; workers never write records directly.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::{JobRecord, NewJob};
use crate::error::Result;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

/// Error text recorded when the stale sweep abandons a record.
pub const ABANDONED_ERROR: &str = "abandoned: no update within staleness threshold";

/// Contract for the job record table.
///
/// Concurrency: `claim_next_due` must never hand the same record to two
/// concurrent callers; the claim succeeds only if the row was still due at
/// update time. `completed` and `failed` are terminal.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a record in `pending`. The sole external write surface.
    async fn enqueue(&self, new: NewJob) -> Result<JobRecord>;

    /// Atomically select one due record for the queue (FIFO by id) and flip
    /// it to `running`. Returns None when nothing is due.
    async fn claim_next_due(&self, queue_name: &str) -> Result<Option<JobRecord>>;

    /// Terminal success. `last_error` is set when an Ignore-classified
    /// failure completes the record anyway.
    async fn mark_completed(&self, id: i64, last_error: Option<String>) -> Result<()>;

    /// Terminal failure.
    async fn mark_failed(&self, id: i64, error: String) -> Result<()>;

    /// Return a running record to the queue without counting an attempt.
    /// `not_before` gates the next claim for retry backoff; deferrals pass
    /// None.
    async fn reset_to_pending(&self, id: i64, not_before: Option<DateTime<Utc>>) -> Result<()>;

    /// Bump the attempt counter; called by the executor immediately before
    /// invoking the handler, never by deferrals. Returns the new count.
    async fn increment_attempts(&self, id: i64) -> Result<i32>;

    async fn get(&self, id: i64) -> Result<Option<JobRecord>>;

    /// Look up the record at `(block_id, position)`, used by the sequencer
    /// to check a predecessor.
    async fn find_block_sibling(&self, block_id: Uuid, position: i32)
        -> Result<Option<JobRecord>>;

    /// Mark due records with no update within `older_than` as failed with a
    /// timeout error. Returns the number of records abandoned.
    async fn abandon_stale(&self, older_than: Duration) -> Result<u64>;
}

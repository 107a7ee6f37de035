//! Ordered-execution gate for workflow blocks.
//!
//! A record at position k inside a block may only run once the record at
//! position k-1 is completed. The gate is a read-check: a non-runnable
//! record is deferred back to the queue by the executor and re-checked on
//! its next claim, so completion of the predecessor unblocks it on the next
//! poll. No push notification and no cross-block locking are needed.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{JobRecord, JobStatus};
use crate::error::Result;
use crate::store::JobStore;

pub struct Sequencer {
    store: Arc<dyn JobStore>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Whether the record's predecessor (if any) is completed.
    ///
    /// Unordered records and the first position of a block are always
    /// runnable. A missing predecessor record is treated as runnable.
    pub async fn is_runnable(&self, record: &JobRecord) -> Result<bool> {
        let (Some(position), Some(block_id)) = (record.position, record.block_id) else {
            return Ok(true);
        };
        if position <= 1 {
            return Ok(true);
        }

        match self.store.find_block_sibling(block_id, position - 1).await? {
            None => Ok(true),
            Some(predecessor) if predecessor.status == JobStatus::Completed => Ok(true),
            Some(predecessor) => {
                debug!(
                    id = record.id,
                    block = %block_id,
                    position,
                    predecessor_status = %predecessor.status,
                    "predecessor not completed, deferring"
                );
                Ok(false)
            }
        }
    }
}

//! Workflow builders: enqueue a short ordered chain of jobs sharing one
//! block id. The store's enqueue API is the only write surface used here.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::domain::{JobRecord, NewJob, ARG_ACCOUNT_ID, ARG_API_SYSTEM};
use crate::error::{ConveyorError, Result};
use crate::store::JobStore;

pub struct WorkflowBuilder {
    store: Arc<dyn JobStore>,
    queue_name: String,
}

impl WorkflowBuilder {
    pub fn new(store: Arc<dyn JobStore>, queue_name: impl Into<String>) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
        }
    }

    /// Stage an ordered block of jobs.
    pub fn block(&self) -> BlockBuilder<'_> {
        BlockBuilder {
            builder: self,
            steps: Vec::new(),
        }
    }

    /// Enqueue a single independent order placement.
    pub async fn place_order(
        &self,
        account_id: &str,
        api_system: &str,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<JobRecord> {
        self.store
            .enqueue(NewJob::unordered(
                "place_order",
                self.queue_name.as_str(),
                json!({
                    ARG_ACCOUNT_ID: account_id,
                    ARG_API_SYSTEM: api_system,
                    "symbol": symbol,
                    "price": price.to_string(),
                    "quantity": quantity.to_string(),
                }),
            ))
            .await
    }

    /// Cancel an existing order, then place its replacement. The place step
    /// cannot run until the cancel step has completed.
    pub async fn replace_order(
        &self,
        account_id: &str,
        api_system: &str,
        cancel_order_id: &str,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Vec<JobRecord>> {
        self.block()
            .step(
                "cancel_order",
                json!({
                    ARG_ACCOUNT_ID: account_id,
                    ARG_API_SYSTEM: api_system,
                    "order_id": cancel_order_id,
                }),
            )
            .step(
                "place_order",
                json!({
                    ARG_ACCOUNT_ID: account_id,
                    ARG_API_SYSTEM: api_system,
                    "symbol": symbol,
                    "price": price.to_string(),
                    "quantity": quantity.to_string(),
                }),
            )
            .commit()
            .await
    }
}

/// Staged steps of one workflow instance; `commit` assigns the block id and
/// positions 1..N and enqueues them in order.
pub struct BlockBuilder<'a> {
    builder: &'a WorkflowBuilder,
    steps: Vec<(String, Value)>,
}

impl BlockBuilder<'_> {
    pub fn step(mut self, job_type: impl Into<String>, arguments: Value) -> Self {
        self.steps.push((job_type.into(), arguments));
        self
    }

    pub async fn commit(self) -> Result<Vec<JobRecord>> {
        if self.steps.is_empty() {
            return Err(ConveyorError::Validation(
                "workflow block has no steps".to_string(),
            ));
        }

        let block_id = Uuid::new_v4();
        let mut records = Vec::with_capacity(self.steps.len());
        for (idx, (job_type, arguments)) in self.steps.into_iter().enumerate() {
            let record = self
                .builder
                .store
                .enqueue(NewJob::in_block(
                    job_type,
                    self.builder.queue_name.as_str(),
                    arguments,
                    block_id,
                    idx as i32 + 1,
                ))
                .await?;
            records.push(record);
        }

        info!(block = %block_id, steps = records.len(), "workflow block enqueued");
        Ok(records)
    }
}

//! Domain handler contract consumed by the executor.
//!
//! A handler is a callable keyed by `job_type`. "Apiable" behavior (rate
//! limiting, failure classification) is not inherited by handlers; the
//! executor wraps every invocation uniformly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{JobFailure, JobRecord, NewJob};
use crate::rate_limiter::RateLimiter;

/// Execution context handed to a handler.
pub struct JobContext {
    /// Account the job acts on behalf of; None for non-API jobs
    pub account_id: Option<String>,
    /// Canonical API system name; None for non-API jobs
    pub api_system: Option<String>,
    /// Which execution attempt this is (1-based)
    pub attempt: u32,
    /// Limiter handle, for handlers that make more than one call
    pub rate_limiter: Arc<RateLimiter>,
}

impl JobContext {
    pub fn from_record(record: &JobRecord, attempt: u32, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            account_id: record.account_id().map(str::to_string),
            api_system: record.api_system().map(str::to_string),
            attempt,
            rate_limiter,
        }
    }

    /// (api_system, account_id) when the job is API-bound.
    pub fn api_key(&self) -> Option<(&str, &str)> {
        match (self.api_system.as_deref(), self.account_id.as_deref()) {
            (Some(api), Some(account)) => Some((api, account)),
            _ => None,
        }
    }
}

/// Successful handler result.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Workflow continuation: records to enqueue after completion
    pub follow_ups: Vec<NewJob>,
    /// Response code observed from the API system, if any
    pub response_code: Option<u16>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    pub fn with_follow_up(mut self, job: NewJob) -> Self {
        self.follow_ups.push(job);
        self
    }
}

/// A registered domain handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job. Failures carry an optional response code and a
    /// disposition tag that steer classification.
    async fn execute(
        &self,
        ctx: &JobContext,
        arguments: &Value,
    ) -> std::result::Result<Outcome, JobFailure>;

    /// Rollback hook, invoked exactly once when a failure is classified
    /// Abort. Default is a no-op.
    async fn resolve(&self, _ctx: &JobContext, _arguments: &Value) {}
}

/// Maps `job_type` to its handler. Built once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub mod classifier;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod handler;
pub mod logging;
pub mod rate_limiter;
pub mod sequencer;
pub mod store;
pub mod workflow;

pub use classifier::{
    Action, Backoff, ExceptionClassifier, ExceptionPolicy, PolicyRegistry, RetryPolicy,
};
pub use config::AppConfig;
pub use domain::{Disposition, JobFailure, JobRecord, JobStatus, NewJob};
pub use error::{ConveyorError, Result};
pub use executor::{CycleResult, Worker, WorkerConfig, WorkerStats};
pub use handler::{HandlerRegistry, JobContext, JobHandler, Outcome};
pub use rate_limiter::{RateLimiter, Slot};
pub use sequencer::Sequencer;
pub use store::{JobStore, MemoryJobStore, PostgresJobStore};
pub use workflow::{BlockBuilder, WorkflowBuilder};

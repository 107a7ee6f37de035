//! Domain types for the orchestration engine: job records, statuses, and
//! classifiable failures.

pub mod failure;
pub mod job;

pub use failure::{Disposition, JobFailure};
pub use job::{JobRecord, JobStatus, NewJob, ARG_ACCOUNT_ID, ARG_API_SYSTEM};

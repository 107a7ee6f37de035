use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag on a failure that bypasses code-based classification.
///
/// `End` marks a benign, expected condition (e.g. a duplicate-order rejection)
/// that should stop the job without disturbing the surrounding workflow.
/// `Resolve` skips any remaining retries and goes straight to the rollback
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Normal,
    End,
    Resolve,
}

impl Default for Disposition {
    fn default() -> Self {
        Self::Normal
    }
}

/// A classifiable failure raised by a job handler.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    /// Response code observed from the API system, if any
    pub response_code: Option<u16>,
    pub disposition: Disposition,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response_code: None,
            disposition: Disposition::Normal,
        }
    }

    /// A benign failure: the job ends, the workflow continues.
    pub fn end(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response_code: None,
            disposition: Disposition::End,
        }
    }

    /// A failure that must go straight to rollback, skipping retries.
    pub fn resolve(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response_code: None,
            disposition: Disposition::Resolve,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }
}

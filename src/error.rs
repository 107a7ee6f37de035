use thiserror::Error;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum ConveyorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Job lifecycle errors
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("No handler registered for job type: {0}")]
    HandlerNotFound(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ConveyorError
pub type Result<T> = std::result::Result<T, ConveyorError>;

use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A schedule record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule for {job}: {reason}")]
    InvalidSchedule { job: String, reason: String },

    /// Two registered jobs share a name.
    #[error("Duplicate job name: {name}")]
    DuplicateJob { name: String },

    /// No job with the given name is registered.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// The coordination store cannot be used right now.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

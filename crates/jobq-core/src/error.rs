use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, JobError>;

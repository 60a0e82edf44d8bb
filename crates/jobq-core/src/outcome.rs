use serde::{Deserialize, Serialize};

/// Value returned by every task handler.
///
/// Retry classification is part of the return value: handlers never signal
/// retry behaviour by panicking or by error type.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome<T = serde_json::Value> {
    Success(T),
    /// Timeout, network, resource exhaustion; retried with backoff
    TransientFailure(String),
    /// Validation or business-rule violation; dead-lettered immediately
    PermanentFailure(String),
}

impl<T> HandlerOutcome<T> {
    pub fn transient(reason: impl Into<String>) -> Self {
        HandlerOutcome::TransientFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        HandlerOutcome::PermanentFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> HandlerOutcome<U> {
        match self {
            HandlerOutcome::Success(value) => HandlerOutcome::Success(f(value)),
            HandlerOutcome::TransientFailure(r) => HandlerOutcome::TransientFailure(r),
            HandlerOutcome::PermanentFailure(r) => HandlerOutcome::PermanentFailure(r),
        }
    }

    pub fn into_result(self) -> Result<T, TaskFailure> {
        match self {
            HandlerOutcome::Success(value) => Ok(value),
            HandlerOutcome::TransientFailure(reason) => Err(TaskFailure::transient(reason)),
            HandlerOutcome::PermanentFailure(reason) => Err(TaskFailure::permanent(reason)),
        }
    }
}

/// Failure classification applied at the worker boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Transient,
    Permanent,
    /// Handler panicked or otherwise failed without classifying itself;
    /// retried under a stricter attempt budget
    Unclassified,
    /// Checkpoint disagrees with committed data; the job halts
    CheckpointCorruption,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl TaskFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        TaskFailure {
            kind: FailureKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        TaskFailure {
            kind: FailureKind::Permanent,
            reason: reason.into(),
        }
    }

    pub fn unclassified(reason: impl Into<String>) -> Self {
        TaskFailure {
            kind: FailureKind::Unclassified,
            reason: reason.into(),
        }
    }

    pub fn checkpoint_corruption(reason: impl Into<String>) -> Self {
        TaskFailure {
            kind: FailureKind::CheckpointCorruption,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

/// Stable error code exposed by the status API instead of raw error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TransientExhausted,
    PermanentFailure,
    UnclassifiedExhausted,
    CheckpointCorruption,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TransientExhausted => "TRANSIENT_EXHAUSTED",
            ErrorCode::PermanentFailure => "PERMANENT_FAILURE",
            ErrorCode::UnclassifiedExhausted => "UNCLASSIFIED_EXHAUSTED",
            ErrorCode::CheckpointCorruption => "CHECKPOINT_CORRUPTION",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }
}

impl From<FailureKind> for ErrorCode {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient => ErrorCode::TransientExhausted,
            FailureKind::Permanent => ErrorCode::PermanentFailure,
            FailureKind::Unclassified => ErrorCode::UnclassifiedExhausted,
            FailureKind::CheckpointCorruption => ErrorCode::CheckpointCorruption,
        }
    }
}

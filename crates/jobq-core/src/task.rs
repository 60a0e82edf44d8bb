use crate::{JobError, JobId, Result, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Task type identifier, resolved against the handler registry
pub type TaskType = String;

/// Task payload (arbitrary JSON document)
pub type TaskPayload = serde_json::Value;

/// Execution status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending,
    /// Held by a worker slot
    InProgress,
    /// Handler succeeded
    Succeeded,
    /// Last attempt failed; either retried (back to pending) or dead-lettered
    Failed,
    /// Exhausted retries or failed permanently
    Dead,
    /// Cancelled at a task or chunk boundary
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Dead => "DEAD",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "SUCCEEDED" => Some(TaskStatus::Succeeded),
            "FAILED" => Some(TaskStatus::Failed),
            "DEAD" => Some(TaskStatus::Dead),
            "CANCELLED" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Dead | TaskStatus::Cancelled
        )
    }

    /// Allowed edges of the task state machine.
    ///
    /// `InProgress -> InProgress` is a lease takeover after the previous
    /// holder crashed; `Dead -> Pending` only happens through a manual
    /// dead-letter requeue.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (InProgress, Cancelled)
                | (Failed, Pending)
                | (Failed, Dead)
                | (Dead, Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of execution owned by the worker pool while it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Caller-visible job this task executes
    pub job_id: JobId,

    /// Task type name (e.g., "ledger.debit")
    pub task_type: TaskType,

    /// Key under which side effects are deduplicated
    pub idempotency_key: String,

    /// Task payload
    pub payload: TaskPayload,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Number of executions started so far
    pub attempts: u32,

    pub status: TaskStatus,

    /// Reason of the most recent failed attempt
    pub last_error: Option<String>,

    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task builder
    pub fn builder(task_type: impl Into<TaskType>, payload: TaskPayload) -> TaskBuilder {
        TaskBuilder::new(task_type.into(), payload)
    }

    fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Start (or take over) an execution attempt
    pub fn begin_attempt(&mut self) -> Result<()> {
        self.transition(TaskStatus::InProgress)?;
        self.attempts += 1;
        Ok(())
    }

    /// Pending -> InProgress without counting an attempt, used when the
    /// outcome is replayed from the dedup ledger instead of executed
    pub fn resume(&mut self) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(JobError::InvalidTransition {
                from: self.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
            });
        }
        self.transition(TaskStatus::InProgress)
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Failed -> Pending for another attempt
    pub fn retry(&mut self) -> Result<()> {
        self.transition(TaskStatus::Pending)
    }

    /// Failed -> Dead
    pub fn bury(&mut self) -> Result<()> {
        self.transition(TaskStatus::Dead)
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(TaskStatus::Cancelled)
    }

    /// Release an in-progress task whose worker died
    pub fn release(&mut self) -> Result<()> {
        if self.status != TaskStatus::InProgress {
            return Err(JobError::InvalidTransition {
                from: self.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.transition(TaskStatus::Pending)
    }

    /// Dead -> Pending with a fresh attempt budget
    pub fn requeue(&mut self) -> Result<()> {
        if self.status != TaskStatus::Dead {
            return Err(JobError::InvalidTransition {
                from: self.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.transition(TaskStatus::Pending)?;
        self.attempts = 0;
        self.completed_at = None;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Builder for creating tasks with custom configuration
pub struct TaskBuilder {
    task_type: TaskType,
    payload: TaskPayload,
    job_id: Option<JobId>,
    idempotency_key: Option<String>,
}

impl TaskBuilder {
    pub fn new(task_type: TaskType, payload: TaskPayload) -> Self {
        TaskBuilder {
            task_type,
            payload,
            job_id: None,
            idempotency_key: None,
        }
    }

    pub fn job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn build(self) -> Result<Task> {
        let size = serde_json::to_vec(&self.payload)?.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(JobError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: size,
            });
        }

        let idempotency_key = match self.idempotency_key {
            Some(key) if key.trim().is_empty() => {
                return Err(JobError::InvalidPayload(
                    "idempotency key must not be blank".to_string(),
                ))
            }
            Some(key) => key,
            None => crate::derive_idempotency_key(&self.task_type, &self.payload),
        };

        let now = Utc::now();
        Ok(Task {
            id: Uuid::new_v4(),
            job_id: self.job_id.unwrap_or_else(Uuid::new_v4),
            task_type: self.task_type,
            idempotency_key,
            payload: self.payload,
            created_at: now,
            updated_at: now,
            attempts: 0,
            status: TaskStatus::Pending,
            last_error: None,
            completed_at: None,
        })
    }
}

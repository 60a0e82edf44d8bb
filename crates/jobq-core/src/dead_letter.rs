use crate::{ErrorCode, JobId, Task, TaskId, TaskPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task parked for manual inspection after exhausting retries or failing
/// permanently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub original_task_id: TaskId,
    pub job_id: JobId,
    pub task_type: String,
    pub payload: TaskPayload,
    pub failure_reason: String,
    pub error_code: ErrorCode,
    pub attempts: u32,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_task(task: &Task, reason: impl Into<String>, error_code: ErrorCode) -> Self {
        DeadLetterEntry {
            id: Uuid::new_v4(),
            original_task_id: task.id,
            job_id: task.job_id,
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            failure_reason: reason.into(),
            error_code,
            attempts: task.attempts,
            moved_at: Utc::now(),
        }
    }
}

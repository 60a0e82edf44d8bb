use crate::{ErrorCode, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-visible job identifier
pub type JobId = Uuid;

/// Externally visible job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Dead,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Dead => "DEAD",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead | JobStatus::Cancelled
        )
    }

    /// Aggregate status of a bulk job from its chunks.
    ///
    /// Returns `None` while at least one chunk is still pending and none has
    /// failed.
    pub fn from_chunks(chunks: &[Chunk]) -> Option<JobStatus> {
        if chunks.iter().any(|c| c.status == ChunkStatus::Failed) {
            return Some(JobStatus::Failed);
        }
        if chunks.iter().all(|c| c.status == ChunkStatus::Succeeded) {
            return Some(JobStatus::Succeeded);
        }
        None
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the work behind a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobKind {
    /// One task, one handler invocation
    Simple,
    /// One task whose records are executed chunk by chunk
    #[serde(rename_all = "camelCase")]
    Bulk { total_records: u64, chunk_size: u64 },
}

impl JobKind {
    pub fn chunk_count(&self) -> u64 {
        match self {
            JobKind::Simple => 0,
            JobKind::Bulk {
                total_records,
                chunk_size,
            } => {
                if *chunk_size == 0 {
                    0
                } else {
                    total_records.div_ceil(*chunk_size)
                }
            }
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, JobKind::Bulk { .. })
    }

    /// Split a bulk job into its ordered chunk plan
    pub fn plan(&self, job_id: JobId) -> Vec<Chunk> {
        let JobKind::Bulk {
            total_records,
            chunk_size,
        } = *self
        else {
            return Vec::new();
        };

        (0..self.chunk_count())
            .map(|index| {
                let start = index * chunk_size;
                let end = (start + chunk_size).min(total_records);
                Chunk {
                    job_id,
                    chunk_index: index,
                    record_range: RecordRange { start, end },
                    status: ChunkStatus::Pending,
                    checkpoint_offset: 0,
                }
            })
            .collect()
    }
}

/// A job as seen by callers polling for status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub kind: JobKind,
    pub callback_url: Option<String>,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<ErrorCode>,

    /// Number of committed chunks; the next chunk to run
    pub checkpoint_offset: u64,

    /// Set by a cancel request, honoured at the next task or chunk boundary
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: JobId, task_id: TaskId, kind: JobKind, callback_url: Option<String>) -> Self {
        let now = Utc::now();
        Job {
            job_id,
            task_id,
            kind,
            callback_url,
            status: JobStatus::Pending,
            result: None,
            error_code: None,
            checkpoint_offset: 0,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Half-open range of record offsets `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRange {
    pub start: u64,
    pub end: u64,
}

impl RecordRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Bounded slice of a bulk job, committed as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub job_id: JobId,
    pub chunk_index: u64,
    pub record_range: RecordRange,
    pub status: ChunkStatus,
    /// Record offset reached once this chunk committed (its range end)
    pub checkpoint_offset: u64,
}

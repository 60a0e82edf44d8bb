//! Shared state of the job system: the deduplication ledger and the
//! checkpoint/result store.
//!
//! Both are the only points of cross-worker mutable state, so every trait
//! method here is a single atomic operation. Callers never read, modify and
//! write back a record themselves.

mod memory;
mod store;

pub use memory::MemoryStore;
pub use store::{RocksStore, RocksStoreConfig};

use chrono::{DateTime, Duration, Utc};
use jobq_core::{
    Chunk, DeadLetterEntry, DedupRecord, ErrorCode, Job, JobId, JobStatus, ResultSummary, Task,
    TaskId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("Job error: {0}")]
    JobError(#[from] jobq_core::JobError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Dead-letter entry not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Checkpoint corruption for job {job_id}: {detail}")]
    CheckpointCorruption { job_id: JobId, detail: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Result of the atomic insert-if-absent on the dedup ledger
#[derive(Debug, Clone, PartialEq)]
pub enum DedupCheck {
    /// The caller now holds the in-flight claim for the key
    New(DedupRecord),
    /// Another delivery completed or is executing this key
    Duplicate(DedupRecord),
}

impl DedupCheck {
    pub fn is_new(&self) -> bool {
        matches!(self, DedupCheck::New(_))
    }
}

/// Idempotency ledger keyed by idempotency key
pub trait DedupStore: Send + Sync {
    /// Atomically claim `key` for `owner` unless a live record already exists.
    ///
    /// Expired records, in-flight claims whose lease lapsed and claims already
    /// held by `owner` are replaced.
    fn check_and_mark(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
        ttl: Duration,
    ) -> Result<DedupCheck>;

    /// Extend `owner`'s in-flight claim by `lease` from now. Returns false
    /// when the claim was taken over or closed, after which the caller must
    /// stop executing.
    fn renew(&self, key: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Record that side effects for `key` were applied. Refused (false) when
    /// another owner holds the claim.
    fn complete(
        &self,
        key: &str,
        owner: &str,
        summary: ResultSummary,
        ttl: Duration,
    ) -> Result<bool>;

    /// Drop an in-flight claim held by `owner` so a retry can claim it again.
    /// Returns false when the claim belongs to someone else or is gone.
    fn release(&self, key: &str, owner: &str) -> Result<bool>;

    /// Remove the record regardless of state (manual dead-letter requeue)
    fn forget(&self, key: &str) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<DedupRecord>>;

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created,
    /// A task with the same idempotency key already exists
    Existing { job: Job, task: Task },
}

/// One output row written by a chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkWrite {
    pub key: String,
    pub value: serde_json::Value,
}

impl ChunkWrite {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        ChunkWrite {
            key: key.into(),
            value,
        }
    }
}

/// Writes of one chunk plus the checkpoint advance, committed together
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCommit {
    pub job_id: JobId,
    pub chunk_index: u64,
    pub writes: Vec<ChunkWrite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { checkpoint_offset: u64 },
    /// The checkpoint had already moved past this chunk; nothing was written
    AlreadyCommitted { checkpoint_offset: u64 },
}

/// Checkpoint / result store: tasks, jobs, chunks, chunk outputs and
/// dead-letter entries
pub trait ResultStore: Send + Sync {
    /// Insert a PENDING job and its task, enforcing the unique idempotency key
    fn create_job(&self, job: Job, task: Task) -> Result<CreateOutcome>;

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>>;

    fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>>;

    /// Latest committed status of a job
    fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>>;

    /// PENDING/IN_PROGRESS -> IN_PROGRESS, attempts + 1, job -> RUNNING
    fn begin_attempt(&self, task_id: &TaskId) -> Result<(Task, Job)>;

    /// IN_PROGRESS -> FAILED -> PENDING, job -> PENDING
    fn record_retry(&self, task_id: &TaskId, error: &str) -> Result<Task>;

    /// Set the job's status and result, moving its task along with it
    fn record_result(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_code: Option<ErrorCode>,
    ) -> Result<Job>;

    /// Flag a job for cancellation. A job nobody has picked up yet is
    /// cancelled immediately; the flag reports whether that happened.
    fn request_cancel(&self, job_id: &JobId) -> Result<(Job, bool)>;

    /// Honour a cancel request at a task or chunk boundary
    fn mark_cancelled(&self, job_id: &JobId) -> Result<Job> {
        self.record_result(job_id, JobStatus::Cancelled, None, Some(ErrorCode::Cancelled))
    }

    /// Persist the chunk plan once; later calls return the stored plan
    fn plan_chunks(&self, job_id: &JobId, plan: Vec<Chunk>) -> Result<Vec<Chunk>>;

    fn list_chunks(&self, job_id: &JobId) -> Result<Vec<Chunk>>;

    /// Commit chunk writes, chunk status and job checkpoint atomically.
    ///
    /// The job checkpoint must equal `commit.chunk_index`; a checkpoint beyond
    /// it yields `AlreadyCommitted`, one before it is corruption.
    fn record_chunk_checkpoint(&self, commit: ChunkCommit) -> Result<CommitOutcome>;

    fn chunk_outputs(&self, job_id: &JobId) -> Result<Vec<ChunkWrite>>;

    /// Move a failed task to the dead-letter store (task -> DEAD, job ->
    /// DEAD, or FAILED for checkpoint corruption)
    fn dead_letter(&self, task_id: &TaskId, reason: &str, code: ErrorCode)
        -> Result<DeadLetterEntry>;

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>>;

    /// Remove an entry and reset its task to PENDING with zero attempts
    fn requeue_dead_letter(&self, id: &Uuid) -> Result<Task>;

    /// Release IN_PROGRESS tasks left by a crashed process and return every
    /// PENDING task so it can be republished
    fn recover_in_flight(&self) -> Result<Vec<Task>>;

    /// Drop succeeded/cancelled tasks (and their jobs, chunks and outputs)
    /// that completed before `older_than`. Dead tasks stay for requeue.
    fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// Check that a job's chunk records agree with its checkpoint
pub fn verify_checkpoint(job: &Job, chunks: &[Chunk]) -> Result<()> {
    use jobq_core::ChunkStatus;

    for chunk in chunks {
        let committed = chunk.chunk_index < job.checkpoint_offset;
        let consistent = match chunk.status {
            ChunkStatus::Succeeded => committed && chunk.checkpoint_offset == chunk.record_range.end,
            ChunkStatus::Pending => !committed,
            ChunkStatus::Failed => !committed,
        };
        if !consistent {
            return Err(PersistenceError::CheckpointCorruption {
                job_id: job.job_id,
                detail: format!(
                    "chunk {} is {:?} but checkpoint is {}",
                    chunk.chunk_index, chunk.status, job.checkpoint_offset
                ),
            });
        }
    }

    if job.checkpoint_offset > chunks.len() as u64 {
        return Err(PersistenceError::CheckpointCorruption {
            job_id: job.job_id,
            detail: format!(
                "checkpoint {} beyond {} planned chunks",
                job.checkpoint_offset,
                chunks.len()
            ),
        });
    }

    Ok(())
}

/// Status a task moves to when its job is set to `status`
fn apply_job_status(task: &mut Task, status: JobStatus, error: Option<&str>) -> Result<()> {
    use jobq_core::TaskStatus;

    if status.is_terminal() && task.status == TaskStatus::Pending && status != JobStatus::Cancelled {
        task.resume()?;
    }

    match status {
        JobStatus::Succeeded if task.status != TaskStatus::Succeeded => task.succeed()?,
        JobStatus::Cancelled if task.status != TaskStatus::Cancelled => task.cancel()?,
        JobStatus::Failed | JobStatus::Dead if task.status != TaskStatus::Dead => {
            if task.status == TaskStatus::InProgress {
                task.fail(error.unwrap_or("failed"))?;
            }
            task.bury()?;
        }
        _ => {}
    }
    Ok(())
}

/// Reject a status change on a job that already finished differently
fn check_job_update(job: &Job, status: JobStatus) -> Result<()> {
    if job.is_terminal() && job.status != status {
        return Err(jobq_core::JobError::InvalidTransition {
            from: job.status.to_string(),
            to: status.to_string(),
        }
        .into());
    }
    Ok(())
}

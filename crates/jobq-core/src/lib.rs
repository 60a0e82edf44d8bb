mod task;
mod job;
mod dedup;
mod dead_letter;
mod outcome;
mod error;

pub use task::{Task, TaskBuilder, TaskId, TaskType, TaskPayload, TaskStatus};
pub use job::{Chunk, ChunkStatus, Job, JobId, JobKind, JobStatus, RecordRange};
pub use dedup::{derive_idempotency_key, DedupRecord, DedupState, ResultSummary};
pub use dead_letter::DeadLetterEntry;
pub use outcome::{ErrorCode, FailureKind, HandlerOutcome, TaskFailure};
pub use error::{JobError, Result};

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB

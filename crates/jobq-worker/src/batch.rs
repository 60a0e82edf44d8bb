//! Chunked execution of bulk jobs.
//!
//! Chunks run in order starting at the job's checkpoint. Each chunk's writes
//! are committed together with the checkpoint advance, so after a crash the
//! job resumes at the first uncommitted chunk and no committed chunk runs
//! twice.

use crate::executor::TaskExecutor;
use crate::handler::{BatchHandler, TaskContext};
use crate::lease::ClaimLease;
use jobq_core::{Job, JobStatus, Task, TaskFailure};
use jobq_persistence::{
    verify_checkpoint, ChunkCommit, CommitOutcome, PersistenceError, ResultStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed { result: Value },
    /// A cancel request was honoured before the next chunk started
    Cancelled { checkpoint_offset: u64 },
    /// Another delivery took over the dedup claim; nothing more was run
    ClaimLost { checkpoint_offset: u64 },
}

pub struct BatchEngine {
    store: Arc<dyn ResultStore>,
    executor: TaskExecutor,
}

impl BatchEngine {
    pub fn new(store: Arc<dyn ResultStore>, executor: TaskExecutor) -> Self {
        BatchEngine { store, executor }
    }

    pub async fn run(
        &self,
        job: &Job,
        task: &Task,
        handler: Arc<dyn BatchHandler>,
        ctx: &TaskContext,
        lease: &ClaimLease,
    ) -> Result<BatchOutcome, TaskFailure> {
        let records = task
            .payload
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| TaskFailure::permanent("bulk payload has no records array"))?;

        let chunks = self
            .store
            .plan_chunks(&job.job_id, job.kind.plan(job.job_id))
            .map_err(store_failure)?;
        let mut current = self
            .store
            .get_job(&job.job_id)
            .map_err(store_failure)?
            .ok_or_else(|| TaskFailure::permanent("job disappeared"))?;
        verify_checkpoint(&current, &chunks).map_err(store_failure)?;

        if current.checkpoint_offset > 0 {
            info!(
                job_id = %job.job_id,
                checkpoint = current.checkpoint_offset,
                "Resuming bulk job from checkpoint"
            );
        }

        for chunk in chunks.iter().skip(current.checkpoint_offset as usize) {
            if current.cancel_requested {
                return Ok(BatchOutcome::Cancelled {
                    checkpoint_offset: current.checkpoint_offset,
                });
            }
            if !lease.renew().await.map_err(store_failure)? {
                return Ok(BatchOutcome::ClaimLost {
                    checkpoint_offset: current.checkpoint_offset,
                });
            }

            let start = chunk.record_range.start as usize;
            let end = chunk.record_range.end as usize;
            let slice = records.get(start..end).ok_or_else(|| {
                TaskFailure::permanent(format!(
                    "chunk {} covers records {}..{} but payload has {}",
                    chunk.chunk_index,
                    start,
                    end,
                    records.len()
                ))
            })?;

            let writes = self
                .executor
                .execute_chunk(handler.clone(), ctx.clone(), chunk.clone(), slice.to_vec())
                .await?;

            let commit = ChunkCommit {
                job_id: job.job_id,
                chunk_index: chunk.chunk_index,
                writes,
            };
            match self.store.record_chunk_checkpoint(commit).map_err(store_failure)? {
                CommitOutcome::Committed { checkpoint_offset } => {
                    debug!(
                        job_id = %job.job_id,
                        chunk = chunk.chunk_index,
                        checkpoint_offset,
                        "Chunk committed"
                    );
                }
                CommitOutcome::AlreadyCommitted { checkpoint_offset } => {
                    debug!(
                        job_id = %job.job_id,
                        chunk = chunk.chunk_index,
                        checkpoint_offset,
                        "Chunk already committed by another delivery, skipping"
                    );
                }
            }

            current = self
                .store
                .get_job(&job.job_id)
                .map_err(store_failure)?
                .ok_or_else(|| TaskFailure::permanent("job disappeared"))?;
        }

        let chunks = self.store.list_chunks(&job.job_id).map_err(store_failure)?;
        match JobStatus::from_chunks(&chunks) {
            Some(JobStatus::Succeeded) => Ok(BatchOutcome::Completed {
                result: json!({
                    "recordsProcessed": records.len(),
                    "chunks": chunks.len(),
                }),
            }),
            _ => Err(TaskFailure::checkpoint_corruption(format!(
                "job {} finished its chunk loop with uncommitted chunks",
                job.job_id
            ))),
        }
    }
}

/// Checkpoint disagreements halt the job; anything else from the store is
/// worth another attempt
fn store_failure(err: PersistenceError) -> TaskFailure {
    match err {
        PersistenceError::CheckpointCorruption { .. } => {
            TaskFailure::checkpoint_corruption(err.to_string())
        }
        other => TaskFailure::transient(format!("store error: {}", other)),
    }
}

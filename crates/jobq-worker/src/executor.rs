use crate::handler::{BatchHandler, TaskContext, TaskHandler};
use jobq_core::{Chunk, HandlerOutcome, TaskFailure, TaskPayload};
use jobq_persistence::ChunkWrite;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, warn};

/// Runs handlers under the wall-clock ceiling with panic recovery
#[derive(Debug, Clone, Copy)]
pub struct TaskExecutor {
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(timeout: Duration) -> Self {
        TaskExecutor { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a simple task
    pub async fn execute(
        &self,
        handler: Arc<dyn TaskHandler>,
        ctx: TaskContext,
        payload: TaskPayload,
    ) -> Result<Value, TaskFailure> {
        let label = format!("task {}", ctx.task_id);
        self.guarded(label, async move { handler.handle(&ctx, &payload).await })
            .await
    }

    /// Execute one chunk of a bulk job
    pub async fn execute_chunk(
        &self,
        handler: Arc<dyn BatchHandler>,
        ctx: TaskContext,
        chunk: Chunk,
        records: Vec<Value>,
    ) -> Result<Vec<ChunkWrite>, TaskFailure> {
        let label = format!("chunk {} of job {}", chunk.chunk_index, ctx.job_id);
        self.guarded(label, async move {
            handler.process_chunk(&ctx, &chunk, &records).await
        })
        .await
    }

    /// Run `fut` on its own tokio task so a panic surfaces as a join error
    /// instead of unwinding through the worker slot. Exceeding the timeout
    /// aborts the task and counts as transient.
    async fn guarded<T, F>(&self, label: String, fut: F) -> Result<T, TaskFailure>
    where
        T: Send + 'static,
        F: Future<Output = HandlerOutcome<T>> + Send + 'static,
    {
        let mut handle = tokio::spawn(fut);

        match timeout(self.timeout, &mut handle).await {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(e)) if e.is_panic() => {
                error!("{} panicked: {:?}", label, e);
                Err(TaskFailure::unclassified(format!("{} panicked", label)))
            }
            Ok(Err(_)) => Err(TaskFailure::unclassified(format!("{} was aborted", label))),
            Err(_) => {
                handle.abort();
                warn!("{} timed out after {:?}", label, self.timeout);
                Err(TaskFailure::transient(format!(
                    "execution timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

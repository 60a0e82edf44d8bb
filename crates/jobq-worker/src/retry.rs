use crate::WorkerError;
use jobq_core::{ErrorCode, FailureKind, Task, TaskFailure};
use jobq_persistence::{DedupStore, ResultStore};
use jobq_queue::{Queue, QueueMessage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Attempt budget and backoff curve
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Budget for failures the handler did not classify (panics); never
    /// more than `max_attempts`
    pub unclassified_max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            unclassified_max_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempts, cap)` before jitter
    pub fn raw_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts);
        Duration::from_millis(self.base_delay_ms)
            .saturating_mul(factor)
            .min(Duration::from_millis(self.max_delay_ms))
    }

    /// Upper bound (exclusive) of the jitter; kept below the base delay so
    /// consecutive delays keep growing until the cap
    pub fn jitter_bound(&self) -> u64 {
        self.jitter_ms.min(self.base_delay_ms.saturating_sub(1))
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        let bound = self.jitter_bound();
        let jitter = if bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..bound)
        };
        self.raw_delay(attempts) + Duration::from_millis(jitter)
    }

    fn budget(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Unclassified => self.unclassified_max_attempts.min(self.max_attempts),
            _ => self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter { code: ErrorCode },
}

/// Decides between retry and dead-letter, and drives manual requeue
pub struct RetryGovernor {
    policy: RetryPolicy,
    store: Arc<dyn ResultStore>,
    dedup: Arc<dyn DedupStore>,
    queue: Arc<dyn Queue>,
}

impl RetryGovernor {
    pub fn new(
        policy: RetryPolicy,
        store: Arc<dyn ResultStore>,
        dedup: Arc<dyn DedupStore>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        RetryGovernor {
            policy,
            store,
            dedup,
            queue,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `attempts` counts executions started so far, including the failed one
    pub fn decide(&self, failure: &TaskFailure, attempts: u32) -> RetryDecision {
        match failure.kind {
            FailureKind::Permanent | FailureKind::CheckpointCorruption => {
                RetryDecision::DeadLetter {
                    code: failure.kind.into(),
                }
            }
            kind if attempts >= self.policy.budget(kind) => RetryDecision::DeadLetter {
                code: kind.into(),
            },
            _ => RetryDecision::Retry {
                delay: self.policy.backoff(attempts),
            },
        }
    }

    /// Put a dead-lettered task back in the queue with a fresh attempt budget
    pub async fn requeue(&self, dead_letter_id: &Uuid) -> Result<Task, WorkerError> {
        let task = self.store.requeue_dead_letter(dead_letter_id)?;
        self.dedup.forget(&task.idempotency_key)?;
        self.queue.publish(QueueMessage::for_task(&task)).await?;

        info!(
            job_id = %task.job_id,
            task_id = %task.id,
            "Requeued dead-lettered task"
        );
        Ok(task)
    }
}

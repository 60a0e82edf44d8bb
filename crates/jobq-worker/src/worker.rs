use crate::{
    batch::{BatchEngine, BatchOutcome},
    callback::CallbackDelivery,
    config::WorkerConfig,
    executor::TaskExecutor,
    handler::{HandlerRegistry, RegisteredHandler, TaskContext},
    lease::ClaimLease,
    metrics::{HealthTracker, JobMetrics},
    retry::{RetryDecision, RetryGovernor},
    WorkerError,
};
use jobq_core::{
    DedupRecord, DedupState, ErrorCode, Job, JobStatus, ResultSummary, Task, TaskFailure,
};
use jobq_persistence::{DedupCheck, DedupStore, ResultStore};
use jobq_queue::{Delivery, Queue, QueueError};

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state the pool works against
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn Queue>,
    pub store: Arc<dyn ResultStore>,
    pub dedup: Arc<dyn DedupStore>,
}

/// Steps of the per-message state machine, used as a log field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    DedupCheck,
    Execute,
    SkipDuplicate,
    AckSuccess,
    ClassifyFailure,
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "RECEIVED",
            Stage::DedupCheck => "DEDUP_CHECK",
            Stage::Execute => "EXECUTE",
            Stage::SkipDuplicate => "SKIP_DUPLICATE",
            Stage::AckSuccess => "ACK_SUCCESS",
            Stage::ClassifyFailure => "CLASSIFY_FAILURE",
            Stage::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// How a single delivery was settled
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Succeeded,
    /// The key was already completed; the message was acked without running
    SkippedDuplicate,
    /// Another slot holds a live claim; the message comes back once it lapses
    DuplicateInFlight { retry_in: Duration },
    /// No task record for the message
    Orphaned,
    /// The job had already finished
    AlreadyTerminal,
    Cancelled,
    Retried { delay: Duration },
    DeadLettered { code: ErrorCode },
    /// Another delivery took over the claim mid-execution and owns the job now
    ClaimLost,
}

enum Execution {
    Completed(Value),
    Cancelled,
    ClaimLost,
}

/// Fixed number of slots consuming the queue
pub struct WorkerPool {
    config: WorkerConfig,
    worker_id: String,
    registry: HandlerRegistry,
    queue: Arc<dyn Queue>,
    store: Arc<dyn ResultStore>,
    dedup: Arc<dyn DedupStore>,
    executor: TaskExecutor,
    batch: BatchEngine,
    governor: Arc<RetryGovernor>,
    callbacks: CallbackDelivery,
    metrics: Arc<JobMetrics>,
    health: Arc<HealthTracker>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        registry: HandlerRegistry,
        backends: Backends,
        metrics: Arc<JobMetrics>,
        health: Arc<HealthTracker>,
    ) -> Result<Self, WorkerError> {
        let worker_id = config.generate_worker_id();
        let executor = TaskExecutor::new(config.task_timeout());
        let batch = BatchEngine::new(backends.store.clone(), executor);
        let governor = Arc::new(RetryGovernor::new(
            config.retry.clone(),
            backends.store.clone(),
            backends.dedup.clone(),
            backends.queue.clone(),
        ));
        let callbacks = CallbackDelivery::new(config.callback.clone(), metrics.clone())?;

        Ok(WorkerPool {
            config,
            worker_id,
            registry,
            queue: backends.queue,
            store: backends.store,
            dedup: backends.dedup,
            executor,
            batch,
            governor,
            callbacks,
            metrics,
            health,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn governor(&self) -> Arc<RetryGovernor> {
        self.governor.clone()
    }

    pub fn callbacks(&self) -> CallbackDelivery {
        self.callbacks.clone()
    }

    /// Run every slot until `shutdown` fires, then give in-flight messages
    /// up to the graceful shutdown timeout to finish
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting worker {} (concurrency: {})",
            self.worker_id, self.config.concurrency
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let pool = self.clone();
            let token = shutdown.clone();
            slots.spawn(async move { pool.slot_loop(slot, token).await });
        }

        shutdown.cancelled().await;
        info!("Worker shutting down gracefully");

        let deadline = Duration::from_secs(self.config.graceful_shutdown_timeout_secs);
        let drained = tokio::time::timeout(deadline, async {
            while slots.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Shutdown deadline exceeded, {} slots still busy",
                slots.len()
            );
            slots.abort_all();
        } else {
            info!("All slots stopped");
        }
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        let owner = format!("{}#{}", self.worker_id, slot);

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive() => received,
            };
            self.metrics.queue_depth.set(self.queue.depth() as i64);

            match received {
                Ok(Some(delivery)) => {
                    let task_id = delivery.message.task_id;
                    if let Err(e) = self.handle_delivery(&owner, delivery).await {
                        error!(task_id = %task_id, "Slot {} failed to settle delivery: {}", slot, e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Slot {} failed to receive: {}", slot, e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        debug!("Slot {} stopped", owner);
    }

    /// Drive one delivery through the state machine.
    ///
    /// An `Err` leaves the message unsettled; the queue redelivers it after
    /// the visibility timeout.
    pub async fn handle_delivery(
        &self,
        owner: &str,
        delivery: Delivery,
    ) -> Result<ProcessOutcome, WorkerError> {
        let message = &delivery.message;
        debug!(
            stage = %Stage::Received,
            job_id = %message.job_id,
            task_id = %message.task_id,
            delivery_count = delivery.delivery_count,
            "Message received"
        );

        let Some(task) = self.store.get_task(&message.task_id)? else {
            warn!(task_id = %message.task_id, "Orphan message without task record, acking");
            self.ack(&delivery).await;
            return Ok(ProcessOutcome::Orphaned);
        };
        let Some(job) = self.store.get_job(&task.job_id)? else {
            warn!(job_id = %task.job_id, "Orphan message without job record, acking");
            self.ack(&delivery).await;
            return Ok(ProcessOutcome::Orphaned);
        };

        if job.is_terminal() {
            debug!(job_id = %job.job_id, "Job already {}, acking", job.status);
            self.ack(&delivery).await;
            return Ok(if job.status == JobStatus::Cancelled {
                ProcessOutcome::Cancelled
            } else {
                ProcessOutcome::AlreadyTerminal
            });
        }
        if job.cancel_requested {
            return self.cancel_at_boundary(None, &task, &job, &delivery).await;
        }

        debug!(stage = %Stage::DedupCheck, job_id = %job.job_id, "Checking idempotency key");
        let check = self.dedup.check_and_mark(
            &task.idempotency_key,
            owner,
            self.config.claim_lease(),
            self.config.dedup_ttl(),
        )?;
        if let DedupCheck::Duplicate(record) = check {
            return self.skip_duplicate(&task, &job, record, &delivery).await;
        }

        let (task, job) = match self.store.begin_attempt(&task.id) {
            Ok(pair) => pair,
            Err(e) => {
                self.dedup.release(&task.idempotency_key, owner)?;
                return Err(e.into());
            }
        };
        debug!(
            stage = %Stage::Execute,
            job_id = %job.job_id,
            task_id = %task.id,
            attempt = task.attempts,
            "Executing {}",
            task.task_type
        );

        let lease = ClaimLease::new(
            self.dedup.clone(),
            self.queue.clone(),
            task.idempotency_key.clone(),
            owner,
            delivery.receipt,
            self.config.claim_lease(),
        );
        let started = Instant::now();
        let result = self.execute(&task, &job, &lease).await;
        self.metrics.observe_duration(started.elapsed());

        match result {
            Ok(Execution::Completed(result)) => {
                self.ack_success(owner, &task, &job, result, &delivery).await
            }
            Ok(Execution::Cancelled) => {
                self.cancel_at_boundary(Some(owner), &task, &job, &delivery)
                    .await
            }
            Ok(Execution::ClaimLost) => Ok(self.claim_lost(owner, &task, &delivery).await),
            Err(failure) => {
                self.classify_failure(owner, &task, &job, failure, &delivery)
                    .await
            }
        }
    }

    async fn execute(
        &self,
        task: &Task,
        job: &Job,
        lease: &ClaimLease,
    ) -> Result<Execution, TaskFailure> {
        let ctx = TaskContext {
            job_id: job.job_id,
            task_id: task.id,
            task_type: task.task_type.clone(),
            idempotency_key: task.idempotency_key.clone(),
            attempt: task.attempts,
        };

        match (self.registry.get(&task.task_type), job.kind.is_bulk()) {
            (Some(RegisteredHandler::Task(handler)), false) => self
                .executor
                .execute(handler.clone(), ctx, task.payload.clone())
                .await
                .map(Execution::Completed),
            (Some(RegisteredHandler::Batch(handler)), true) => {
                match self.batch.run(job, task, handler.clone(), &ctx, lease).await? {
                    BatchOutcome::Completed { result } => Ok(Execution::Completed(result)),
                    BatchOutcome::Cancelled { .. } => Ok(Execution::Cancelled),
                    BatchOutcome::ClaimLost { .. } => Ok(Execution::ClaimLost),
                }
            }
            (Some(_), _) => Err(TaskFailure::permanent(format!(
                "handler for {} does not match the job kind",
                task.task_type
            ))),
            (None, _) => Err(TaskFailure::permanent(format!(
                "no handler registered for task type {}",
                task.task_type
            ))),
        }
    }

    async fn skip_duplicate(
        &self,
        task: &Task,
        job: &Job,
        record: DedupRecord,
        delivery: &Delivery,
    ) -> Result<ProcessOutcome, WorkerError> {
        if let DedupState::InFlight {
            owner,
            lease_expires_at,
        } = &record.state
        {
            let retry_in = (*lease_expires_at - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(
                stage = %Stage::SkipDuplicate,
                job_id = %job.job_id,
                "Key held by {}, deferring delivery by {:?}",
                owner,
                retry_in
            );
            self.metrics.deferred_total.inc();
            self.nack(delivery, retry_in).await;
            return Ok(ProcessOutcome::DuplicateInFlight { retry_in });
        }

        self.metrics.duplicates_total.inc();

        debug!(
            stage = %Stage::SkipDuplicate,
            job_id = %job.job_id,
            "Key already completed, skipping execution"
        );

        // The previous delivery applied its effects but did not get to record
        // the job status
        if let Some(summary) = record.result_summary {
            let reconciled = match summary.status {
                JobStatus::Dead | JobStatus::Failed => {
                    let code = summary.error_code.unwrap_or(ErrorCode::PermanentFailure);
                    self.store
                        .dead_letter(&task.id, "reconciled from dedup record", code)?;
                    self.store.get_job(&job.job_id)?
                }
                status => Some(self.store.record_result(
                    &job.job_id,
                    status,
                    summary.result,
                    summary.error_code,
                )?),
            };
            if let Some(job) = reconciled {
                info!(
                    job_id = %job.job_id,
                    "Reconciled job status {} from dedup record",
                    job.status
                );
                self.callbacks.notify(&job);
            }
        }

        self.ack(delivery).await;
        Ok(ProcessOutcome::SkippedDuplicate)
    }

    async fn ack_success(
        &self,
        owner: &str,
        task: &Task,
        job: &Job,
        result: Value,
        delivery: &Delivery,
    ) -> Result<ProcessOutcome, WorkerError> {
        let summary = ResultSummary {
            status: JobStatus::Succeeded,
            result: Some(result.clone()),
            error_code: None,
        };
        let closed = self.dedup.complete(
            &task.idempotency_key,
            owner,
            summary,
            self.config.dedup_ttl(),
        )?;
        if !closed {
            return Ok(self.claim_lost(owner, task, delivery).await);
        }
        let job = self
            .store
            .record_result(&job.job_id, JobStatus::Succeeded, Some(result), None)?;

        self.ack(delivery).await;
        self.metrics.inc_execution("success");
        self.health.record_success();
        info!(
            stage = %Stage::AckSuccess,
            job_id = %job.job_id,
            task_id = %task.id,
            attempts = task.attempts,
            "Job succeeded"
        );

        self.callbacks.notify(&job);
        Ok(ProcessOutcome::Succeeded)
    }

    /// Honour a cancel request. `owner` is set when this slot holds the dedup
    /// claim, which is then closed so redeliveries skip the key.
    async fn cancel_at_boundary(
        &self,
        owner: Option<&str>,
        task: &Task,
        job: &Job,
        delivery: &Delivery,
    ) -> Result<ProcessOutcome, WorkerError> {
        if let Some(owner) = owner {
            let summary = ResultSummary {
                status: JobStatus::Cancelled,
                result: None,
                error_code: Some(ErrorCode::Cancelled),
            };
            let closed = self.dedup.complete(
                &task.idempotency_key,
                owner,
                summary,
                self.config.dedup_ttl(),
            )?;
            if !closed {
                return Ok(self.claim_lost(owner, task, delivery).await);
            }
        }
        let job = self.store.mark_cancelled(&job.job_id)?;

        self.ack(delivery).await;
        info!(
            stage = %Stage::Cancelled,
            job_id = %job.job_id,
            checkpoint = job.checkpoint_offset,
            "Job cancelled"
        );

        self.callbacks.notify(&job);
        Ok(ProcessOutcome::Cancelled)
    }

    async fn classify_failure(
        &self,
        owner: &str,
        task: &Task,
        job: &Job,
        failure: TaskFailure,
        delivery: &Delivery,
    ) -> Result<ProcessOutcome, WorkerError> {
        warn!(
            stage = %Stage::ClassifyFailure,
            job_id = %job.job_id,
            task_id = %task.id,
            attempts = task.attempts,
            kind = ?failure.kind,
            "Attempt failed: {}",
            failure.reason
        );

        match self.governor.decide(&failure, task.attempts) {
            RetryDecision::Retry { delay } => {
                let cancel_requested = self
                    .store
                    .get_job(&job.job_id)?
                    .is_some_and(|j| j.cancel_requested);
                if cancel_requested {
                    return self
                        .cancel_at_boundary(Some(owner), task, job, delivery)
                        .await;
                }

                if !self.dedup.release(&task.idempotency_key, owner)? {
                    return Ok(self.claim_lost(owner, task, delivery).await);
                }
                self.store.record_retry(&task.id, &failure.reason)?;
                self.metrics.inc_execution("failure");
                self.metrics.retries_total.inc();
                self.nack(delivery, delay).await;

                info!(
                    job_id = %job.job_id,
                    task_id = %task.id,
                    "Retrying in {:?} (attempt {} failed)",
                    delay,
                    task.attempts
                );
                Ok(ProcessOutcome::Retried { delay })
            }
            RetryDecision::DeadLetter { code } => {
                let status = if code == ErrorCode::CheckpointCorruption {
                    JobStatus::Failed
                } else {
                    JobStatus::Dead
                };
                let summary = ResultSummary {
                    status,
                    result: None,
                    error_code: Some(code),
                };
                let closed = self.dedup.complete(
                    &task.idempotency_key,
                    owner,
                    summary,
                    self.config.dedup_ttl(),
                )?;
                if !closed {
                    return Ok(self.claim_lost(owner, task, delivery).await);
                }
                let entry = self.store.dead_letter(&task.id, &failure.reason, code)?;

                self.ack(delivery).await;
                self.metrics.inc_execution("dlq");
                if code == ErrorCode::CheckpointCorruption {
                    self.metrics.checkpoint_corruption_total.inc();
                    error!(
                        target: "jobq::alert",
                        job_id = %job.job_id,
                        task_id = %task.id,
                        "Checkpoint corruption, job halted: {}",
                        failure.reason
                    );
                }
                warn!(
                    job_id = %job.job_id,
                    dead_letter_id = %entry.id,
                    code = code.as_str(),
                    attempts = entry.attempts,
                    "Task moved to dead letter queue"
                );

                if let Some(job) = self.store.get_job(&job.job_id)? {
                    self.callbacks.notify(&job);
                }
                Ok(ProcessOutcome::DeadLettered { code })
            }
        }
    }

    /// The key moved to another delivery while this one ran. Its holder
    /// settles the job; this copy only gets out of the way.
    async fn claim_lost(&self, owner: &str, task: &Task, delivery: &Delivery) -> ProcessOutcome {
        warn!(
            job_id = %task.job_id,
            task_id = %task.id,
            "Claim of {} was taken over, leaving the job to its new holder",
            owner
        );
        self.ack(delivery).await;
        ProcessOutcome::ClaimLost
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery.receipt).await {
            warn!(
                task_id = %delivery.message.task_id,
                "Ack failed: {}",
                e
            );
        }
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) {
        match self.queue.nack(delivery.receipt, delay).await {
            Ok(()) => {}
            // The visibility timeout lapsed and the queue already took the
            // message back
            Err(QueueError::UnknownReceipt(_)) => {
                warn!(
                    task_id = %delivery.message.task_id,
                    "Nack after visibility timeout, message already redelivered"
                );
            }
            Err(e) => error!(task_id = %delivery.message.task_id, "Nack failed: {}", e),
        }
    }
}

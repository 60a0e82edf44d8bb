//! Job submission: validation, idempotency key derivation, the initial
//! store entry and publishing to the queue.

use crate::config::DispatcherConfig;
use crate::metrics::DispatchMetrics;
use jobq_core::{Job, JobId, JobKind, Task, TaskPayload};
use jobq_persistence::{CreateOutcome, PersistenceError, ResultStore};
use jobq_queue::{Queue, QueueMessage};
use jobq_worker::{HandlerRegistry, RegisteredHandler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: TaskPayload,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

impl EnqueueRequest {
    pub fn new(task_type: impl Into<String>, payload: TaskPayload) -> Self {
        EnqueueRequest {
            task_type: task_type.into(),
            payload,
            idempotency_key: None,
            callback_url: None,
            chunk_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    /// The idempotency key matched an earlier submission
    pub existing: bool,
}

pub struct Dispatcher {
    registry: HandlerRegistry,
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn Queue>,
    config: DispatcherConfig,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(
        registry: HandlerRegistry,
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn Queue>,
        config: DispatcherConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Dispatcher {
            registry,
            store,
            queue,
            config,
            metrics,
        }
    }

    /// Accept a job and hand it to the queue.
    ///
    /// Submitting an idempotency key that is already known returns the
    /// original job; it is published again unless it already finished.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Submission> {
        let kind = match self.validate(&request) {
            Ok(kind) => kind,
            Err(e) => {
                self.metrics.inc_submission("rejected");
                return Err(e);
            }
        };

        let mut builder = Task::builder(request.task_type, request.payload);
        if let Some(key) = request.idempotency_key {
            builder = builder.idempotency_key(key);
        }
        let task = builder
            .build()
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
        let job = Job::new(task.job_id, task.id, kind, request.callback_url);

        match self.store.create_job(job, task.clone())? {
            CreateOutcome::Created => {
                self.metrics.inc_submission("created");
                info!(
                    job_id = %task.job_id,
                    task_id = %task.id,
                    "Accepted {} job",
                    task.task_type
                );
                self.publish(&task).await?;
                Ok(Submission {
                    job_id: task.job_id,
                    existing: false,
                })
            }
            CreateOutcome::Existing { job, task } => {
                self.metrics.inc_submission("existing");
                debug!(
                    job_id = %job.job_id,
                    "Idempotency key {} already submitted",
                    task.idempotency_key
                );
                if !job.is_terminal() {
                    self.publish(&task).await?;
                }
                Ok(Submission {
                    job_id: job.job_id,
                    existing: true,
                })
            }
        }
    }

    /// Publish a task message, retrying immediately up to the configured
    /// number of attempts
    pub async fn publish(&self, task: &Task) -> Result<()> {
        let message = QueueMessage::for_task(task);
        let mut last_error = String::new();

        for attempt in 1..=self.config.publish_attempts {
            match self.queue.publish(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.metrics.publish_failures_total.inc();
                    warn!(
                        job_id = %task.job_id,
                        "Publish attempt {}/{} failed: {}",
                        attempt,
                        self.config.publish_attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(DispatchError::QueueUnavailable(last_error))
    }

    fn validate(&self, request: &EnqueueRequest) -> Result<JobKind> {
        let handler = self.registry.get(&request.task_type).ok_or_else(|| {
            DispatchError::InvalidPayload(format!("unknown task type {}", request.task_type))
        })?;

        if request.payload.is_null() {
            return Err(DispatchError::InvalidPayload("payload is required".to_string()));
        }

        if let Some(url) = &request.callback_url {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| DispatchError::InvalidPayload(format!("callback url: {}", e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(DispatchError::InvalidPayload(format!(
                    "callback url must be http or https, got {}",
                    parsed.scheme()
                )));
            }
        }

        if request.chunk_size == Some(0) {
            return Err(DispatchError::InvalidPayload(
                "chunk size must be at least 1".to_string(),
            ));
        }

        match handler {
            RegisteredHandler::Task(_) => Ok(JobKind::Simple),
            RegisteredHandler::Batch(_) => {
                let records = request
                    .payload
                    .get("records")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        DispatchError::InvalidPayload(
                            "bulk payload needs a records array".to_string(),
                        )
                    })?;
                Ok(JobKind::Bulk {
                    total_records: records.len() as u64,
                    chunk_size: request.chunk_size.unwrap_or(self.config.default_chunk_size),
                })
            }
        }
    }
}

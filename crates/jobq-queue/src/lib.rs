//! Durable queue abstraction between the dispatcher and the worker pool.
//!
//! Delivery is at-least-once: a received message stays invisible for the
//! visibility timeout and is redelivered unless acked before it lapses.

mod memory;

pub use memory::MemoryQueue;

use async_trait::async_trait;
use jobq_core::{JobId, Task, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue closed")]
    Closed,

    #[error("Unknown receipt: {0}")]
    UnknownReceipt(Uuid),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Message body carried by the queue; the task itself lives in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub idempotency_key: String,
    pub task_type: String,
}

impl QueueMessage {
    pub fn for_task(task: &Task) -> Self {
        QueueMessage {
            task_id: task.id,
            job_id: task.job_id,
            idempotency_key: task.idempotency_key.clone(),
            task_type: task.task_type.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A received message together with the handle used to settle it
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub receipt: Uuid,
    pub message: QueueMessage,
    /// 1 on first delivery; higher values mean redelivery
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Publish/subscribe surface of a durable broker
#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(&self, message: QueueMessage) -> Result<()>;

    /// Wait for the next visible message. Returns `None` once the queue is
    /// closed.
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Remove a delivered message for good
    async fn ack(&self, receipt: Uuid) -> Result<()>;

    /// Return a delivered message, visible again after `delay`
    async fn nack(&self, receipt: Uuid, delay: Duration) -> Result<()>;

    /// Restart the visibility timeout of a delivered message so a long
    /// execution is not redelivered under it
    async fn extend(&self, receipt: Uuid) -> Result<()>;

    /// Messages waiting or in flight
    fn depth(&self) -> usize;

    /// Stop handing out messages and wake every waiting receiver
    fn close(&self);
}

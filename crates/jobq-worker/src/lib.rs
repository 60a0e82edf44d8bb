pub mod batch;
pub mod callback;
pub mod config;
pub mod executor;
pub mod handler;
pub mod lease;
pub mod metrics;
pub mod retry;
pub mod worker;

pub use batch::{BatchEngine, BatchOutcome};
pub use callback::{CallbackConfig, CallbackDelivery, CallbackError, CallbackPayload};
pub use config::WorkerConfig;
pub use executor::TaskExecutor;
pub use lease::ClaimLease;
pub use handler::{
    BatchHandler, EchoHandler, HandlerRegistry, Ledger, LedgerDebitHandler, RegisteredHandler,
    SleepHandler, TaskContext, TaskHandler, UppercaseRecordsHandler,
};
pub use metrics::{HealthTracker, JobMetrics};
pub use retry::{RetryDecision, RetryGovernor, RetryPolicy};
pub use worker::{Backends, ProcessOutcome, WorkerPool};

use jobq_persistence::PersistenceError;
use jobq_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),
}

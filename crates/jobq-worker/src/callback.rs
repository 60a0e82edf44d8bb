use crate::metrics::JobMetrics;
use jobq_core::{Job, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Receiver answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        CallbackConfig {
            max_attempts: 5,
            base_delay_ms: 200,
            request_timeout_secs: 10,
        }
    }
}

/// Body POSTed to the callback URL when a job reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result: Option<Value>,
}

impl CallbackPayload {
    pub fn for_job(job: &Job) -> Self {
        CallbackPayload {
            job_id: job.job_id,
            status: job.status,
            result: job.result.clone(),
        }
    }
}

/// Best-effort webhook sender with its own retry budget.
///
/// Delivery runs detached from the worker slot and never touches job state.
#[derive(Clone)]
pub struct CallbackDelivery {
    client: reqwest::Client,
    config: CallbackConfig,
    metrics: Arc<JobMetrics>,
}

impl CallbackDelivery {
    pub fn new(config: CallbackConfig, metrics: Arc<JobMetrics>) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(CallbackDelivery {
            client,
            config,
            metrics,
        })
    }

    /// Schedule delivery for a terminal job, if it has a callback URL
    pub fn notify(&self, job: &Job) -> Option<JoinHandle<()>> {
        let url = job.callback_url.clone()?;
        let payload = CallbackPayload::for_job(job);
        let this = self.clone();

        Some(tokio::spawn(async move {
            if let Err(e) = this.deliver(&url, &payload).await {
                error!(
                    job_id = %payload.job_id,
                    "Callback to {} failed after {} attempts: {}",
                    url, this.config.max_attempts, e
                );
                this.metrics.callback_failures_total.inc();
            }
        }))
    }

    /// POST `payload` until a 2xx answer or the attempt budget runs out
    pub async fn deliver(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError> {
        let mut attempt = 1;
        loop {
            match self.send_once(url, payload).await {
                Ok(()) => {
                    debug!(job_id = %payload.job_id, "Callback delivered to {}", url);
                    return Ok(());
                }
                Err(e) if attempt < self.config.max_attempts => {
                    let delay = Duration::from_millis(self.config.base_delay_ms)
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        job_id = %payload.job_id,
                        "Callback attempt {} failed: {}, retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError> {
        let response = self.client.post(url).json(payload).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CallbackError::Status(response.status().as_u16()))
        }
    }
}

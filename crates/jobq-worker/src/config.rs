use crate::callback::CallbackConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: Option<String>,
    /// Number of concurrent worker slots
    pub concurrency: usize,
    /// Wall-clock ceiling for one task or one chunk
    pub task_timeout_secs: u64,
    /// How long a dedup claim protects an execution before another slot may
    /// take it over
    pub claim_lease_secs: u64,
    /// Retention of dedup records; at least twice the redelivery window
    pub dedup_ttl_secs: u64,
    pub graceful_shutdown_timeout_secs: u64,
    /// Health turns unhealthy after this long without a successful job
    pub staleness_threshold_secs: u64,
    pub retry: RetryPolicy,
    pub callback: CallbackConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: None,
            concurrency: 4,
            task_timeout_secs: 30,
            claim_lease_secs: 60,
            dedup_ttl_secs: 24 * 3600,
            graceful_shutdown_timeout_secs: 30,
            staleness_threshold_secs: 300,
            retry: RetryPolicy::default(),
            callback: CallbackConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
    }

    pub fn dedup_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_ttl_secs as i64)
    }

    /// `hostname-pid-random`, unless configured explicitly
    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let random = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, std::process::id(), &random[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_worker_id() {
        let config = WorkerConfig::default();
        let id = config.generate_worker_id();
        assert!(id.contains(&format!("-{}-", std::process::id())));
        assert_ne!(id, config.generate_worker_id());
    }

    #[test]
    fn test_explicit_worker_id() {
        let config = WorkerConfig {
            worker_id: Some("worker-a".to_string()),
            ..Default::default()
        };
        assert_eq!(config.generate_worker_id(), "worker-a");
    }
}

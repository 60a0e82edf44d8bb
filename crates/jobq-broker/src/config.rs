use jobq_persistence::RocksStoreConfig;
use jobq_worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub api: ApiConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub persistence: PersistenceConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a received message stays invisible before redelivery
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Immediate publish attempts before reporting the queue unavailable
    pub publish_attempts: u32,
    /// Chunk size for bulk jobs submitted without one
    pub default_chunk_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub lock_timeout_ms: i64,
    pub max_txn_attempts: u32,
    /// Succeeded and cancelled tasks older than this are purged
    pub task_retention_days: i64,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Emit JSON log lines instead of the human readable format
    pub json: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            visibility_timeout_secs: 120,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            publish_attempts: 3,
            default_chunk_size: 100,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data"),
            lock_timeout_ms: 1000,
            max_txn_attempts: 3,
            task_retention_days: 7,
            maintenance_interval_secs: 60,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.visibility_timeout_secs)
    }

    /// Longest time a message can be away before it shows up again: the
    /// visibility timeout plus the longest retry delay
    pub fn redelivery_window_secs(&self) -> u64 {
        self.queue.visibility_timeout_secs + self.worker.retry.max_delay_ms.div_ceil(1000)
    }

    pub fn to_rocks_config(&self) -> RocksStoreConfig {
        RocksStoreConfig {
            data_dir: self.persistence.data_dir.clone(),
            lock_timeout_ms: self.persistence.lock_timeout_ms,
            max_txn_attempts: self.persistence.max_txn_attempts,
        }
    }

    /// Reject settings that would break the delivery guarantees
    pub fn validate(&self) -> anyhow::Result<()> {
        let worker = &self.worker;

        if worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be at least 1");
        }
        if worker.task_timeout_secs == 0 {
            anyhow::bail!("worker.task_timeout_secs must be at least 1");
        }
        if self.queue.visibility_timeout_secs <= worker.task_timeout_secs {
            anyhow::bail!(
                "queue.visibility_timeout_secs ({}) must exceed worker.task_timeout_secs ({})",
                self.queue.visibility_timeout_secs,
                worker.task_timeout_secs
            );
        }
        if worker.claim_lease_secs <= worker.task_timeout_secs {
            anyhow::bail!(
                "worker.claim_lease_secs ({}) must exceed worker.task_timeout_secs ({})",
                worker.claim_lease_secs,
                worker.task_timeout_secs
            );
        }
        if worker.dedup_ttl_secs < 2 * self.redelivery_window_secs() {
            anyhow::bail!(
                "worker.dedup_ttl_secs ({}) must be at least twice the redelivery window ({}s)",
                worker.dedup_ttl_secs,
                self.redelivery_window_secs()
            );
        }
        if worker.retry.max_attempts == 0 {
            anyhow::bail!("worker.retry.max_attempts must be at least 1");
        }
        if worker.retry.unclassified_max_attempts > worker.retry.max_attempts {
            anyhow::bail!(
                "worker.retry.unclassified_max_attempts ({}) cannot exceed max_attempts ({})",
                worker.retry.unclassified_max_attempts,
                worker.retry.max_attempts
            );
        }
        if self.dispatcher.default_chunk_size == 0 {
            anyhow::bail!("dispatcher.default_chunk_size must be at least 1");
        }
        if self.persistence.maintenance_interval_secs == 0 {
            anyhow::bail!("persistence.maintenance_interval_secs must be at least 1");
        }
        if self.dispatcher.publish_attempts == 0 {
            anyhow::bail!("dispatcher.publish_attempts must be at least 1");
        }
        Ok(())
    }
}

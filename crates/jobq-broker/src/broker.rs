use crate::{
    api::create_rest_api,
    config::{BrokerConfig, StorageBackend},
    dispatcher::Dispatcher,
    metrics::DispatchMetrics,
};
use jobq_core::{Job, JobId};
use jobq_persistence::{DedupStore, MemoryStore, ResultStore, RocksStore};
use jobq_queue::{MemoryQueue, Queue};
use jobq_worker::{Backends, HandlerRegistry, HealthTracker, JobMetrics, WorkerPool};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wires the stores, queue, dispatcher, worker pool and HTTP API together
pub struct Broker {
    config: BrokerConfig,
    store: Arc<dyn ResultStore>,
    dedup: Arc<dyn DedupStore>,
    queue: Arc<dyn Queue>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    metrics: Arc<JobMetrics>,
    dispatch_metrics: Arc<DispatchMetrics>,
    health: Arc<HealthTracker>,
}

impl Broker {
    /// Validate the config and open the configured backends
    pub fn new(config: BrokerConfig, registry: HandlerRegistry) -> anyhow::Result<Self> {
        config.validate()?;

        let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(config.visibility_timeout()));
        let backends = match config.persistence.backend {
            StorageBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                Backends {
                    queue,
                    store: store.clone(),
                    dedup: store,
                }
            }
            StorageBackend::Rocksdb => {
                let store = Arc::new(RocksStore::open(config.to_rocks_config())?);
                info!("Opened RocksDB store at {:?}", config.persistence.data_dir);
                Backends {
                    queue,
                    store: store.clone(),
                    dedup: store,
                }
            }
        };

        Self::with_backends(config, registry, backends)
    }

    pub fn with_backends(
        config: BrokerConfig,
        registry: HandlerRegistry,
        backends: Backends,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(JobMetrics::new()?);
        let dispatch_metrics = Arc::new(DispatchMetrics::register(&metrics.registry)?);
        let health = Arc::new(HealthTracker::new(Duration::from_secs(
            config.worker.staleness_threshold_secs,
        )));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            backends.store.clone(),
            backends.queue.clone(),
            config.dispatcher.clone(),
            dispatch_metrics.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(
            config.worker.clone(),
            registry,
            backends.clone(),
            metrics.clone(),
            health.clone(),
        )?);

        Ok(Broker {
            config,
            store: backends.store,
            dedup: backends.dedup,
            queue: backends.queue,
            dispatcher,
            pool,
            metrics,
            dispatch_metrics,
            health,
        })
    }

    /// Serve the API and run the worker pool until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.recover().await?;

        let pool = tokio::spawn(self.pool.clone().run(shutdown.clone()));

        let broker = self.clone();
        let token = shutdown.clone();
        let maintenance = tokio::spawn(async move {
            broker.maintenance_loop(token).await;
        });

        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(
            "Broker {} listening on {}",
            self.pool.worker_id(),
            addr
        );

        let app = create_rest_api(self.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await?;

        if let Err(e) = pool.await {
            error!("Worker pool task failed: {}", e);
        }
        maintenance.abort();
        self.queue.close();

        info!("Broker stopped");
        Ok(())
    }

    /// Release tasks a previous process left in progress and republish
    /// everything still pending. The queue lives in this process, so nothing
    /// survives a restart except the store.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let pending = self.store.recover_in_flight()?;
        for task in &pending {
            self.dispatcher.publish(task).await?;
        }

        if !pending.is_empty() {
            info!("Recovered {} pending tasks", pending.len());
        }
        self.dispatch_metrics
            .recovered_total
            .inc_by(pending.len() as u64);
        Ok(pending.len())
    }

    async fn maintenance_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.persistence.maintenance_interval_secs,
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.maintain() {
                        error!("Maintenance failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Purge expired dedup records and terminal tasks past retention
    pub fn maintain(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let expired = self.dedup.purge_expired(now)?;
        let cutoff = now - chrono::Duration::days(self.config.persistence.task_retention_days);
        let purged = self.store.purge_terminal(cutoff)?;

        self.dispatch_metrics.add_purged("dedup", expired);
        self.dispatch_metrics.add_purged("tasks", purged);
        self.metrics.queue_depth.set(self.queue.depth() as i64);

        if expired > 0 || purged > 0 {
            info!(
                "Maintenance purged {} dedup records and {} terminal tasks",
                expired, purged
            );
        }
        Ok(())
    }

    /// Request cancellation. A job still waiting in the queue is cancelled
    /// right away and its callback fires; a running one stops at the next
    /// boundary.
    pub fn cancel(&self, job_id: &JobId) -> jobq_persistence::Result<Job> {
        let (job, cancelled_now) = self.store.request_cancel(job_id)?;
        if cancelled_now {
            info!(job_id = %job.job_id, "Job cancelled before execution");
            self.pool.callbacks().notify(&job);
        } else if !job.is_terminal() {
            info!(job_id = %job.job_id, "Cancel requested for running job");
        }
        Ok(job)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ResultStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn Queue> {
        self.queue.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    pub fn metrics(&self) -> Arc<JobMetrics> {
        self.metrics.clone()
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }
}

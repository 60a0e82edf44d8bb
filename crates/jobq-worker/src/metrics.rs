use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::{Duration, Instant};

/// Prometheus metrics for job execution
pub struct JobMetrics {
    pub registry: Registry,

    /// Executions by outcome: success, failure (retried) or dlq
    pub execution_total: IntCounterVec,

    pub duration_seconds: Histogram,

    pub duplicates_total: IntCounter,
    /// Deliveries pushed back because another slot held a live claim
    pub deferred_total: IntCounter,
    pub callback_failures_total: IntCounter,
    pub checkpoint_corruption_total: IntCounter,
    pub retries_total: IntCounter,

    pub queue_depth: IntGauge,
}

impl JobMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let execution_total = IntCounterVec::new(
            Opts::new("jobs_execution_total", "Job executions by outcome"),
            &["status"],
        )?;
        registry.register(Box::new(execution_total.clone()))?;

        let duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "jobs_duration_seconds",
            "Wall-clock time of one execution attempt in seconds",
        ))?;
        registry.register(Box::new(duration_seconds.clone()))?;

        let duplicates_total = IntCounter::new(
            "jobs_duplicates_total",
            "Deliveries skipped because the idempotency key was already seen",
        )?;
        registry.register(Box::new(duplicates_total.clone()))?;

        let deferred_total = IntCounter::new(
            "jobs_deferred_total",
            "Deliveries deferred while another slot held the idempotency key",
        )?;
        registry.register(Box::new(deferred_total.clone()))?;

        let callback_failures_total = IntCounter::new(
            "jobs_callback_failures_total",
            "Callbacks that could not be delivered after all retries",
        )?;
        registry.register(Box::new(callback_failures_total.clone()))?;

        let checkpoint_corruption_total = IntCounter::new(
            "jobs_checkpoint_corruption_total",
            "Jobs halted because their checkpoint disagreed with committed chunks",
        )?;
        registry.register(Box::new(checkpoint_corruption_total.clone()))?;

        let retries_total = IntCounter::new("jobs_retries_total", "Attempts scheduled for retry")?;
        registry.register(Box::new(retries_total.clone()))?;

        let queue_depth = IntGauge::new("jobs_queue_depth", "Messages waiting or in flight")?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(JobMetrics {
            registry,
            execution_total,
            duration_seconds,
            duplicates_total,
            deferred_total,
            callback_failures_total,
            checkpoint_corruption_total,
            retries_total,
            queue_depth,
        })
    }

    pub fn inc_execution(&self, status: &str) {
        self.execution_total.with_label_values(&[status]).inc();
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Staleness signal: unhealthy once no job succeeded for longer than the
/// threshold. Process start counts as the first success.
pub struct HealthTracker {
    last_success: Mutex<Instant>,
    threshold: Duration,
}

impl HealthTracker {
    pub fn new(threshold: Duration) -> Self {
        HealthTracker {
            last_success: Mutex::new(Instant::now()),
            threshold,
        }
    }

    pub fn record_success(&self) {
        *self.last_success.lock() = Instant::now();
    }

    pub fn since_last_success(&self) -> Duration {
        self.last_success.lock().elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.since_last_success() <= self.threshold
    }
}

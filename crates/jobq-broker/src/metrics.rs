use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Submission-side metrics, registered next to the execution metrics so a
/// single `/metrics` scrape covers both
pub struct DispatchMetrics {
    /// Submissions by outcome: created, existing or rejected
    pub submissions_total: IntCounterVec,

    pub publish_failures_total: IntCounter,

    /// Tasks put back on the queue by startup recovery
    pub recovered_total: IntCounter,

    pub purged_total: IntCounterVec,
}

impl DispatchMetrics {
    pub fn register(registry: &Registry) -> anyhow::Result<Self> {
        let submissions_total = IntCounterVec::new(
            Opts::new("jobs_submissions_total", "Job submissions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(submissions_total.clone()))?;

        let publish_failures_total = IntCounter::new(
            "jobs_publish_failures_total",
            "Publish attempts rejected by the queue",
        )?;
        registry.register(Box::new(publish_failures_total.clone()))?;

        let recovered_total = IntCounter::new(
            "jobs_recovered_total",
            "Tasks republished by startup recovery",
        )?;
        registry.register(Box::new(recovered_total.clone()))?;

        let purged_total = IntCounterVec::new(
            Opts::new("jobs_purged_total", "Records removed by maintenance"),
            &["kind"],
        )?;
        registry.register(Box::new(purged_total.clone()))?;

        Ok(DispatchMetrics {
            submissions_total,
            publish_failures_total,
            recovered_total,
            purged_total,
        })
    }

    pub fn inc_submission(&self, outcome: &str) {
        self.submissions_total.with_label_values(&[outcome]).inc();
    }

    pub fn add_purged(&self, kind: &str, count: usize) {
        self.purged_total
            .with_label_values(&[kind])
            .inc_by(count as u64);
    }
}

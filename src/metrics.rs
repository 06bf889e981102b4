use crate::Error;
use prometheus::{
    histogram_opts, opts, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub outcomes: IntCounterVec,
    pub reconcile_duration: Histogram,
    pub restarts: IntCounter,
    pub requeues: IntCounter,
    pub queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = Histogram::with_opts(
            histogram_opts!(
                "job_watcher_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "job_watcher_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["error"],
        )?;
        let outcomes = IntCounterVec::new(
            opts!(
                "job_watcher_reconcile_outcomes_total",
                "successful reconciliations by the step that concluded them",
            ),
            &["outcome"],
        )?;
        let reconciliations =
            IntCounter::new("job_watcher_reconciliations_total", "reconciliations")?;
        let restarts = IntCounter::new(
            "job_watcher_restarts_total",
            "rolling restarts requested on the target deployment",
        )?;
        let requeues = IntCounter::new(
            "job_watcher_requeues_total",
            "jobs requeued with backoff after a failed reconcile",
        )?;
        let queue_depth = IntGauge::new("job_watcher_queue_depth", "jobs waiting to be reconciled")?;
        Ok(Metrics {
            reconciliations,
            failures,
            outcomes,
            reconcile_duration,
            restarts,
            requeues,
            queue_depth,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.outcomes.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.restarts.clone()))?;
        registry.register(Box::new(self.requeues.clone()))?;
        registry.register(Box::new(self.queue_depth.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, e: &Error) {
        self.failures.with_label_values(&[e.metric_label()]).inc()
    }

    pub fn reconcile_outcome(&self, outcome: &str) {
        self.outcomes.with_label_values(&[outcome]).inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

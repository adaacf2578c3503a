use prometheus::{Counter, Histogram, HistogramOpts, IntGauge, Registry};
use std::sync::Arc;

/// Background archiving metrics
pub struct ArchiveMetrics {
    /// Layers archived successfully
    pub layers_archived: Counter,
    /// Layers whose archiving failed
    pub archive_failures: Counter,
    /// Layers not archived because storage and index disagree
    pub consistency_failures: Counter,
    /// Time spent archiving one layer, in seconds
    pub archive_duration: Histogram,
    /// Layers handed to the archiver and not finished yet
    pub pending_layers: IntGauge,
}

impl ArchiveMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let layers_archived =
            Counter::new("layerstore_layers_archived_total", "Layers archived successfully")?;

        let archive_failures =
            Counter::new("layerstore_archive_failures_total", "Layers whose archiving failed")?;

        let consistency_failures = Counter::new(
            "layerstore_consistency_failures_total",
            "Layers not archived because storage and index disagree",
        )?;

        let archive_duration = Histogram::with_opts(HistogramOpts::new(
            "layerstore_archive_duration_seconds",
            "Time spent archiving one layer in seconds",
        ))?;

        let pending_layers =
            IntGauge::new("layerstore_archive_pending_layers", "Layers waiting to be archived")?;

        registry.register(Box::new(layers_archived.clone()))?;
        registry.register(Box::new(archive_failures.clone()))?;
        registry.register(Box::new(consistency_failures.clone()))?;
        registry.register(Box::new(archive_duration.clone()))?;
        registry.register(Box::new(pending_layers.clone()))?;

        Ok(Self { layers_archived, archive_failures, consistency_failures, archive_duration, pending_layers })
    }

    /// Metrics registered on a private registry, for callers that do not export them.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::new(Arc::new(Registry::new()))
    }

    pub fn record_archived(&self, duration_secs: f64) {
        self.layers_archived.inc();
        self.archive_duration.observe(duration_secs);
    }
}

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::fs::error::{StoreError, StoreResult};

use super::consistency::LayerConsistencyChecker;
use super::lifecycle::Layer;
use super::metrics::ArchiveMetrics;
use super::run_blocking;

/// Takes closed layers and archives them.
#[async_trait]
pub trait LayerArchiver: Send + Sync {
    /// Hands `layer` over for archiving. Implementations may return before the archive exists.
    async fn archive(&self, layer: Arc<Layer>) -> StoreResult<()>;
}

/// Optionally checks the layer, then packs it on the blocking pool.
async fn check_and_archive(
    layer: Arc<Layer>,
    checker: Option<&Arc<dyn LayerConsistencyChecker>>,
) -> StoreResult<()> {
    let layer_id = layer.id();
    if let Some(checker) = checker {
        info!(layer_id, "Checking consistency of layer");
        checker.check(layer.clone()).await?;
    }

    info!(layer_id, "Archiving layer");
    run_blocking(move || layer.archive()).await
}

/// Archives in the caller's task and reports failures to it.
#[derive(Default)]
pub struct DirectLayerArchiver {
    checker: Option<Arc<dyn LayerConsistencyChecker>>,
}

impl DirectLayerArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checker(checker: Arc<dyn LayerConsistencyChecker>) -> Self {
        Self { checker: Some(checker) }
    }
}

#[async_trait]
impl LayerArchiver for DirectLayerArchiver {
    async fn archive(&self, layer: Arc<Layer>) -> StoreResult<()> {
        check_and_archive(layer, self.checker.as_ref()).await
    }
}

/// Archives on a single background task, one layer at a time, in hand-over order.
///
/// Failures are logged and counted; the layer stays closed and is not retried.
pub struct BackgroundLayerArchiver {
    sender: Mutex<Option<mpsc::UnboundedSender<Arc<Layer>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<ArchiveMetrics>,
}

impl BackgroundLayerArchiver {
    /// Spawns the worker on the current tokio runtime.
    pub fn new(checker: Option<Arc<dyn LayerConsistencyChecker>>, metrics: Arc<ArchiveMetrics>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<Layer>>();
        let worker_metrics = metrics.clone();

        let worker = tokio::spawn(async move {
            while let Some(layer) = receiver.recv().await {
                let layer_id = layer.id();
                let started = Instant::now();
                match check_and_archive(layer, checker.as_ref()).await {
                    Ok(()) => {
                        worker_metrics.record_archived(started.elapsed().as_secs_f64());
                        info!(layer_id, "Layer archived in background");
                    }
                    Err(e @ StoreError::ItemsMismatch { .. }) => {
                        worker_metrics.consistency_failures.inc();
                        error!(layer_id, error = %e, "Layer failed consistency check, not archived");
                    }
                    Err(e) => {
                        worker_metrics.archive_failures.inc();
                        error!(layer_id, error = %e, "Archiving layer failed");
                    }
                }
                worker_metrics.pending_layers.dec();
            }
            info!("Background archiver stopped");
        });

        Self { sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)), metrics }
    }

    /// Stops accepting layers and waits until every layer handed over so far is processed.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Background archiver task failed");
            }
        }
    }
}

#[async_trait]
impl LayerArchiver for BackgroundLayerArchiver {
    async fn archive(&self, layer: Arc<Layer>) -> StoreResult<()> {
        let sender = self.sender.lock().await;
        let sender = sender
            .as_ref()
            .ok_or_else(|| StoreError::IllegalState("Background archiver has been shut down".to_string()))?;

        self.metrics.pending_layers.inc();
        if sender.send(layer).is_err() {
            self.metrics.pending_layers.dec();
            return Err(StoreError::IllegalState("Background archiver is not running".to_string()));
        }
        Ok(())
    }
}

//! Layer lifecycle: staging directories, the per-layer state machine, rotation of the top
//! layer and archiving of sealed layers.

mod archiver;
mod consistency;
mod lifecycle;
mod manager;
mod metrics;
mod staging;

pub use archiver::{BackgroundLayerArchiver, DirectLayerArchiver, LayerArchiver};
pub use consistency::{ItemsMatchDbConsistencyChecker, LayerConsistencyChecker};
#[cfg(any(test, feature = "mockall"))]
pub use consistency::MockLayerConsistencyChecker;
pub use lifecycle::{Layer, LayerState};
pub use manager::LayerManager;
pub use metrics::ArchiveMetrics;
pub use staging::{StagingDir, parse_staging_name};

use crate::fs::error::{StoreError, StoreResult};

/// Runs file system work on the blocking pool.
pub(crate) async fn run_blocking<F, T>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| StoreError::Storage(e.into()))?
}

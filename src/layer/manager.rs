//! Layer manager module.
//!
//! Owns the staging root, knows which layer is on top and hands sealed layers to the archiver.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::archive::ArchiveProvider;
use crate::fs::error::{StoreError, StoreResult};
use crate::types::LayerId;

use super::archiver::LayerArchiver;
use super::lifecycle::Layer;
use super::run_blocking;
use super::staging::StagingDir;

/// Keeps track of the top layer and constructs handles for older layers.
pub struct LayerManager {
    staging_root: PathBuf,
    archive_provider: Arc<dyn ArchiveProvider>,
    archiver: Arc<dyn LayerArchiver>,
    top_layer: RwLock<Arc<Layer>>,
    /// Layers rotated out of the top position and not yet seen archived. Handing out these
    /// instances keeps readers and the archiver on the same state machine.
    pending: Mutex<HashMap<LayerId, Arc<Layer>>>,
    rotation: tokio::sync::Mutex<()>,
}

fn scan_staging_root(staging_root: &Path) -> StoreResult<Vec<StagingDir>> {
    let mut staged = Vec::new();
    for entry in fs::read_dir(staging_root)? {
        staged.push(StagingDir::from_path(&entry?.path())?);
    }
    staged.sort_by_key(StagingDir::id);
    Ok(staged)
}

fn next_layer_id(after: Option<LayerId>) -> LayerId {
    let now = Utc::now().timestamp_millis();
    match after {
        Some(last) if last >= now => last + 1,
        _ => now,
    }
}

impl LayerManager {
    /// Picks up the highest open staging directory as the top layer, or starts a new one.
    ///
    /// Any entry of the staging root that is not a valid layer directory is treated as
    /// corruption. Older open staging directories are sealed and handed to the archiver.
    pub async fn new(
        staging_root: impl Into<PathBuf>,
        archive_provider: Arc<dyn ArchiveProvider>,
        archiver: Arc<dyn LayerArchiver>,
    ) -> StoreResult<Self> {
        let staging_root = staging_root.into();
        let root = staging_root.clone();
        let provider = archive_provider.clone();

        let (top_layer, stale) = run_blocking(move || {
            if root.exists() && !root.is_dir() {
                return Err(StoreError::InvalidArgument(format!("Not a directory: {}", root.display())));
            }
            fs::create_dir_all(&root)?;

            let staged = scan_staging_root(&root)?;
            let mut open: Vec<StagingDir> = staged.iter().filter(|s| !s.is_marked_closed()).cloned().collect();
            let closed: Vec<LayerId> = staged.iter().filter(|s| s.is_marked_closed()).map(StagingDir::id).collect();
            if !closed.is_empty() {
                info!(layers = ?closed, "Found closed layers that are not archived yet");
            }

            let top = match open.pop() {
                Some(staging) => {
                    let archive = provider.create_archive(staging.id())?;
                    Layer::load(staging, archive)
                }
                None => {
                    let last_staged = staged.last().map(StagingDir::id);
                    let last_archived = provider.list_archived_layers()?.last().copied();
                    let id = next_layer_id(last_staged.max(last_archived));
                    Layer::new_open(StagingDir::new(&root, id)?, provider.create_archive(id)?)
                }
            };

            let mut stale = Vec::new();
            for staging in open {
                warn!(layer_id = staging.id(), "Sealing stale open layer");
                let archive = provider.create_archive(staging.id())?;
                let layer = Layer::load(staging, archive);
                layer.close()?;
                stale.push(Arc::new(layer));
            }
            Ok((Arc::new(top), stale))
        })
        .await?;

        info!(layer_id = top_layer.id(), staging_root = %staging_root.display(), "Top layer initialized");

        let manager = Self {
            staging_root,
            archive_provider,
            archiver,
            top_layer: RwLock::new(top_layer),
            pending: Mutex::new(HashMap::new()),
            rotation: tokio::sync::Mutex::new(()),
        };

        for layer in stale {
            manager.schedule_archiving(layer).await?;
        }
        Ok(manager)
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// The single open layer all writes go to.
    pub fn get_top_layer(&self) -> Arc<Layer> {
        self.top_layer.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the top layer with a new open one, then seals the old top and hands it to the
    /// archiver. Returns the new top layer.
    pub async fn new_top_layer(&self) -> StoreResult<Arc<Layer>> {
        let _rotation = self.rotation.lock().await;

        let current_id = self.get_top_layer().id();
        let root = self.staging_root.clone();
        let provider = self.archive_provider.clone();
        let new_layer = run_blocking(move || {
            let id = next_layer_id(Some(current_id));
            Ok(Arc::new(Layer::new_open(StagingDir::new(&root, id)?, provider.create_archive(id)?)))
        })
        .await?;

        let old_layer = {
            let mut top = self.top_layer.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *top, new_layer.clone())
        };
        info!(old_layer_id = old_layer.id(), new_layer_id = new_layer.id(), "Rotated top layer");

        let closing = old_layer.clone();
        run_blocking(move || closing.close()).await?;
        self.schedule_archiving(old_layer).await?;

        Ok(new_layer)
    }

    async fn schedule_archiving(&self, layer: Arc<Layer>) -> StoreResult<()> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(layer.id(), layer.clone());
        debug!(layer_id = layer.id(), "Scheduling layer for archiving");
        self.archiver.archive(layer).await
    }

    fn pending_layer(&self, id: LayerId) -> Option<Arc<Layer>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, layer| !layer.is_archived());
        pending.get(&id).cloned()
    }

    /// The layer with `id`: the top layer, a layer being archived, or a handle backed by its
    /// staging directory or archive.
    pub async fn get_layer(&self, id: LayerId) -> StoreResult<Arc<Layer>> {
        let top = self.get_top_layer();
        if top.id() == id {
            return Ok(top);
        }
        if let Some(layer) = self.pending_layer(id) {
            return Ok(layer);
        }

        let root = self.staging_root.clone();
        let provider = self.archive_provider.clone();
        run_blocking(move || {
            let staging = StagingDir::new(&root, id)
                .map_err(|_| StoreError::InvalidArgument(format!("No layer found with id {}", id)))?;
            if !staging.is_staged() && !provider.exists(id)? {
                return Err(StoreError::InvalidArgument(format!("No layer found with id {}", id)));
            }
            let archive = provider.create_archive(id)?;
            Ok(Arc::new(Layer::load(staging, archive)))
        })
        .await
    }

    /// Ids of all layers with a staging directory or an archive, ascending.
    pub async fn list_layer_ids(&self) -> StoreResult<Vec<LayerId>> {
        let root = self.staging_root.clone();
        let provider = self.archive_provider.clone();
        run_blocking(move || {
            let mut ids: BTreeSet<LayerId> = scan_staging_root(&root)?.iter().map(StagingDir::id).collect();
            ids.extend(provider.list_archived_layers()?);
            Ok(ids.into_iter().collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_layer_id_is_monotonic() {
        let now = Utc::now().timestamp_millis();
        assert!(next_layer_id(None) >= now);
        assert_eq!(next_layer_id(Some(now + 10_000)), now + 10_001);
        assert!(next_layer_id(Some(1)) >= now);
    }
}

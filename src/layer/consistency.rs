use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use tracing::{debug, info};

use crate::fs::error::{StoreError, StoreResult};
use crate::storage::{Item, LayerDatabase};

use super::lifecycle::Layer;
use super::run_blocking;

/// Verifies a layer against the index before it is archived.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait LayerConsistencyChecker: Send + Sync {
    async fn check(&self, layer: Arc<Layer>) -> StoreResult<()>;
}

/// Requires the items found in the layer's storage to be exactly the items the index records
/// for that layer.
pub struct ItemsMatchDbConsistencyChecker {
    database: Arc<dyn LayerDatabase>,
}

impl ItemsMatchDbConsistencyChecker {
    pub fn new(database: Arc<dyn LayerDatabase>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl LayerConsistencyChecker for ItemsMatchDbConsistencyChecker {
    async fn check(&self, layer: Arc<Layer>) -> StoreResult<()> {
        let layer_id = layer.id();
        debug!(layer_id, "Checking consistency of items found on storage");

        let items_in_db: Vec<Item> = self
            .database
            .get_records_by_layer_id(layer_id)
            .await?
            .iter()
            .map(|record| record.to_item())
            .collect();

        let items_on_storage: Vec<Item> =
            run_blocking(move || layer.list_all_items()?.collect::<StoreResult<Vec<Item>>>()).await?;

        let db_set: HashSet<&Item> = items_in_db.iter().collect();
        let storage_set: HashSet<&Item> = items_on_storage.iter().collect();

        let missing_in_db: Vec<Item> =
            items_on_storage.iter().filter(|item| !db_set.contains(item)).cloned().collect();
        let missing_on_storage: Vec<Item> =
            items_in_db.iter().filter(|item| !storage_set.contains(item)).cloned().collect();

        if !missing_in_db.is_empty() || !missing_on_storage.is_empty() {
            return Err(StoreError::ItemsMismatch { layer_id, missing_in_db, missing_on_storage });
        }

        info!(layer_id, "Consistency check of items found on storage OK");
        Ok(())
    }
}

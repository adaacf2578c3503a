use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::fs::StoreResult;
use crate::types::{LayerId, RecordId};

use super::models::{Item, ItemRecord};

/// The overlay index: one record per (layer, path).
///
/// A path's current record is the one with the highest layer id among all records for that
/// path. Records in older layers are shadowed but kept.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait LayerDatabase: Send + Sync {
    /// Inserts records without an identity (or whose identity is unknown) and updates the
    /// others in place. Returns the records as saved, with their identities filled in.
    async fn save_records(&self, records: Vec<ItemRecord>) -> StoreResult<Vec<ItemRecord>>;

    async fn delete_records_by_id(&self, ids: Vec<RecordId>) -> StoreResult<()>;

    async fn get_all_records(&self) -> StoreResult<Vec<ItemRecord>>;

    /// Current records of the immediate children of `directory_path`.
    ///
    /// Fails with `NotFound` when a non-root directory has no record in any layer and with
    /// `NotDirectory` when its current record is a file.
    async fn list_directory(&self, directory_path: &str) -> StoreResult<Vec<Item>>;

    /// Like [`LayerDatabase::list_directory`], but includes descendants at any depth.
    async fn list_recursive(&self, directory_path: &str) -> StoreResult<Vec<Item>>;

    /// Adds directory records for `path` and all its ancestors (root included) that have no
    /// record in `layer_id` yet. Fails with `InvalidArgument` if any of those paths is a file
    /// in any layer. Returns only the records that were created.
    async fn add_directory(&self, layer_id: LayerId, path: &str) -> StoreResult<Vec<ItemRecord>>;

    async fn find_layers_containing(&self, path: &str) -> StoreResult<Vec<LayerId>>;

    /// All records for `path`, newest layer first.
    async fn get_records_by_path(&self, path: &str) -> StoreResult<Vec<ItemRecord>>;

    /// Whether any path matches `pattern`, in which `%` matches any sequence of characters.
    async fn exists_path_like(&self, pattern: &str) -> StoreResult<bool>;

    async fn list_layer_ids(&self) -> StoreResult<Vec<LayerId>>;

    async fn get_records_by_layer_id(&self, layer_id: LayerId) -> StoreResult<Vec<ItemRecord>>;
}

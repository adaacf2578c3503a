use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::fs::error::{StoreError, StoreResult};
use crate::fs::path::ancestor_paths;
use crate::types::{LayerId, RecordId};

use super::models::{Item, ItemRecord, ItemType};
use super::pattern::{directory_prefix, like_matches};
use super::traits::LayerDatabase;

#[derive(Default, Clone)]
struct Index {
    next_id: RecordId,
    records: BTreeMap<RecordId, ItemRecord>,
    by_path: HashMap<String, BTreeMap<LayerId, RecordId>>,
}

impl Index {
    fn current(&self, path: &str) -> Option<&ItemRecord> {
        let (_, id) = self.by_path.get(path)?.iter().next_back()?;
        self.records.get(id)
    }

    fn record_at(&self, layer_id: LayerId, path: &str) -> Option<RecordId> {
        self.by_path.get(path)?.get(&layer_id).copied()
    }

    fn unlink(&mut self, record: &ItemRecord) {
        if let Some(layers) = self.by_path.get_mut(&record.path) {
            layers.remove(&record.layer_id);
            if layers.is_empty() {
                self.by_path.remove(&record.path);
            }
        }
    }

    fn save(&mut self, mut record: ItemRecord) -> StoreResult<ItemRecord> {
        let held_by = self.record_at(record.layer_id, &record.path);
        let existing = record.id.filter(|id| self.records.contains_key(id));
        if let (Some(id), Some(other)) = (existing, held_by) {
            if id != other {
                return Err(StoreError::IllegalState(format!(
                    "Layer {} already holds record {} for path {}",
                    record.layer_id, other, record.path
                )));
            }
        }
        let existing = existing.or(held_by);

        let id = match existing {
            Some(id) => {
                if let Some(old) = self.records.remove(&id) {
                    self.unlink(&old);
                }
                id
            }
            None => {
                self.next_id += 1;
                self.next_id
            }
        };

        record.id = Some(id);
        self.by_path.entry(record.path.clone()).or_default().insert(record.layer_id, id);
        self.records.insert(id, record.clone());
        Ok(record)
    }

    fn check_directory(&self, directory_path: &str) -> StoreResult<()> {
        if directory_path.is_empty() {
            return Ok(());
        }
        match self.current(directory_path) {
            None => Err(StoreError::NotFound(directory_path.to_string())),
            Some(record) if record.item_type == ItemType::File => {
                Err(StoreError::NotDirectory(directory_path.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    fn list_under(&self, directory_path: &str, recursive: bool) -> StoreResult<Vec<Item>> {
        self.check_directory(directory_path)?;
        let prefix = directory_prefix(directory_path);

        let mut items: Vec<Item> = self
            .by_path
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix(prefix.as_str())?;
                if rest.is_empty() || (!recursive && rest.contains('/')) {
                    return None;
                }
                self.current(path).map(ItemRecord::to_item)
            })
            .collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(items)
    }
}

/// [`LayerDatabase`] held entirely in memory.
///
/// Records are kept in identity order with a secondary index from path to the records of every
/// layer holding that path, so the current record of a path is the last entry of its index.
#[derive(Default)]
pub struct InMemoryLayerDatabase {
    index: RwLock<Index>,
}

impl InMemoryLayerDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LayerDatabase for InMemoryLayerDatabase {
    async fn save_records(&self, records: Vec<ItemRecord>) -> StoreResult<Vec<ItemRecord>> {
        let mut index = self.index.write().await;
        let mut staged = index.clone();
        let saved = records.into_iter().map(|r| staged.save(r)).collect::<StoreResult<Vec<_>>>()?;
        *index = staged;
        tracing::debug!(count = saved.len(), "Saved item records");
        Ok(saved)
    }

    async fn delete_records_by_id(&self, ids: Vec<RecordId>) -> StoreResult<()> {
        let mut index = self.index.write().await;
        for id in ids {
            if let Some(record) = index.records.remove(&id) {
                index.unlink(&record);
                tracing::debug!(record_id = id, path = %record.path, "Deleted item record");
            }
        }
        Ok(())
    }

    async fn get_all_records(&self) -> StoreResult<Vec<ItemRecord>> {
        Ok(self.index.read().await.records.values().cloned().collect())
    }

    async fn list_directory(&self, directory_path: &str) -> StoreResult<Vec<Item>> {
        self.index.read().await.list_under(directory_path, false)
    }

    async fn list_recursive(&self, directory_path: &str) -> StoreResult<Vec<Item>> {
        self.index.read().await.list_under(directory_path, true)
    }

    async fn add_directory(&self, layer_id: LayerId, path: &str) -> StoreResult<Vec<ItemRecord>> {
        let mut index = self.index.write().await;
        let prefixes = ancestor_paths(path);

        for prefix in &prefixes {
            let occupied_by_file = index.by_path.get(prefix).is_some_and(|layers| {
                layers.values().any(|id| {
                    index.records.get(id).is_some_and(|r| r.item_type == ItemType::File)
                })
            });
            if occupied_by_file {
                return Err(StoreError::InvalidArgument(format!(
                    "Path {} is already occupied by a file",
                    prefix
                )));
            }
        }

        let mut created = Vec::new();
        for prefix in prefixes {
            if index.record_at(layer_id, &prefix).is_none() {
                created.push(index.save(ItemRecord::directory(layer_id, prefix))?);
            }
        }

        if !created.is_empty() {
            tracing::debug!(layer_id, path = %path, created = created.len(), "Added directory records");
        }
        Ok(created)
    }

    async fn find_layers_containing(&self, path: &str) -> StoreResult<Vec<LayerId>> {
        let index = self.index.read().await;
        Ok(index.by_path.get(path).map(|layers| layers.keys().copied().collect()).unwrap_or_default())
    }

    async fn get_records_by_path(&self, path: &str) -> StoreResult<Vec<ItemRecord>> {
        let index = self.index.read().await;
        let Some(layers) = index.by_path.get(path) else {
            return Ok(Vec::new());
        };
        Ok(layers.values().rev().filter_map(|id| index.records.get(id).cloned()).collect())
    }

    async fn exists_path_like(&self, pattern: &str) -> StoreResult<bool> {
        let index = self.index.read().await;
        Ok(index.by_path.keys().any(|path| like_matches(pattern, path)))
    }

    async fn list_layer_ids(&self) -> StoreResult<Vec<LayerId>> {
        let index = self.index.read().await;
        let ids: BTreeSet<LayerId> = index.records.values().map(|r| r.layer_id).collect();
        Ok(ids.into_iter().collect())
    }

    async fn get_records_by_layer_id(&self, layer_id: LayerId) -> StoreResult<Vec<ItemRecord>> {
        let index = self.index.read().await;
        let mut records: Vec<ItemRecord> =
            index.records.values().filter(|r| r.layer_id == layer_id).cloned().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }
}

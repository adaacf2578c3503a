use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::fs::error::{StoreError, StoreResult};
use crate::fs::path::{join_path, normalize_path, parent_path, resolve_within, to_store_path};
use crate::layer::{ItemsMatchDbConsistencyChecker, Layer, LayerConsistencyChecker, LayerManager};
use crate::storage::{ContentManager, Item, ItemRecord, ItemType, LayerDatabase, NoContentManager};
use crate::types::{LayerId, RecordId};

/// Files and directories addressed by store paths, whatever layer they live in.
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn list_directory(&self, directory_path: &str) -> StoreResult<Vec<Item>>;

    async fn list_recursive(&self, directory_path: &str) -> StoreResult<Vec<Item>>;

    /// Whether any path matches `pattern`, where `%` matches any sequence of characters.
    async fn exists_path_like(&self, pattern: &str) -> StoreResult<bool>;

    async fn read_file(&self, path: &str) -> StoreResult<Box<dyn Read + Send>>;

    async fn write_file(&self, path: &str, content: Vec<u8>) -> StoreResult<()>;

    /// Moves an external directory into the store at `destination`.
    async fn move_directory_into(&self, source: &Path, destination: &str) -> StoreResult<()>;

    async fn move_directory_internal(&self, source: &str, destination: &str) -> StoreResult<()>;

    async fn delete_directory(&self, path: &str) -> StoreResult<()>;

    async fn delete_files(&self, paths: &[String]) -> StoreResult<()>;

    async fn create_directory(&self, path: &str) -> StoreResult<()>;

    /// Materializes `source` and everything below it under `destination`, at the items' full
    /// store paths.
    async fn copy_directory_out_of(&self, source: &str, destination: &Path) -> StoreResult<()>;
}

/// [`ItemStore`] over a stack of layers plus the index that records which layer holds what.
///
/// Every mutation touches the top layer first and the index second. The two are not updated
/// atomically; [`LayeredItemStore::check_same_layers_on_storage_and_db`] and
/// [`LayeredItemStore::check_layer`] detect drift.
pub struct LayeredItemStore {
    database: Arc<dyn LayerDatabase>,
    layer_manager: Arc<LayerManager>,
    content_manager: Arc<dyn ContentManager>,
}

impl LayeredItemStore {
    pub fn new(database: Arc<dyn LayerDatabase>, layer_manager: Arc<LayerManager>) -> Self {
        Self { database, layer_manager, content_manager: Arc::new(NoContentManager) }
    }

    pub fn with_content_manager(mut self, content_manager: Arc<dyn ContentManager>) -> Self {
        self.content_manager = content_manager;
        self
    }

    pub fn database(&self) -> &Arc<dyn LayerDatabase> {
        &self.database
    }

    pub fn layer_manager(&self) -> &Arc<LayerManager> {
        &self.layer_manager
    }

    /// Seals the top layer, schedules it for archiving and returns the id of the new top layer.
    pub async fn new_top_layer(&self) -> StoreResult<LayerId> {
        Ok(self.layer_manager.new_top_layer().await?.id())
    }

    /// Compares the layer ids found in storage with those recorded in the index.
    pub async fn check_same_layers_on_storage_and_db(&self) -> StoreResult<()> {
        let on_storage: BTreeSet<LayerId> = self.layer_manager.list_layer_ids().await?.into_iter().collect();
        let in_db: BTreeSet<LayerId> = self.database.list_layer_ids().await?.into_iter().collect();

        let missing_in_db: Vec<LayerId> = on_storage.difference(&in_db).copied().collect();
        let missing_on_storage: Vec<LayerId> = in_db.difference(&on_storage).copied().collect();
        if !missing_in_db.is_empty() || !missing_on_storage.is_empty() {
            return Err(StoreError::LayerIdsMismatch { missing_in_db, missing_on_storage });
        }

        debug!(layers = on_storage.len(), "Layer ids on storage match the index");
        Ok(())
    }

    /// Compares the items stored in one layer with the index records for that layer.
    pub async fn check_layer(&self, layer_id: LayerId) -> StoreResult<()> {
        let layer = self.layer_manager.get_layer(layer_id).await?;
        ItemsMatchDbConsistencyChecker::new(self.database.clone()).check(layer).await
    }

    /// The newest record for `path`, if any.
    async fn current_record(&self, path: &str) -> StoreResult<Option<ItemRecord>> {
        Ok(self.database.get_records_by_path(path).await?.into_iter().next())
    }

    async fn require_directory(&self, path: &str) -> StoreResult<()> {
        match self.current_record(path).await? {
            None if !path.is_empty() => Err(StoreError::NotFound(path.to_string())),
            Some(record) if record.item_type == ItemType::File => {
                Err(StoreError::NotDirectory(path.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// `path` and everything below it, as long as all of it lives only in the top layer.
    async fn items_only_in_top_layer(&self, path: &str, operation: &str, top_id: LayerId) -> StoreResult<Vec<Item>> {
        let mut items = vec![Item::directory(path)];
        items.extend(self.database.list_recursive(path).await?);

        let mut elsewhere = Vec::new();
        for item in &items {
            let layers = self.database.find_layers_containing(&item.path).await?;
            if layers.as_slice() != [top_id] {
                elsewhere.push(item.path.clone());
            }
        }
        if !elsewhere.is_empty() {
            return Err(StoreError::IllegalState(format!(
                "Cannot {} because the following items are in multiple layers: {:?}",
                operation, elsewhere
            )));
        }
        Ok(items)
    }

    async fn read_from_layer(&self, layer: Arc<Layer>, path: &str) -> StoreResult<Vec<u8>> {
        let path = path.to_string();
        crate::layer::run_blocking(move || {
            let mut content = Vec::new();
            layer.read_file(&path)?.read_to_end(&mut content)?;
            Ok(content)
        })
        .await
    }
}

fn reject_root(path: &str, operation: &str) -> StoreResult<()> {
    if path.is_empty() {
        return Err(StoreError::InvalidArgument(format!("Cannot {} the root directory", operation)));
    }
    Ok(())
}

/// Records for everything under an external directory as it will appear at `destination`.
fn records_for_external_tree(
    source: &Path,
    destination: &str,
    layer_id: LayerId,
    content_manager: &dyn ContentManager,
) -> StoreResult<Vec<ItemRecord>> {
    let mut records = Vec::new();
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::Storage(e.into()))?;
        let relative = entry.path().strip_prefix(source).map_err(|e| StoreError::Storage(e.into()))?;
        let path = join_path(destination, &to_store_path(relative)?);
        let file_type = entry.file_type();

        let record = if file_type.is_dir() {
            ItemRecord::directory(layer_id, path)
        } else if file_type.is_file() {
            let mut record = ItemRecord::file(layer_id, path.clone());
            if content_manager.test(&path) {
                record.content = Some(content_manager.pre_store(&path, fs::read(entry.path())?));
            }
            record
        } else {
            return Err(StoreError::InvalidArgument(format!(
                "Path is not a file or directory: {}",
                entry.path().display()
            )));
        };
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl ItemStore for LayeredItemStore {
    async fn list_directory(&self, directory_path: &str) -> StoreResult<Vec<Item>> {
        self.database.list_directory(&normalize_path(directory_path)?).await
    }

    async fn list_recursive(&self, directory_path: &str) -> StoreResult<Vec<Item>> {
        self.database.list_recursive(&normalize_path(directory_path)?).await
    }

    async fn exists_path_like(&self, pattern: &str) -> StoreResult<bool> {
        self.database.exists_path_like(pattern).await
    }

    async fn read_file(&self, path: &str) -> StoreResult<Box<dyn Read + Send>> {
        let path = normalize_path(path)?;
        let record = self.current_record(&path).await?.ok_or_else(|| StoreError::NotFound(path.clone()))?;
        if record.item_type == ItemType::Directory {
            return Err(StoreError::IsDirectory(path));
        }
        if let Some(content) = record.content {
            return Ok(Box::new(Cursor::new(self.content_manager.post_retrieve(&path, content))));
        }

        let layer = self.layer_manager.get_layer(record.layer_id).await?;
        crate::layer::run_blocking(move || layer.read_file(&path)).await
    }

    async fn write_file(&self, path: &str, content: Vec<u8>) -> StoreResult<()> {
        let path = normalize_path(path)?;
        reject_root(&path, "write to")?;
        let records = self.database.get_records_by_path(&path).await?;
        if records.first().is_some_and(|r| r.item_type == ItemType::Directory) {
            return Err(StoreError::IsDirectory(path));
        }

        let top = self.layer_manager.get_top_layer();
        let top_id = top.id();
        let mut in_top: Vec<ItemRecord> = records.into_iter().filter(|r| r.layer_id == top_id).collect();
        if in_top.len() > 1 {
            return Err(StoreError::IllegalState(format!(
                "Found multiple records for path {} in layer {}",
                path, top_id
            )));
        }

        if let Some(parent) = parent_path(&path) {
            self.database.add_directory(top_id, parent).await?;
        }

        let layer = top.clone();
        let target = path.clone();
        crate::layer::run_blocking(move || layer.write_file(&target, &mut content.as_slice()).map(|_| ())).await?;

        let mut record = in_top.pop().unwrap_or_else(|| ItemRecord::file(top_id, path.clone()));
        record.item_type = ItemType::File;
        record.content = None;
        if self.content_manager.test(&path) {
            let stored = self.read_from_layer(top, &path).await?;
            record.content = Some(self.content_manager.pre_store(&path, stored));
        }
        self.database.save_records(vec![record]).await?;

        debug!(path = %path, layer_id = top_id, "Wrote file");
        Ok(())
    }

    async fn move_directory_into(&self, source: &Path, destination: &str) -> StoreResult<()> {
        let destination = normalize_path(destination)?;
        if destination.is_empty() || self.current_record(&destination).await?.is_some() {
            return Err(StoreError::InvalidArgument(format!("Destination already exists: {}", destination)));
        }
        let parent = parent_path(&destination).unwrap_or_default().to_string();
        if !parent.is_empty() && self.current_record(&parent).await?.is_none() {
            return Err(StoreError::InvalidArgument(format!("Parent of destination does not exist: {}", parent)));
        }
        self.require_directory(&parent).await?;
        if !source.is_dir() {
            return Err(StoreError::NotDirectory(source.display().to_string()));
        }

        let top = self.layer_manager.get_top_layer();
        let top_id = top.id();
        let created = self.database.add_directory(top_id, &parent).await?;

        let source: PathBuf = source.to_path_buf();
        let content_manager = self.content_manager.clone();
        let target = destination.clone();
        let records = crate::layer::run_blocking(move || {
            if !created.is_empty() {
                top.create_directory(&parent)?;
            }
            let records = records_for_external_tree(&source, &target, top_id, content_manager.as_ref())?;
            top.move_directory_into(&source, &target)?;
            Ok(records)
        })
        .await?;

        let count = records.len();
        self.database.save_records(records).await?;
        info!(destination = %destination, layer_id = top_id, items = count, "Moved directory into store");
        Ok(())
    }

    async fn move_directory_internal(&self, source: &str, destination: &str) -> StoreResult<()> {
        let source = normalize_path(source)?;
        let destination = normalize_path(destination)?;
        reject_root(&source, "move")?;
        if destination == source || destination.starts_with(&format!("{}/", source)) {
            return Err(StoreError::InvalidArgument(format!(
                "Cannot move {} into itself: {}",
                source, destination
            )));
        }
        if destination.is_empty() || self.current_record(&destination).await?.is_some() {
            return Err(StoreError::InvalidArgument(format!("Destination already exists: {}", destination)));
        }
        self.require_directory(&source).await?;

        let top = self.layer_manager.get_top_layer();
        let top_id = top.id();
        let items = self.items_only_in_top_layer(&source, "move directory", top_id).await?;

        let mut records = Vec::new();
        for item in &items {
            let suffix = &item.path[source.len()..];
            for mut record in self.database.get_records_by_path(&item.path).await? {
                record.path = format!("{}{}", destination, suffix);
                records.push(record);
            }
        }

        if let Some(parent) = parent_path(&destination) {
            self.database.add_directory(top_id, parent).await?;
        }
        let (from, to) = (source.clone(), destination.clone());
        crate::layer::run_blocking(move || top.move_directory_internal(&from, &to)).await?;
        self.database.save_records(records).await?;

        info!(source = %source, destination = %destination, "Moved directory");
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> StoreResult<()> {
        let path = normalize_path(path)?;
        reject_root(&path, "delete")?;
        self.require_directory(&path).await?;

        let top = self.layer_manager.get_top_layer();
        let items = self.items_only_in_top_layer(&path, "delete directory", top.id()).await?;

        let mut ids: Vec<RecordId> = Vec::with_capacity(items.len());
        for item in &items {
            let records = self.database.get_records_by_path(&item.path).await?;
            if records.len() > 1 {
                return Err(StoreError::IllegalState(format!("Found multiple records for path {}", item.path)));
            }
            ids.extend(records.iter().filter_map(|r| r.id));
        }

        let target = path.clone();
        crate::layer::run_blocking(move || top.delete_directory(&target)).await?;
        self.database.delete_records_by_id(ids).await?;

        info!(path = %path, items = items.len(), "Deleted directory");
        Ok(())
    }

    async fn delete_files(&self, paths: &[String]) -> StoreResult<()> {
        let paths = paths.iter().map(|p| normalize_path(p)).collect::<StoreResult<BTreeSet<String>>>()?;
        let mut by_layer: BTreeMap<LayerId, (Vec<String>, Vec<RecordId>)> = BTreeMap::new();
        for path in paths {
            let records = self.database.get_records_by_path(&path).await?;
            match records.first() {
                None => return Err(StoreError::NotFound(path)),
                Some(r) if r.item_type == ItemType::Directory => return Err(StoreError::IsDirectory(path)),
                Some(_) => {}
            }
            for record in records {
                let entry = by_layer.entry(record.layer_id).or_default();
                entry.0.push(path.clone());
                entry.1.extend(record.id);
            }
        }

        let mut layers = Vec::with_capacity(by_layer.len());
        for (layer_id, (layer_paths, ids)) in by_layer {
            let layer = self.layer_manager.get_layer(layer_id).await?;
            if !layer.is_open() {
                return Err(StoreError::Unsupported(format!("Cannot delete files from closed layer {}", layer_id)));
            }
            layers.push((layer, layer_paths, ids));
        }

        for (layer, layer_paths, ids) in layers {
            let layer_id = layer.id();
            let count = layer_paths.len();
            crate::layer::run_blocking(move || layer.delete_files(&layer_paths)).await?;
            self.database.delete_records_by_id(ids).await?;
            debug!(layer_id, files = count, "Deleted files");
        }
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> StoreResult<()> {
        let path = normalize_path(path)?;
        let top = self.layer_manager.get_top_layer();
        let top_id = top.id();

        let created = self.database.add_directory(top_id, &path).await?;
        let target = path.clone();
        if let Err(e) = crate::layer::run_blocking(move || top.create_directory(&target)).await {
            self.database.delete_records_by_id(created.iter().filter_map(|r| r.id).collect()).await?;
            return Err(e);
        }

        debug!(path = %path, layer_id = top_id, created = created.len(), "Created directory");
        Ok(())
    }

    async fn copy_directory_out_of(&self, source: &str, destination: &Path) -> StoreResult<()> {
        let source = normalize_path(source)?;
        let mut items = self.database.list_recursive(&source).await?;
        items.sort_by_key(|item| item.path.matches('/').count());

        for item in items {
            let target = resolve_within(destination, &item.path).ok_or_else(|| {
                StoreError::InvalidArgument(format!("Path resolves outside destination: {}", item.path))
            })?;
            if item.is_directory() {
                fs::create_dir_all(&target)?;
                continue;
            }

            let mut reader = self.read_file(&item.path).await?;
            crate::layer::run_blocking(move || {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                io::copy(&mut reader, &mut out)?;
                Ok(())
            })
            .await?;
        }

        info!(source = %source, destination = %destination.display(), "Copied directory out of store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ZipArchiveProvider;
    use crate::layer::DirectLayerArchiver;
    use crate::storage::MockLayerDatabase;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> Arc<LayerManager> {
        let provider = Arc::new(ZipArchiveProvider::new(dir.path().join("archive")).unwrap());
        let manager = LayerManager::new(dir.path().join("staging"), provider, Arc::new(DirectLayerArchiver::new()))
            .await
            .unwrap();
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_read_file_not_found_without_record() {
        let dir = TempDir::new().unwrap();
        let mut db = MockLayerDatabase::new();
        db.expect_get_records_by_path().returning(|_| Ok(vec![]));

        let store = LayeredItemStore::new(Arc::new(db), manager(&dir).await);
        assert!(matches!(store.read_file("missing.txt").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_read_file_returns_inline_content() {
        let dir = TempDir::new().unwrap();
        let mut db = MockLayerDatabase::new();
        db.expect_get_records_by_path()
            .returning(|_| Ok(vec![ItemRecord::file(1, "a/meta.xml").with_content(b"<a/>".to_vec())]));

        let store = LayeredItemStore::new(Arc::new(db), manager(&dir).await);
        let mut content = String::new();
        store.read_file("a//meta.xml").await.unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "<a/>");
    }

    #[tokio::test]
    async fn test_read_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut db = MockLayerDatabase::new();
        db.expect_get_records_by_path().returning(|path| Ok(vec![ItemRecord::directory(1, path)]));

        let store = LayeredItemStore::new(Arc::new(db), manager(&dir).await);
        assert!(matches!(store.read_file("a").await, Err(StoreError::IsDirectory(_))));
    }

    #[tokio::test]
    async fn test_write_file_rejects_duplicate_records_in_top_layer() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let top_id = manager.get_top_layer().id();

        let mut db = MockLayerDatabase::new();
        db.expect_get_records_by_path().returning(move |path| {
            Ok(vec![ItemRecord::file(top_id, path), ItemRecord::file(top_id, path)])
        });
        db.expect_save_records().never();

        let store = LayeredItemStore::new(Arc::new(db), manager);
        let err = store.write_file("x.txt", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_write_file_rejects_root_and_escapes() {
        let dir = TempDir::new().unwrap();
        let store = LayeredItemStore::new(Arc::new(MockLayerDatabase::new()), manager(&dir).await);
        assert!(matches!(store.write_file("", vec![]).await, Err(StoreError::InvalidArgument(_))));
        assert!(matches!(store.write_file("../x", vec![]).await, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_create_directory_touches_no_storage_when_index_refuses() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;

        let mut db = MockLayerDatabase::new();
        db.expect_add_directory()
            .returning(|_, _| Err(StoreError::InvalidArgument("Path f is already occupied by a file".into())));
        db.expect_delete_records_by_id().never();

        let store = LayeredItemStore::new(Arc::new(db), manager.clone());
        assert!(matches!(store.create_directory("f/sub").await, Err(StoreError::InvalidArgument(_))));
        assert!(manager.list_layer_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_layer_ids_mismatch_is_reported_on_both_sides() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let staged_id = manager.get_top_layer().id();
        manager.get_top_layer().create_directory("d").unwrap();

        let mut db = MockLayerDatabase::new();
        db.expect_list_layer_ids().returning(|| Ok(vec![42]));

        let store = LayeredItemStore::new(Arc::new(db), manager);
        match store.check_same_layers_on_storage_and_db().await.unwrap_err() {
            StoreError::LayerIdsMismatch { missing_in_db, missing_on_storage } => {
                assert_eq!(missing_in_db, vec![staged_id]);
                assert_eq!(missing_on_storage, vec![42]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

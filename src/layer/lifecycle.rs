use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use walkdir::WalkDir;

use crate::archive::{Archive, ItemIter};
use crate::fs::error::{StoreError, StoreResult};
use crate::fs::path::{resolve_within, to_store_path};
use crate::storage::{Item, ItemType};
use crate::types::LayerId;

use super::staging::StagingDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Open,
    Closed,
    Archived,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerState::Open => write!(f, "open"),
            LayerState::Closed => write!(f, "closed"),
            LayerState::Archived => write!(f, "archived"),
        }
    }
}

struct LayerInner {
    state: LayerState,
    staging: StagingDir,
}

/// One generation of writes: `Open -> Closed -> Archived -> (reopen) Open`.
///
/// Content operations hold a shared lock for their duration and state transitions an exclusive
/// one, so a transition waits for in-flight operations. Readers only hold the lock while opening
/// their handle; the handle stays valid after the staging directory is archived and removed.
pub struct Layer {
    id: LayerId,
    inner: RwLock<LayerInner>,
    archive: Box<dyn Archive>,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer").field("id", &self.id).field("state", &self.state()).finish()
    }
}

impl Layer {
    /// A fresh layer that accepts writes.
    pub fn new_open(staging: StagingDir, archive: Box<dyn Archive>) -> Self {
        let id = staging.id();
        Self { id, inner: RwLock::new(LayerInner { state: LayerState::Open, staging }), archive }
    }

    /// A layer whose state is taken from what exists on disk: an unsealed staging directory is
    /// open, an archive without a staging directory is archived, anything else is closed.
    pub fn load(staging: StagingDir, archive: Box<dyn Archive>) -> Self {
        let state = if staging.is_staged() && !staging.is_marked_closed() {
            LayerState::Open
        } else if archive.is_archived() && !staging.is_staged() {
            LayerState::Archived
        } else {
            LayerState::Closed
        };
        let id = staging.id();
        Self { id, inner: RwLock::new(LayerInner { state, staging }), archive }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn state(&self) -> LayerState {
        self.read_inner().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == LayerState::Open
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    pub fn is_archived(&self) -> bool {
        self.state() == LayerState::Archived
    }

    pub fn staging_path(&self) -> PathBuf {
        self.read_inner().staging.path()
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, LayerInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, LayerInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_state(&self, actual: LayerState, expected: LayerState) -> StoreResult<()> {
        if actual != expected {
            return Err(StoreError::IllegalState(format!(
                "Layer {} is {}, but must be {} for this operation",
                self.id, actual, expected
            )));
        }
        Ok(())
    }

    /// Shared access to an open layer.
    fn open_inner(&self) -> StoreResult<RwLockReadGuard<'_, LayerInner>> {
        let inner = self.read_inner();
        self.check_state(inner.state, LayerState::Open)?;
        Ok(inner)
    }

    fn resolve(&self, staging: &StagingDir, path: &str) -> StoreResult<PathBuf> {
        if !path.is_empty() && path.trim().is_empty() {
            return Err(StoreError::InvalidArgument("Path cannot be blank".to_string()));
        }
        resolve_within(&staging.path(), path).ok_or_else(|| {
            StoreError::InvalidArgument(format!("Path is outside staging directory: {}", path))
        })
    }

    pub fn create_directory(&self, path: &str) -> StoreResult<()> {
        let inner = self.open_inner()?;
        let target = self.resolve(&inner.staging, path)?;
        fs::create_dir_all(target)?;
        Ok(())
    }

    /// Writes `content` to `path`, replacing an existing file and creating missing parents.
    pub fn write_file(&self, path: &str, content: &mut dyn Read) -> StoreResult<u64> {
        let inner = self.open_inner()?;
        let target = self.resolve(&inner.staging, path)?;
        if target.is_dir() {
            return Err(StoreError::IsDirectory(path.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        let written = io::copy(content, &mut file)?;
        Ok(written)
    }

    pub fn delete_files(&self, paths: &[String]) -> StoreResult<()> {
        let inner = self.open_inner()?;
        let targets = paths
            .iter()
            .map(|path| self.resolve(&inner.staging, path))
            .collect::<StoreResult<Vec<_>>>()?;

        for (path, target) in paths.iter().zip(targets) {
            fs::remove_file(&target).map_err(|e| not_found_or_io(e, path))?;
        }
        Ok(())
    }

    pub fn delete_directory(&self, path: &str) -> StoreResult<()> {
        let inner = self.open_inner()?;
        let target = self.resolve(&inner.staging, path)?;
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        Ok(())
    }

    pub fn move_directory_internal(&self, source: &str, destination: &str) -> StoreResult<()> {
        let inner = self.open_inner()?;
        let from = self.resolve(&inner.staging, source)?;
        let to = self.resolve(&inner.staging, destination)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to).map_err(|e| not_found_or_io(e, source))?;
        Ok(())
    }

    /// Moves a directory from outside the store to `destination` in this layer.
    pub fn move_directory_into(&self, source: &Path, destination: &str) -> StoreResult<()> {
        let inner = self.open_inner()?;
        let to = self.resolve(&inner.staging, destination)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        move_tree(source, &to)
    }

    pub fn read_file(&self, path: &str) -> StoreResult<Box<dyn Read + Send>> {
        let inner = self.read_inner();
        if inner.state == LayerState::Archived {
            return self.archive.read_file(path);
        }
        let target = self.resolve(&inner.staging, path)?;
        let file = File::open(&target).map_err(|e| not_found_or_io(e, path))?;
        Ok(Box::new(file))
    }

    pub fn file_exists(&self, path: &str) -> StoreResult<bool> {
        let inner = self.read_inner();
        if inner.state == LayerState::Archived {
            return self.archive.file_exists(path);
        }
        Ok(self.resolve(&inner.staging, path)?.exists())
    }

    pub fn close(&self) -> StoreResult<()> {
        let mut inner = self.write_inner();
        self.check_state(inner.state, LayerState::Open)?;
        inner.staging.close()?;
        inner.state = LayerState::Closed;
        tracing::info!(layer_id = self.id, "Layer closed");
        Ok(())
    }

    /// Packs the staging directory and removes it. On failure the layer stays closed and the
    /// call can be repeated.
    pub fn archive(&self) -> StoreResult<()> {
        let mut inner = self.write_inner();
        self.check_state(inner.state, LayerState::Closed)?;

        if inner.staging.is_staged() {
            self.archive.archive_from(&inner.staging.path())?;
            inner.staging.remove()?;
        } else {
            tracing::debug!(layer_id = self.id, "Layer has no staged content, nothing to pack");
        }

        inner.state = LayerState::Archived;
        tracing::info!(layer_id = self.id, "Layer archived");
        Ok(())
    }

    /// Unpacks the archive into a fresh staging directory and accepts writes again.
    pub fn reopen(&self) -> StoreResult<()> {
        let mut inner = self.write_inner();
        self.check_state(inner.state, LayerState::Archived)?;

        if inner.staging.is_marked_closed() {
            inner.staging.open()?;
        }
        inner.staging.ensure_exists()?;
        if self.archive.is_archived() {
            if let Err(e) = self.archive.unarchive_to(&inner.staging.path()) {
                inner.staging.remove()?;
                return Err(e);
            }
        }

        inner.state = LayerState::Open;
        tracing::info!(layer_id = self.id, "Layer reopened");
        Ok(())
    }

    /// Every item in the layer, root directory first.
    pub fn list_all_items(&self) -> StoreResult<ItemIter> {
        let inner = self.read_inner();
        if inner.state != LayerState::Archived && inner.staging.is_staged() {
            return Ok(staging_items(inner.staging.path()));
        }
        if self.archive.is_archived() {
            return self.archive.list_all_items();
        }
        Ok(Box::new(std::iter::empty()))
    }

    /// Total size of the files in the layer. For archived layers every file is read back from
    /// the archive, which can be slow.
    pub fn size_in_bytes(&self) -> StoreResult<u64> {
        {
            let inner = self.read_inner();
            if inner.state != LayerState::Archived && inner.staging.is_staged() {
                let mut total = 0;
                for entry in WalkDir::new(inner.staging.path()) {
                    let entry = entry.map_err(|e| StoreError::Storage(e.into()))?;
                    if entry.file_type().is_file() {
                        total += entry.metadata().map_err(|e| StoreError::Storage(e.into()))?.len();
                    }
                }
                return Ok(total);
            }
        }

        let mut total = 0;
        for item in self.list_all_items()? {
            let item = item?;
            if item.item_type == ItemType::File {
                total += io::copy(&mut self.archive.read_file(&item.path)?, &mut io::sink())?;
            }
        }
        Ok(total)
    }
}

fn not_found_or_io(error: io::Error, path: &str) -> StoreError {
    if error.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(path.to_string())
    } else {
        StoreError::Io(error)
    }
}

fn staging_items(root: PathBuf) -> ItemIter {
    let walker = WalkDir::new(&root).follow_links(false).sort_by_file_name().into_iter();
    Box::new(walker.map(move |entry| {
        let entry = entry.map_err(|e| StoreError::Storage(e.into()))?;
        let relative = entry.path().strip_prefix(&root).map_err(|e| StoreError::Storage(e.into()))?;
        let path = to_store_path(relative)?;
        let item_type = if entry.file_type().is_dir() { ItemType::Directory } else { ItemType::File };
        Ok(Item::new(path, item_type))
    }))
}

/// Renames `source` to `destination`, copying and removing the tree when they are on different
/// file systems.
fn move_tree(source: &Path, destination: &Path) -> StoreResult<()> {
    match fs::rename(source, destination) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {}
        Err(e) => return Err(e.into()),
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| StoreError::Storage(e.into()))?;
        let relative = entry.path().strip_prefix(source).map_err(|e| StoreError::Storage(e.into()))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    fs::remove_dir_all(source)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ZipLayerArchive;
    use std::io::Cursor;
    use tempfile::TempDir;

    const ID: LayerId = 1700000000000;

    struct Fixture {
        _dir: TempDir,
        staging_root: PathBuf,
        archive_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let staging_root = dir.path().join("staging");
            let archive_root = dir.path().join("archive");
            fs::create_dir_all(&staging_root).unwrap();
            fs::create_dir_all(&archive_root).unwrap();
            let archive_path = archive_root.join(format!("{}.zip", ID));
            Self { _dir: dir, staging_root, archive_path }
        }

        fn layer(&self) -> Layer {
            let staging = StagingDir::new(&self.staging_root, ID).unwrap();
            Layer::new_open(staging, Box::new(ZipLayerArchive::new(&self.archive_path)))
        }

        fn loaded(&self) -> Layer {
            let staging = StagingDir::new(&self.staging_root, ID).unwrap();
            Layer::load(staging, Box::new(ZipLayerArchive::new(&self.archive_path)))
        }
    }

    fn read_string(layer: &Layer, path: &str) -> String {
        let mut content = String::new();
        layer.read_file(path).unwrap().read_to_string(&mut content).unwrap();
        content
    }

    #[test]
    fn test_write_and_read_in_open_layer() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.write_file("a/b/c.txt", &mut Cursor::new(b"hi")).unwrap();
        assert_eq!(read_string(&layer, "a/b/c.txt"), "hi");
        assert!(layer.file_exists("a/b").unwrap());
        assert!(!layer.file_exists("a/x").unwrap());
    }

    #[test]
    fn test_state_machine() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        assert_eq!(layer.state(), LayerState::Open);
        assert!(matches!(layer.archive(), Err(StoreError::IllegalState(_))));
        assert!(matches!(layer.reopen(), Err(StoreError::IllegalState(_))));

        layer.write_file("f.txt", &mut Cursor::new(b"x")).unwrap();
        layer.close().unwrap();
        assert_eq!(layer.state(), LayerState::Closed);
        assert!(matches!(layer.close(), Err(StoreError::IllegalState(_))));

        layer.archive().unwrap();
        assert!(layer.is_archived());
        assert!(matches!(layer.archive(), Err(StoreError::IllegalState(_))));

        layer.reopen().unwrap();
        assert!(layer.is_open());
        assert_eq!(read_string(&layer, "f.txt"), "x");
    }

    #[test]
    fn test_writes_require_open_layer() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.close().unwrap();
        assert!(matches!(layer.create_directory("d"), Err(StoreError::IllegalState(_))));
        assert!(matches!(
            layer.write_file("f", &mut Cursor::new(b"x")),
            Err(StoreError::IllegalState(_))
        ));
        assert!(matches!(layer.delete_files(&["f".to_string()]), Err(StoreError::IllegalState(_))));
        assert!(matches!(layer.delete_directory("d"), Err(StoreError::IllegalState(_))));
        assert!(matches!(layer.move_directory_internal("a", "b"), Err(StoreError::IllegalState(_))));
    }

    #[test]
    fn test_escaping_paths_are_rejected() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        assert!(matches!(
            layer.write_file("../evil.txt", &mut Cursor::new(b"x")),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(layer.create_directory("a/../../b"), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(layer.create_directory("   "), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(layer.read_file("../x"), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_archive_removes_staging_and_reads_from_archive() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.write_file("a/c.txt", &mut Cursor::new(b"content")).unwrap();
        let staging = layer.staging_path();
        layer.close().unwrap();
        layer.archive().unwrap();

        assert!(!staging.exists());
        assert!(!fixture.staging_root.join("1700000000000.closed").exists());
        assert!(fixture.archive_path.is_file());
        assert_eq!(read_string(&layer, "a/c.txt"), "content");
        assert!(layer.file_exists("a/c.txt").unwrap());
    }

    #[test]
    fn test_read_handle_survives_archiving() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.write_file("f.txt", &mut Cursor::new(b"still here")).unwrap();
        let mut handle = layer.read_file("f.txt").unwrap();
        layer.close().unwrap();
        layer.archive().unwrap();

        let mut content = String::new();
        handle.read_to_string(&mut content).unwrap();
        assert_eq!(content, "still here");
    }

    #[test]
    fn test_archiving_unstaged_layer_leaves_no_trace() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.close().unwrap();
        layer.archive().unwrap();
        assert!(layer.is_archived());
        assert!(!fixture.archive_path.exists());
        assert_eq!(layer.list_all_items().unwrap().count(), 0);
    }

    #[test]
    fn test_list_all_items_root_first() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.create_directory("empty").unwrap();
        layer.write_file("a/b.txt", &mut Cursor::new(b"b")).unwrap();

        let staged: Vec<Item> = layer.list_all_items().unwrap().map(Result::unwrap).collect();
        assert_eq!(
            staged,
            vec![Item::root(), Item::directory("a"), Item::file("a/b.txt"), Item::directory("empty")]
        );

        layer.close().unwrap();
        layer.archive().unwrap();
        let mut archived: Vec<Item> = layer.list_all_items().unwrap().map(Result::unwrap).collect();
        assert_eq!(archived.remove(0), Item::root());
        archived.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(archived, staged[1..].to_vec());
    }

    #[test]
    fn test_size_in_bytes() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.write_file("a.txt", &mut Cursor::new(b"12345")).unwrap();
        layer.write_file("d/b.txt", &mut Cursor::new(b"123")).unwrap();
        assert_eq!(layer.size_in_bytes().unwrap(), 8);
        layer.close().unwrap();
        layer.archive().unwrap();
        assert_eq!(layer.size_in_bytes().unwrap(), 8);
    }

    #[test]
    fn test_load_infers_state_from_disk() {
        let fixture = Fixture::new();
        {
            let layer = fixture.layer();
            layer.write_file("f", &mut Cursor::new(b"x")).unwrap();
        }
        assert_eq!(fixture.loaded().state(), LayerState::Open);

        let layer = fixture.loaded();
        layer.close().unwrap();
        assert_eq!(fixture.loaded().state(), LayerState::Closed);

        layer.archive().unwrap();
        assert_eq!(fixture.loaded().state(), LayerState::Archived);
    }

    #[test]
    fn test_delete_and_move_in_staging() {
        let fixture = Fixture::new();
        let layer = fixture.layer();
        layer.write_file("src/x.txt", &mut Cursor::new(b"x")).unwrap();
        layer.write_file("y.txt", &mut Cursor::new(b"y")).unwrap();

        layer.move_directory_internal("src", "dst/inner").unwrap();
        assert_eq!(read_string(&layer, "dst/inner/x.txt"), "x");
        assert!(matches!(layer.read_file("src/x.txt"), Err(StoreError::NotFound(_))));

        layer.delete_files(&["y.txt".to_string()]).unwrap();
        assert!(!layer.file_exists("y.txt").unwrap());
        layer.delete_directory("dst").unwrap();
        assert!(!layer.file_exists("dst").unwrap());
    }

    #[test]
    fn test_move_directory_into() {
        let fixture = Fixture::new();
        let external = TempDir::new().unwrap();
        let source = external.path().join("incoming");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/z.txt"), b"z").unwrap();

        let layer = fixture.layer();
        layer.move_directory_into(&source, "imported").unwrap();
        assert!(!source.exists());
        assert_eq!(read_string(&layer, "imported/sub/z.txt"), "z");
    }
}

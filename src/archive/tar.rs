use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ::tar::{Builder, EntryType, Header};
use tempfile::NamedTempFile;

use crate::fs::error::{StoreError, StoreResult};
use crate::storage::Item;
use crate::types::LayerId;

use super::{
    Archive, ArchiveProvider, ItemIter, collect_source_entries, ensure_archive_root,
    item_from_entry_name, list_layers_with_extension, resolve_entries,
};

const EXTENSION: &str = "tar";

/// A layer packed into a single uncompressed tar file.
pub struct TarLayerArchive {
    path: PathBuf,
    archived: AtomicBool,
}

fn entry_name<R: Read>(entry: &::tar::Entry<'_, R>) -> String {
    let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    match raw.strip_prefix("./") {
        Some(stripped) => stripped.to_string(),
        None => raw,
    }
}

fn is_directory_entry(entry_type: EntryType) -> StoreResult<bool> {
    match entry_type {
        EntryType::Directory => Ok(true),
        EntryType::Regular | EntryType::Continuous => Ok(false),
        other => Err(StoreError::InvalidArgument(format!("Unsupported tar entry type: {:?}", other))),
    }
}

impl TarLayerArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let archived = AtomicBool::new(path.is_file());
        Self { path, archived }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<::tar::Archive<BufReader<File>>> {
        let file = File::open(&self.path)?;
        Ok(::tar::Archive::new(BufReader::new(file)))
    }

    /// Names and directory flags of all entries, in archive order.
    fn entry_names(&self) -> StoreResult<Vec<(String, bool)>> {
        let mut archive = self.open()?;
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            let is_dir = is_directory_entry(entry.header().entry_type())?;
            names.push((entry_name(&entry), is_dir));
        }
        Ok(names)
    }

    fn write_archive(&self, staging_dir: &Path) -> StoreResult<()> {
        let entries = collect_source_entries(staging_dir)?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(parent)?;

        let mut builder = Builder::new(BufWriter::new(temp.reopen()?));
        builder.follow_symlinks(false);
        for entry in &entries {
            let metadata = fs::metadata(&entry.source)?;
            let mut header = Header::new_gnu();
            header.set_metadata(&metadata);
            if entry.is_dir {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, format!("{}/", entry.name), io::empty())?;
            } else {
                header.set_entry_type(EntryType::Regular);
                header.set_size(metadata.len());
                builder.append_data(&mut header, &entry.name, File::open(&entry.source)?)?;
            }
        }
        let mut writer = builder.into_inner()?;
        writer.flush()?;
        drop(writer);

        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

impl Archive for TarLayerArchive {
    fn read_file(&self, path: &str) -> StoreResult<Box<dyn Read + Send>> {
        let mut archive = self.open()?;
        let mut found = None;
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_file() && entry_name(&entry) == path {
                found = Some((entry.raw_file_position(), entry.size()));
                break;
            }
        }
        drop(archive);

        let (position, size) =
            found.ok_or_else(|| StoreError::NotFound(format!("{} in {}", path, self.path.display())))?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(position))?;
        Ok(Box::new(BufReader::new(file).take(size)))
    }

    fn file_exists(&self, path: &str) -> StoreResult<bool> {
        if !self.path.is_file() {
            return Ok(false);
        }
        let names = self.entry_names()?;
        Ok(names.iter().any(|(name, _)| name.trim_end_matches('/') == path))
    }

    fn unarchive_to(&self, staging_dir: &Path) -> StoreResult<()> {
        let names = self.entry_names()?;
        let targets = resolve_entries(staging_dir, names.iter().map(|(name, _)| name.as_str()))?;

        fs::create_dir_all(staging_dir)?;
        let mut archive = self.open()?;
        for (entry, target) in archive.entries()?.zip(&targets) {
            let mut entry = entry?;
            if is_directory_entry(entry.header().entry_type())? {
                fs::create_dir_all(target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(target)?;
            io::copy(&mut entry, &mut out)?;
        }

        tracing::debug!(archive = %self.path.display(), entries = names.len(), "Unpacked tar archive");
        Ok(())
    }

    fn archive_from(&self, staging_dir: &Path) -> StoreResult<()> {
        self.write_archive(staging_dir)?;
        self.archived.store(true, Ordering::SeqCst);
        tracing::debug!(archive = %self.path.display(), "Created tar archive");
        Ok(())
    }

    fn is_archived(&self) -> bool {
        self.archived.load(Ordering::SeqCst)
    }

    /// Entries are read up front since a tar stream can only be walked while it is borrowed.
    fn list_all_items(&self) -> StoreResult<ItemIter> {
        let names = self.entry_names()?;
        let items = std::iter::once(Item::root())
            .chain(names.into_iter().map(|(name, is_dir)| item_from_entry_name(&name, is_dir)))
            .map(Ok);
        Ok(Box::new(items.collect::<Vec<_>>().into_iter()))
    }
}

/// Keeps one `<layer id>.tar` file per archived layer under `archive_root`.
pub struct TarArchiveProvider {
    archive_root: PathBuf,
}

impl TarArchiveProvider {
    pub fn new(archive_root: impl Into<PathBuf>) -> StoreResult<Self> {
        let archive_root = archive_root.into();
        ensure_archive_root(&archive_root)?;
        Ok(Self { archive_root })
    }

    fn archive_path(&self, layer_id: LayerId) -> PathBuf {
        self.archive_root.join(format!("{}.{}", layer_id, EXTENSION))
    }
}

impl ArchiveProvider for TarArchiveProvider {
    fn create_archive(&self, layer_id: LayerId) -> StoreResult<Box<dyn Archive>> {
        Ok(Box::new(TarLayerArchive::new(self.archive_path(layer_id))))
    }

    fn exists(&self, layer_id: LayerId) -> StoreResult<bool> {
        Ok(self.archive_path(layer_id).is_file())
    }

    fn list_archived_layers(&self) -> StoreResult<Vec<LayerId>> {
        list_layers_with_extension(&self.archive_root, EXTENSION)
    }
}

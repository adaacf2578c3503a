//! Packed, immutable representations of closed layers.
//!
//! A layer is archived into one object named after its id. The [`Archive`] trait hides the
//! format; an [`ArchiveProvider`] creates archives by layer id and enumerates the ones that
//! exist, so neither [`crate::layer::Layer`] nor [`crate::layer::LayerManager`] know which
//! format is in use.

pub mod dmftar;
pub mod tar;
pub mod zip;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::config::{ArchiveFormat, Config};
use crate::fs::error::{StoreError, StoreResult};
use crate::fs::path::{resolve_within, to_store_path};
use crate::storage::Item;
use crate::types::LayerId;

pub use self::dmftar::{DmfTarArchiveProvider, DmfTarLayerArchive, DmfTarRunner, SshRunner};
pub use self::tar::{TarArchiveProvider, TarLayerArchive};
pub use self::zip::{ZipArchiveProvider, ZipLayerArchive};

/// Lazy sequence of the items in an archive. The root directory always comes first.
pub type ItemIter = Box<dyn Iterator<Item = StoreResult<Item>> + Send>;

pub trait Archive: Send + Sync {
    /// Opens the entry at `path`. The returned reader does not borrow the archive.
    fn read_file(&self, path: &str) -> StoreResult<Box<dyn Read + Send>>;

    fn file_exists(&self, path: &str) -> StoreResult<bool>;

    /// Extracts every entry under `staging_dir`. Nothing is written unless every entry
    /// resolves inside `staging_dir`.
    fn unarchive_to(&self, staging_dir: &Path) -> StoreResult<()>;

    /// Packs the contents of `staging_dir` (not the directory itself). A failed call leaves no
    /// archive behind.
    fn archive_from(&self, staging_dir: &Path) -> StoreResult<()>;

    fn is_archived(&self) -> bool;

    fn list_all_items(&self) -> StoreResult<ItemIter>;
}

pub trait ArchiveProvider: Send + Sync {
    fn create_archive(&self, layer_id: LayerId) -> StoreResult<Box<dyn Archive>>;

    fn exists(&self, layer_id: LayerId) -> StoreResult<bool>;

    fn list_archived_layers(&self) -> StoreResult<Vec<LayerId>>;
}

/// Builds the provider selected by `store.archive_format`.
pub fn provider_from_config(config: &Config) -> StoreResult<Arc<dyn ArchiveProvider>> {
    let root = config.store.archive_root.clone();
    let provider: Arc<dyn ArchiveProvider> = match config.store.archive_format {
        ArchiveFormat::Zip => Arc::new(ZipArchiveProvider::new(root)?),
        ArchiveFormat::Tar => Arc::new(TarArchiveProvider::new(root)?),
        ArchiveFormat::DmfTar => Arc::new(DmfTarArchiveProvider::from_config(&config.dmftar)?),
    };
    Ok(provider)
}

/// A file or directory found under a directory that is about to be archived.
#[derive(Debug, Clone)]
pub(crate) struct SourceEntry {
    pub name: String,
    pub source: PathBuf,
    pub is_dir: bool,
}

/// Walks `source_dir` in a stable order, parents before children. Symbolic links cannot be
/// represented in every format and are refused.
pub(crate) fn collect_source_entries(source_dir: &Path) -> StoreResult<Vec<SourceEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(source_dir).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::Storage(e.into()))?;
        let relative = entry.path().strip_prefix(source_dir).map_err(|e| StoreError::Storage(e.into()))?;
        let name = to_store_path(relative)?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(StoreError::InvalidArgument(format!(
                "Cannot archive symbolic link: {}",
                name
            )));
        }
        entries.push(SourceEntry { name, source: entry.path().to_path_buf(), is_dir: file_type.is_dir() });
    }
    Ok(entries)
}

/// Resolves every entry name against `dest`, in order, failing with all offending names at once
/// when any of them would land outside it.
pub(crate) fn resolve_entries<'a, I>(dest: &Path, names: I) -> StoreResult<Vec<PathBuf>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut resolved = Vec::new();
    let mut escaping = Vec::new();
    for name in names {
        match resolve_within(dest, name) {
            Some(path) => resolved.push(path),
            None => escaping.push(name.to_string()),
        }
    }

    if !escaping.is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "Archive entries resolve outside the target directory: {:?}",
            escaping
        )));
    }
    Ok(resolved)
}

/// Strips the trailing separator a directory entry name carries and classifies it.
pub(crate) fn item_from_entry_name(name: &str, is_dir: bool) -> Item {
    let trimmed = name.trim_end_matches('/');
    if is_dir || name.ends_with('/') { Item::directory(trimmed) } else { Item::file(trimmed) }
}

/// Layer ids of all `<id>.<extension>` files under `root`.
pub(crate) fn list_layers_with_extension(root: &Path, extension: &str) -> StoreResult<Vec<LayerId>> {
    let suffix = format!(".{}", extension);
    let mut ids = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(suffix.as_str())) else {
            continue;
        };
        if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = stem.parse::<LayerId>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

pub(crate) fn ensure_archive_root(root: &Path) -> StoreResult<()> {
    if root.exists() && !root.is_dir() {
        return Err(StoreError::InvalidArgument(format!("Not a directory: {}", root.display())));
    }
    fs::create_dir_all(root)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_source_entries_relative_and_ordered() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), b"c").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let entries = collect_source_entries(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a/b", "a/b/c.txt", "empty"]);
        assert!(entries[0].is_dir);
        assert!(!entries[2].is_dir);
    }

    #[test]
    fn test_resolve_entries_reports_all_escapes() {
        let dest = Path::new("/tmp/dest");
        let err = resolve_entries(dest, ["ok.txt", "../evil", "a/../../worse"]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("../evil"));
        assert!(message.contains("a/../../worse"));
    }

    #[test]
    fn test_resolve_entries_keeps_order() {
        let dest = Path::new("/tmp/dest");
        let resolved = resolve_entries(dest, ["./", "a/", "a/b.txt"]).unwrap();
        assert_eq!(resolved, vec![dest.to_path_buf(), dest.join("a"), dest.join("a/b.txt")]);
    }

    #[test]
    fn test_item_from_entry_name() {
        assert_eq!(item_from_entry_name("a/b/", false), Item::directory("a/b"));
        assert_eq!(item_from_entry_name("a/b", true), Item::directory("a/b"));
        assert_eq!(item_from_entry_name("a/c.txt", false), Item::file("a/c.txt"));
    }

    #[test]
    fn test_list_layers_with_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("1700000000000.zip"), b"").unwrap();
        fs::write(dir.path().join("1700000000001.zip"), b"").unwrap();
        fs::write(dir.path().join("1700000000002.tar"), b"").unwrap();
        fs::write(dir.path().join(".tmpXYZ"), b"").unwrap();
        fs::write(dir.path().join("notes.zip"), b"").unwrap();

        let ids = list_layers_with_extension(dir.path(), "zip").unwrap();
        assert_eq!(ids, vec![1700000000000, 1700000000001]);
    }
}

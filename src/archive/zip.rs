use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ::zip::result::ZipError;
use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipArchive, ZipWriter};
use flate2::read::DeflateDecoder;
use tempfile::NamedTempFile;

use crate::fs::error::{StoreError, StoreResult};
use crate::storage::Item;
use crate::types::LayerId;

use super::{
    Archive, ArchiveProvider, ItemIter, collect_source_entries, ensure_archive_root,
    item_from_entry_name, list_layers_with_extension, resolve_entries,
};

const EXTENSION: &str = "zip";

type ZipReader = ZipArchive<BufReader<File>>;

/// A layer packed into a single zip file. Directories are stored as entries ending in `/`.
pub struct ZipLayerArchive {
    path: PathBuf,
    archived: AtomicBool,
}

impl ZipLayerArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let archived = AtomicBool::new(path.is_file());
        Self { path, archived }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<ZipReader> {
        let file = File::open(&self.path)?;
        Ok(ZipArchive::new(BufReader::new(file))?)
    }

    fn write_archive(&self, staging_dir: &Path) -> StoreResult<()> {
        let entries = collect_source_entries(staging_dir)?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(parent)?;

        {
            let mut writer = ZipWriter::new(temp.as_file_mut());
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

            for entry in &entries {
                if entry.is_dir {
                    writer.add_directory(entry.name.as_str(), options)?;
                } else {
                    let size = fs::metadata(&entry.source)?.len();
                    writer.start_file(entry.name.as_str(), options.large_file(size >= u32::MAX as u64))?;
                    let mut source = File::open(&entry.source)?;
                    io::copy(&mut source, &mut writer)?;
                }
            }
            writer.finish()?;
        }

        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

impl Archive for ZipLayerArchive {
    /// Streams the entry straight from the archive file. The zip index is only used to locate
    /// the entry's data, so the returned reader holds nothing but its own file handle.
    fn read_file(&self, path: &str) -> StoreResult<Box<dyn Read + Send>> {
        let mut archive = self.open()?;
        let (data_start, compressed_size, method) = match archive.by_name(path) {
            Ok(entry) => (entry.data_start(), entry.compressed_size(), entry.compression()),
            Err(ZipError::FileNotFound) => {
                return Err(StoreError::NotFound(format!("{} in {}", path, self.path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        drop(archive);

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(data_start))?;
        let raw = BufReader::new(file).take(compressed_size);
        match method {
            CompressionMethod::Stored => Ok(Box::new(raw)),
            CompressionMethod::Deflated => Ok(Box::new(DeflateDecoder::new(raw))),
            other => Err(StoreError::Unsupported(format!(
                "Compression method {:?} of {} in {}",
                other,
                path,
                self.path.display()
            ))),
        }
    }

    fn file_exists(&self, path: &str) -> StoreResult<bool> {
        if !self.path.is_file() {
            return Ok(false);
        }
        let archive = self.open()?;
        let directory_name = format!("{}/", path);
        let exists = archive.file_names().any(|name| name == path || name == directory_name);
        Ok(exists)
    }

    fn unarchive_to(&self, staging_dir: &Path) -> StoreResult<()> {
        let mut archive = self.open()?;

        let mut names = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            names.push((entry.name().to_string(), entry.is_dir()));
        }
        let targets = resolve_entries(staging_dir, names.iter().map(|(name, _)| name.as_str()))?;

        fs::create_dir_all(staging_dir)?;
        for (index, (target, (_, is_dir))) in targets.iter().zip(&names).enumerate() {
            if *is_dir {
                fs::create_dir_all(target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut entry = archive.by_index(index)?;
            let mut out = File::create(target)?;
            io::copy(&mut entry, &mut out)?;
        }

        tracing::debug!(archive = %self.path.display(), entries = names.len(), "Unpacked zip archive");
        Ok(())
    }

    fn archive_from(&self, staging_dir: &Path) -> StoreResult<()> {
        self.write_archive(staging_dir)?;
        self.archived.store(true, Ordering::SeqCst);
        tracing::debug!(archive = %self.path.display(), "Created zip archive");
        Ok(())
    }

    fn is_archived(&self) -> bool {
        self.archived.load(Ordering::SeqCst)
    }

    fn list_all_items(&self) -> StoreResult<ItemIter> {
        let archive = self.open()?;
        Ok(Box::new(ZipItemIter { archive, next: 0, root_emitted: false }))
    }
}

struct ZipItemIter {
    archive: ZipReader,
    next: usize,
    root_emitted: bool,
}

impl Iterator for ZipItemIter {
    type Item = StoreResult<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.root_emitted {
            self.root_emitted = true;
            return Some(Ok(Item::root()));
        }
        if self.next >= self.archive.len() {
            return None;
        }

        let index = self.next;
        self.next += 1;
        Some(
            self.archive
                .by_index(index)
                .map(|entry| item_from_entry_name(entry.name(), entry.is_dir()))
                .map_err(StoreError::from),
        )
    }
}

/// Keeps one `<layer id>.zip` file per archived layer under `archive_root`.
pub struct ZipArchiveProvider {
    archive_root: PathBuf,
}

impl ZipArchiveProvider {
    pub fn new(archive_root: impl Into<PathBuf>) -> StoreResult<Self> {
        let archive_root = archive_root.into();
        ensure_archive_root(&archive_root)?;
        Ok(Self { archive_root })
    }

    fn archive_path(&self, layer_id: LayerId) -> PathBuf {
        self.archive_root.join(format!("{}.{}", layer_id, EXTENSION))
    }
}

impl ArchiveProvider for ZipArchiveProvider {
    fn create_archive(&self, layer_id: LayerId) -> StoreResult<Box<dyn Archive>> {
        Ok(Box::new(ZipLayerArchive::new(self.archive_path(layer_id))))
    }

    fn exists(&self, layer_id: LayerId) -> StoreResult<bool> {
        Ok(self.archive_path(layer_id).is_file())
    }

    fn list_archived_layers(&self) -> StoreResult<Vec<LayerId>> {
        list_layers_with_extension(&self.archive_root, EXTENSION)
    }
}

//! Layers archived on a remote tape store through the `dmftar` tool.
//!
//! `dmftar` and `ssh` are spawned directly, never through a local shell. `ssh` does hand its
//! trailing arguments to the remote shell, so every value that ends up in a command line is
//! checked against an allow-list first.

use std::io::{Cursor, Read};
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::DmfTarConfig;
use crate::fs::error::{StoreError, StoreResult};
use crate::storage::Item;
use crate::types::LayerId;

use super::{Archive, ArchiveProvider, ItemIter, item_from_entry_name, resolve_entries};

const EXTENSION: &str = "dmftar";
const CACHE_ENTRY_PREFIX: &str = "dmftar-cache.";
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '<', '>'];

pub fn check_user_or_host(value: &str) -> StoreResult<&str> {
    let valid = !value.is_empty()
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(value)
    } else {
        Err(StoreError::InvalidArgument(format!("Invalid user or host name: {}", value)))
    }
}

pub fn check_remote_base_dir(value: &str) -> StoreResult<&str> {
    if value.is_empty() || value.contains("..") || has_shell_metacharacters(value) {
        return Err(StoreError::InvalidArgument(format!("Invalid remote base directory: {}", value)));
    }
    Ok(value)
}

pub fn check_executable(value: &str) -> StoreResult<&str> {
    if value.is_empty() || has_shell_metacharacters(value) {
        return Err(StoreError::InvalidArgument(format!("Invalid executable path: {}", value)));
    }
    Ok(value)
}

fn has_shell_metacharacters(value: &str) -> bool {
    value.chars().any(|c| c.is_whitespace() || SHELL_METACHARACTERS.contains(&c))
}

fn check_archive_name(value: &str) -> StoreResult<&str> {
    let valid = !value.is_empty()
        && !value.starts_with('.')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(value)
    } else {
        Err(StoreError::InvalidArgument(format!("Invalid archive name: {}", value)))
    }
}

/// Extracts the entry path from one line of `dmftar -tf` output, which looks like
/// `-rw-rw-r-- user/group 4777 2025-07-14 11:25 ./text/loro.txt`.
///
/// Returns `None` for the archive root and for the tool's own cache entries.
pub fn parse_listing_line(line: &str) -> StoreResult<Option<Item>> {
    let index = line.find("./").ok_or_else(|| {
        StoreError::IllegalState(format!("Malformed dmftar listing entry (no './' found): {}", line))
    })?;
    let path = &line[index + 2..];
    let is_dir = path.ends_with('/') || line.starts_with('d');
    let trimmed = path.trim_end_matches('/');

    let file_name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if trimmed.is_empty() || file_name.starts_with(CACHE_ENTRY_PREFIX) {
        return Ok(None);
    }
    Ok(Some(item_from_entry_name(path, is_dir)))
}

fn run(command: &mut Command) -> StoreResult<Output> {
    tracing::debug!(command = ?command, "Running external command");
    Ok(command.output()?)
}

fn failure(action: &str, output: &Output) -> StoreError {
    StoreError::Storage(anyhow::anyhow!(
        "{} failed with {}: {}",
        action,
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

/// Runs `dmftar` against archives in `<user>@<host>:<remote base dir>`.
#[derive(Debug, Clone)]
pub struct DmfTarRunner {
    executable: String,
    user: String,
    host: String,
    remote_base_dir: String,
}

impl DmfTarRunner {
    pub fn new(executable: &str, user: &str, host: &str, remote_base_dir: &str) -> StoreResult<Self> {
        Ok(Self {
            executable: check_executable(executable)?.to_string(),
            user: check_user_or_host(user)?.to_string(),
            host: check_user_or_host(host)?.to_string(),
            remote_base_dir: check_remote_base_dir(remote_base_dir)?.trim_end_matches('/').to_string(),
        })
    }

    pub fn remote_path(&self, archive_name: &str) -> StoreResult<String> {
        Ok(format!(
            "{}@{}:{}/{}",
            self.user,
            self.host,
            self.remote_base_dir,
            check_archive_name(archive_name)?
        ))
    }

    /// Packs `directory` relative to itself, so entries are stored as `./<path>`.
    pub fn tar_directory(&self, directory: &Path, archive_name: &str) -> StoreResult<()> {
        let output = run(Command::new(&self.executable)
            .arg("-cf")
            .arg(self.remote_path(archive_name)?)
            .arg(".")
            .current_dir(directory))?;
        if !output.status.success() {
            return Err(failure("Creating dmftar archive", &output));
        }
        Ok(())
    }

    /// Extracts the whole archive into `directory`.
    pub fn untar_to(&self, archive_name: &str, directory: &Path) -> StoreResult<()> {
        let output = run(Command::new(&self.executable)
            .arg("-q")
            .arg("-xf")
            .arg(self.remote_path(archive_name)?)
            .current_dir(directory))?;
        if !output.status.success() {
            return Err(failure("Extracting dmftar archive", &output));
        }
        Ok(())
    }

    pub fn read_file(&self, archive_name: &str, path: &str) -> StoreResult<Vec<u8>> {
        let output = run(Command::new(&self.executable)
            .arg("-o=-O")
            .arg("-q")
            .arg("-xf")
            .arg(self.remote_path(archive_name)?)
            .arg(format!("./{}", path)))?;
        if !output.status.success() {
            return Err(StoreError::NotFound(format!(
                "{} in {}: {}",
                path,
                archive_name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Raw `-tf` listing lines.
    pub fn list_files(&self, archive_name: &str) -> StoreResult<Vec<String>> {
        let output = run(Command::new(&self.executable)
            .arg("-tf")
            .arg("-q")
            .arg(self.remote_path(archive_name)?))?;
        if !output.status.success() {
            return Err(failure("Listing dmftar archive", &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
    }
}

/// Inspects the remote archive directory over `ssh`.
#[derive(Debug, Clone)]
pub struct SshRunner {
    executable: String,
    user: String,
    host: String,
    remote_base_dir: String,
}

impl SshRunner {
    pub fn new(executable: &str, user: &str, host: &str, remote_base_dir: &str) -> StoreResult<Self> {
        Ok(Self {
            executable: check_executable(executable)?.to_string(),
            user: check_user_or_host(user)?.to_string(),
            host: check_user_or_host(host)?.to_string(),
            remote_base_dir: check_remote_base_dir(remote_base_dir)?.trim_end_matches('/').to_string(),
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn file_exists(&self, archive_name: &str) -> StoreResult<bool> {
        let remote = format!("{}/{}", self.remote_base_dir, check_archive_name(archive_name)?);
        let output = run(Command::new(&self.executable)
            .arg(self.destination())
            .arg("test")
            .arg("-e")
            .arg(remote))?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failure("Checking remote archive", &output)),
        }
    }

    pub fn list_files(&self) -> StoreResult<Vec<String>> {
        let output = run(Command::new(&self.executable)
            .arg(self.destination())
            .arg("ls")
            .arg("-1")
            .arg(&self.remote_base_dir))?;
        if !output.status.success() {
            return Err(failure("Listing remote archives", &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
    }
}

/// A layer stored as `<layer id>.dmftar` on the remote tape store.
///
/// Unlike the local formats, an interrupted pack can leave a partial remote archive behind.
pub struct DmfTarLayerArchive {
    runner: Arc<DmfTarRunner>,
    archive_name: String,
    archived: AtomicBool,
}

impl DmfTarLayerArchive {
    pub fn new(runner: Arc<DmfTarRunner>, archive_name: impl Into<String>, archived: bool) -> Self {
        Self { runner, archive_name: archive_name.into(), archived: AtomicBool::new(archived) }
    }

    fn items(&self) -> StoreResult<Vec<Item>> {
        let mut items = Vec::new();
        for line in self.runner.list_files(&self.archive_name)? {
            if line.trim().is_empty() {
                continue;
            }
            items.extend(parse_listing_line(&line)?);
        }
        Ok(items)
    }
}

impl Archive for DmfTarLayerArchive {
    fn read_file(&self, path: &str) -> StoreResult<Box<dyn Read + Send>> {
        let content = self.runner.read_file(&self.archive_name, path)?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn file_exists(&self, path: &str) -> StoreResult<bool> {
        if !self.is_archived() {
            return Ok(false);
        }
        Ok(self.items()?.iter().any(|item| item.path == path))
    }

    fn unarchive_to(&self, staging_dir: &Path) -> StoreResult<()> {
        let items = self.items()?;
        resolve_entries(staging_dir, items.iter().map(|item| item.path.as_str()))?;
        std::fs::create_dir_all(staging_dir)?;
        self.runner.untar_to(&self.archive_name, staging_dir)
    }

    fn archive_from(&self, staging_dir: &Path) -> StoreResult<()> {
        self.runner.tar_directory(staging_dir, &self.archive_name)?;
        self.archived.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_archived(&self) -> bool {
        self.archived.load(Ordering::SeqCst)
    }

    fn list_all_items(&self) -> StoreResult<ItemIter> {
        let mut items = vec![Ok(Item::root())];
        items.extend(self.items()?.into_iter().map(Ok));
        Ok(Box::new(items.into_iter()))
    }
}

pub struct DmfTarArchiveProvider {
    dmftar: Arc<DmfTarRunner>,
    ssh: SshRunner,
}

impl DmfTarArchiveProvider {
    pub fn new(dmftar: DmfTarRunner, ssh: SshRunner) -> Self {
        Self { dmftar: Arc::new(dmftar), ssh }
    }

    pub fn from_config(config: &DmfTarConfig) -> StoreResult<Self> {
        let dmftar =
            DmfTarRunner::new(&config.executable, &config.user, &config.host, &config.remote_base_dir)?;
        let ssh =
            SshRunner::new(&config.ssh_executable, &config.user, &config.host, &config.remote_base_dir)?;
        Ok(Self::new(dmftar, ssh))
    }

    fn archive_name(layer_id: LayerId) -> String {
        format!("{}.{}", layer_id, EXTENSION)
    }
}

impl ArchiveProvider for DmfTarArchiveProvider {
    fn create_archive(&self, layer_id: LayerId) -> StoreResult<Box<dyn Archive>> {
        let archived = self.exists(layer_id)?;
        Ok(Box::new(DmfTarLayerArchive::new(self.dmftar.clone(), Self::archive_name(layer_id), archived)))
    }

    fn exists(&self, layer_id: LayerId) -> StoreResult<bool> {
        self.ssh.file_exists(&Self::archive_name(layer_id))
    }

    fn list_archived_layers(&self) -> StoreResult<Vec<LayerId>> {
        let suffix = format!(".{}", EXTENSION);
        let mut ids: Vec<LayerId> = self
            .ssh
            .list_files()?
            .iter()
            .filter_map(|name| name.trim().strip_suffix(suffix.as_str()))
            .filter(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
            .filter_map(|stem| stem.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

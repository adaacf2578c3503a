use std::fs;
use std::path::{Path, PathBuf};

use crate::fs::error::{StoreError, StoreResult};
use crate::types::LayerId;

const CLOSED_SUFFIX: &str = ".closed";
const MIN_ID_DIGITS: usize = 13;

/// Parses a staging directory name: a layer id of at least 13 digits, optionally followed by
/// `.closed`. Returns the id and whether the name marks a closed layer.
pub fn parse_staging_name(name: &str) -> Option<(LayerId, bool)> {
    let (digits, closed) = match name.strip_suffix(CLOSED_SUFFIX) {
        Some(digits) => (digits, true),
        None => (name, false),
    };
    if digits.len() < MIN_ID_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|id| (id, closed))
}

/// The plain directory holding a layer's content until it is archived.
///
/// An open layer lives in `<root>/<id>`; sealing it renames the directory to
/// `<root>/<id>.closed`. The directory itself may not exist yet.
#[derive(Debug, Clone)]
pub struct StagingDir {
    root: PathBuf,
    id: LayerId,
    closed: bool,
}

impl StagingDir {
    /// Staging directory for `id`, picking up a sealed directory if one exists.
    pub fn new(root: impl Into<PathBuf>, id: LayerId) -> StoreResult<Self> {
        let root = root.into();
        if parse_staging_name(&id.to_string()).is_none() {
            return Err(StoreError::InvalidArgument(format!("Invalid layer name: {}", id)));
        }
        let closed = root.join(format!("{}{}", id, CLOSED_SUFFIX)).exists();
        let staging = Self { root, id, closed };
        staging.validate_open_or_closed()?;
        Ok(staging)
    }

    /// Staging directory for an existing entry of the staging root.
    pub fn from_path(path: &Path) -> StoreResult<Self> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let (id, closed) = parse_staging_name(name).ok_or_else(|| {
            StoreError::InvalidArgument(format!("Invalid layer name: {}", path.display()))
        })?;
        if path.exists() && !path.is_dir() {
            return Err(StoreError::InvalidArgument(format!("Not a directory: {}", path.display())));
        }
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let staging = Self { root, id, closed };
        staging.validate_open_or_closed()?;
        Ok(staging)
    }

    fn open_path(&self) -> PathBuf {
        self.root.join(self.id.to_string())
    }

    fn closed_path(&self) -> PathBuf {
        self.root.join(format!("{}{}", self.id, CLOSED_SUFFIX))
    }

    fn validate_open_or_closed(&self) -> StoreResult<()> {
        if self.open_path().exists() && self.closed_path().exists() {
            return Err(StoreError::IllegalState(format!("Layer {} is both open and closed", self.id)));
        }
        Ok(())
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn path(&self) -> PathBuf {
        if self.closed { self.closed_path() } else { self.open_path() }
    }

    pub fn is_staged(&self) -> bool {
        self.path().is_dir()
    }

    /// Whether the directory name carries the closed marker.
    pub fn is_marked_closed(&self) -> bool {
        self.closed
    }

    pub fn ensure_exists(&self) -> StoreResult<()> {
        fs::create_dir_all(self.path())?;
        Ok(())
    }

    /// Renames `<id>` to `<id>.closed` if the directory exists.
    pub fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::IllegalState(format!("Staging directory of layer {} is already closed", self.id)));
        }
        if self.open_path().exists() {
            fs::rename(self.open_path(), self.closed_path())?;
        }
        self.closed = true;
        Ok(())
    }

    /// Renames `<id>.closed` back to `<id>` if the directory exists.
    pub fn open(&mut self) -> StoreResult<()> {
        if !self.closed {
            return Err(StoreError::IllegalState(format!("Staging directory of layer {} is already open", self.id)));
        }
        if self.closed_path().exists() {
            fs::rename(self.closed_path(), self.open_path())?;
        }
        self.closed = false;
        Ok(())
    }

    pub fn remove(&self) -> StoreResult<()> {
        let path = self.path();
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID: LayerId = 1700000000000;

    #[test]
    fn test_parse_staging_name() {
        assert_eq!(parse_staging_name("1700000000000"), Some((ID, false)));
        assert_eq!(parse_staging_name("1700000000000.closed"), Some((ID, true)));
        assert_eq!(parse_staging_name("17000000000000"), Some((17000000000000, false)));
        assert_eq!(parse_staging_name("123"), None);
        assert_eq!(parse_staging_name("1700000000000.open"), None);
        assert_eq!(parse_staging_name("abc0000000000"), None);
    }

    #[test]
    fn test_new_is_open_and_not_staged() {
        let root = TempDir::new().unwrap();
        let staging = StagingDir::new(root.path(), ID).unwrap();
        assert!(!staging.is_staged());
        assert!(!staging.is_marked_closed());
        assert_eq!(staging.path(), root.path().join("1700000000000"));
    }

    #[test]
    fn test_new_rejects_short_id() {
        let root = TempDir::new().unwrap();
        assert!(StagingDir::new(root.path(), 42).is_err());
    }

    #[test]
    fn test_close_and_open_rename_directory() {
        let root = TempDir::new().unwrap();
        let mut staging = StagingDir::new(root.path(), ID).unwrap();
        staging.ensure_exists().unwrap();

        staging.close().unwrap();
        assert!(root.path().join("1700000000000.closed").is_dir());
        assert!(!root.path().join("1700000000000").exists());
        assert!(staging.close().is_err());

        staging.open().unwrap();
        assert!(root.path().join("1700000000000").is_dir());
        assert!(staging.open().is_err());
    }

    #[test]
    fn test_new_picks_up_closed_directory() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("1700000000000.closed")).unwrap();
        let staging = StagingDir::new(root.path(), ID).unwrap();
        assert!(staging.is_marked_closed());
        assert!(staging.is_staged());
    }

    #[test]
    fn test_both_open_and_closed_is_an_error() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("1700000000000")).unwrap();
        fs::create_dir(root.path().join("1700000000000.closed")).unwrap();
        assert!(matches!(StagingDir::new(root.path(), ID), Err(StoreError::IllegalState(_))));
    }

    #[test]
    fn test_from_path_rejects_files_and_bad_names() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("1700000000000");
        fs::write(&file, b"x").unwrap();
        assert!(StagingDir::from_path(&file).is_err());
        assert!(StagingDir::from_path(&root.path().join("lost+found")).is_err());
    }
}

use std::path::{Component, Path, PathBuf};

use crate::fs::error::{StoreError, StoreResult};

const MAX_PATH_LENGTH: usize = 4096;
const MAX_FILENAME_LENGTH: usize = 255;

/// Normalizes a store path: relative to the store root, `/`-separated, no empty, `.` or `..`
/// components and no trailing slash. The root is the empty string.
pub fn normalize_path(path: &str) -> StoreResult<String> {
    if path.contains('\0') {
        return Err(StoreError::InvalidArgument("Path contains NULL character".to_string()));
    }

    if !path.is_empty() && path.trim().is_empty() {
        return Err(StoreError::InvalidArgument("Path cannot be blank".to_string()));
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(StoreError::InvalidArgument(format!(
            "Path too long: {} bytes (max {})",
            path.len(),
            MAX_PATH_LENGTH
        )));
    }

    if path.starts_with('/') {
        return Err(StoreError::InvalidArgument(format!(
            "Path must be relative to the store root: {}",
            path
        )));
    }

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    for part in &parts {
        if *part == "." || *part == ".." {
            return Err(StoreError::InvalidArgument(format!(
                "Path must not contain '{}' components: {}",
                part, path
            )));
        }
        if part.len() > MAX_FILENAME_LENGTH {
            return Err(StoreError::InvalidArgument(format!(
                "Filename too long: {} bytes (max {})",
                part.len(),
                MAX_FILENAME_LENGTH
            )));
        }
    }

    Ok(parts.join("/"))
}

/// Parent of a normalized store path. The parent of a top-level item is the root (`""`); the
/// root has no parent.
pub fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(pos) => Some(&path[..pos]),
        None => Some(""),
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Joins a store path and a relative suffix, treating the root as empty.
pub fn join_path(base: &str, relative: &str) -> String {
    match (base.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, relative),
    }
}

/// The chain of prefixes of `path`, starting with the root: `"a/b"` gives `["", "a", "a/b"]`.
pub fn ancestor_paths(path: &str) -> Vec<String> {
    let mut prefixes = vec![String::new()];
    let mut current = String::new();
    for component in path.split('/').filter(|s| !s.is_empty()) {
        current = join_path(&current, component);
        prefixes.push(current.clone());
    }
    prefixes
}

/// Lexically resolves `relative` against `root` and returns the result only if it stays inside
/// `root`. Nothing is read from disk, so this also works for paths that do not exist yet.
pub fn resolve_within(root: &Path, relative: impl AsRef<Path>) -> Option<PathBuf> {
    let mut depth = 0usize;
    let mut resolved = root.to_path_buf();
    for component in relative.as_ref().components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

/// Converts a path relative to some directory into a store path with forward slashes.
pub fn to_store_path(relative: &Path) -> StoreResult<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                StoreError::InvalidArgument(format!("Path is not valid UTF-8: {:?}", relative))
            })?),
            Component::CurDir => {}
            _ => {
                return Err(StoreError::InvalidArgument(format!(
                    "Path escapes its root: {}",
                    relative.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

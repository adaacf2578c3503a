//! Selection and transformation of file content kept inline in the index.

use crate::config::ContentConfig;

/// Decides which files also have their content stored in the index, and how it is transformed
/// on the way in and out. `pre_store` and `post_retrieve` must select the same paths.
pub trait ContentManager: Send + Sync {
    fn test(&self, path: &str) -> bool;

    fn pre_store(&self, path: &str, bytes: Vec<u8>) -> Vec<u8>;

    fn post_retrieve(&self, path: &str, bytes: Vec<u8>) -> Vec<u8>;
}

/// Keeps all content out of the index.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContentManager;

impl ContentManager for NoContentManager {
    fn test(&self, _path: &str) -> bool {
        false
    }

    fn pre_store(&self, _path: &str, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn post_retrieve(&self, _path: &str, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }
}

/// Inlines the content of files whose name ends in one of the configured suffixes, unchanged.
#[derive(Debug, Clone, Default)]
pub struct SuffixContentManager {
    suffixes: Vec<String>,
}

impl SuffixContentManager {
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { suffixes: suffixes.into_iter().map(Into::into).collect() }
    }

    pub fn from_config(config: &ContentConfig) -> Self {
        Self::new(config.inline_suffixes.iter().cloned())
    }
}

impl ContentManager for SuffixContentManager {
    fn test(&self, path: &str) -> bool {
        self.suffixes.iter().any(|suffix| !suffix.is_empty() && path.ends_with(suffix.as_str()))
    }

    fn pre_store(&self, _path: &str, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn post_retrieve(&self, _path: &str, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_content_manager_selects_nothing() {
        let manager = NoContentManager;
        assert!(!manager.test("a/metadata.xml"));
        assert_eq!(manager.post_retrieve("x", b"abc".to_vec()), b"abc");
    }

    #[test]
    fn test_suffix_content_manager() {
        let manager = SuffixContentManager::new([".xml", ".json"]);
        assert!(manager.test("bag/metadata/dataset.xml"));
        assert!(manager.test("files.json"));
        assert!(!manager.test("data/image.png"));
        assert_eq!(manager.pre_store("a.xml", b"<a/>".to_vec()), b"<a/>");
    }

    #[test]
    fn test_empty_suffix_matches_nothing() {
        let manager = SuffixContentManager::new([""]);
        assert!(!manager.test("anything"));
    }

    #[test]
    fn test_from_config() {
        let config = ContentConfig { inline_suffixes: vec![".txt".to_string()] };
        assert!(SuffixContentManager::from_config(&config).test("notes.txt"));
    }
}

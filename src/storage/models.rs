use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{LayerId, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ItemType {
    File,
    Directory,
}

/// A file or directory as seen by clients of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    pub path: String,
    pub item_type: ItemType,
}

impl Item {
    pub fn new(path: impl Into<String>, item_type: ItemType) -> Self {
        Self { path: path.into(), item_type }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(path, ItemType::File)
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self::new(path, ItemType::Directory)
    }

    /// The implicit root directory.
    pub fn root() -> Self {
        Self::directory("")
    }

    pub fn is_directory(&self) -> bool {
        self.item_type == ItemType::Directory
    }
}

/// "As of layer `layer_id`, `path` has this type", optionally with the content inlined.
///
/// `id` is `None` until the record has been saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ItemRecord {
    #[sqlx(rename = "record_id")]
    pub id: Option<RecordId>,
    pub layer_id: LayerId,
    pub path: String,
    pub item_type: ItemType,
    pub content: Option<Vec<u8>>,
}

impl ItemRecord {
    pub fn new(layer_id: LayerId, path: impl Into<String>, item_type: ItemType) -> Self {
        Self { id: None, layer_id, path: path.into(), item_type, content: None }
    }

    pub fn file(layer_id: LayerId, path: impl Into<String>) -> Self {
        Self::new(layer_id, path, ItemType::File)
    }

    pub fn directory(layer_id: LayerId, path: impl Into<String>) -> Self {
        Self::new(layer_id, path, ItemType::Directory)
    }

    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn to_item(&self) -> Item {
        Item::new(self.path.clone(), self.item_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_type_debug() {
        assert_eq!(format!("{:?}", ItemType::File), "File");
        assert_eq!(format!("{:?}", ItemType::Directory), "Directory");
    }

    #[test]
    fn test_items_equal_on_path_and_type() {
        assert_eq!(Item::file("a/b.txt"), Item::new("a/b.txt", ItemType::File));
        assert_ne!(Item::file("a"), Item::directory("a"));
    }

    #[test]
    fn test_root_item() {
        let root = Item::root();
        assert_eq!(root.path, "");
        assert!(root.is_directory());
    }

    #[test]
    fn test_new_record_has_no_identity() {
        let record = ItemRecord::file(1700000000000, "a/b.txt");
        assert!(record.id.is_none());
        assert!(record.content.is_none());
        assert_eq!(record.to_item(), Item::file("a/b.txt"));
    }

    #[test]
    fn test_record_with_content() {
        let record = ItemRecord::file(1, "x.txt").with_content(b"hi".to_vec());
        assert_eq!(record.content.as_deref(), Some(b"hi".as_ref()));
    }

    #[test]
    fn test_record_serialization() {
        let record = ItemRecord::directory(42, "dir");
        let json = serde_json::to_string(&record).unwrap();
        let back: ItemRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}

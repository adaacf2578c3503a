use thiserror::Error;

use crate::storage::Item;
use crate::types::LayerId;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error(
        "Items of layer {layer_id} are inconsistent between database and storage. Missing in database: {missing_in_db:?} Missing on storage: {missing_on_storage:?}"
    )]
    ItemsMismatch { layer_id: LayerId, missing_in_db: Vec<Item>, missing_on_storage: Vec<Item> },

    #[error("{}", layer_ids_mismatch_message(.missing_in_db, .missing_on_storage))]
    LayerIdsMismatch { missing_in_db: Vec<LayerId>, missing_on_storage: Vec<LayerId> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    /// True for the kinds a caller should treat as a wrong request rather than a broken store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_)
                | StoreError::NotDirectory(_)
                | StoreError::IsDirectory(_)
                | StoreError::InvalidArgument(_)
        )
    }
}

fn layer_ids_mismatch_message(missing_in_db: &[LayerId], missing_on_storage: &[LayerId]) -> String {
    let mut message = "Layer IDs are inconsistent between database and storage.".to_string();
    if !missing_in_db.is_empty() {
        message.push_str(&format!(" Missing in database: {:?}", missing_in_db));
    }
    if !missing_on_storage.is_empty() {
        message.push_str(&format!(" Missing on storage: {:?}", missing_on_storage));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = StoreError::NotFound("a/b.txt".to_string());
        assert_eq!(err.to_string(), "Path not found: a/b.txt");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_not_directory_error() {
        let err = StoreError::NotDirectory("a/file".to_string());
        assert_eq!(err.to_string(), "Not a directory: a/file");
    }

    #[test]
    fn test_is_directory_error() {
        let err = StoreError::IsDirectory("a".to_string());
        assert_eq!(err.to_string(), "Is a directory: a");
    }

    #[test]
    fn test_illegal_state_is_not_a_client_error() {
        let err = StoreError::IllegalState("Layer is closed".to_string());
        assert_eq!(err.to_string(), "Illegal state: Layer is closed");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_unsupported_error() {
        let err = StoreError::Unsupported("delete from closed layer".to_string());
        assert_eq!(err.to_string(), "Unsupported operation: delete from closed layer");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_layer_ids_mismatch_both_sides() {
        let err = StoreError::LayerIdsMismatch {
            missing_in_db: vec![3, 4],
            missing_on_storage: vec![1, 2],
        };
        assert_eq!(
            err.to_string(),
            "Layer IDs are inconsistent between database and storage. Missing in database: [3, 4] Missing on storage: [1, 2]"
        );
    }

    #[test]
    fn test_layer_ids_mismatch_one_side() {
        let err = StoreError::LayerIdsMismatch { missing_in_db: vec![], missing_on_storage: vec![7] };
        assert_eq!(
            err.to_string(),
            "Layer IDs are inconsistent between database and storage. Missing on storage: [7]"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_store_result_err() {
        let result: StoreResult<i32> = Err(StoreError::InvalidArgument("blank".to_string()));
        assert!(result.is_err());
    }
}

pub mod error;
pub mod operations;
pub mod path;

pub use error::{StoreError, StoreResult};
pub use operations::{ItemStore, LayeredItemStore};

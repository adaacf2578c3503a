//! Layered, archivable item store.
//!
//! Items are written into a mutable top layer. Layers are periodically closed and packed into
//! an immutable archive while an index records which layers hold a version of every path.
//! Reads resolve a path against the newest layer that contains it.

pub mod archive;
pub mod config;
pub mod fs;
pub mod layer;
pub mod storage;
pub mod types;

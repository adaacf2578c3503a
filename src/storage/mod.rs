pub mod content;
pub mod item_record;
pub mod memory;
pub mod models;
pub mod pattern;
pub mod pool;
pub mod traits;

pub use content::{ContentManager, NoContentManager, SuffixContentManager};
pub use item_record::PgLayerDatabase;
pub use memory::InMemoryLayerDatabase;
pub use models::*;
pub use pool::DatabasePool;
pub use traits::LayerDatabase;

#[cfg(any(test, feature = "mockall"))]
pub use traits::MockLayerDatabase;

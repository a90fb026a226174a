pub mod error;
pub mod types;

pub use error::{CacheError, Result};
pub use types::{CacheStats, ItemInfo, MonotonicClock, StorageMode, StoredItem, unix_millis};

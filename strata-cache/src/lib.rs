pub mod cache;
pub mod config;
pub mod core;
pub mod logging;
pub mod storage;

// Re-export commonly used types
pub use cache::{
    Annotated, BincodeCodec, CacheRegistry, Codec, Completion, DiskCache, JsonCodec, MemoryCache,
    RawCodec, ReleaseMode, TieredCache,
};
pub use config::{CacheConfig, DiskCacheConfig, LoggingConfig, MemoryCacheConfig};
pub use core::{CacheError, CacheStats, ItemInfo, Result, StorageMode, StoredItem};
pub use logging::init_tracing;
pub use storage::{KvStorage, SweepReport};

//! Cache Module
//!
//! Provides the caching layers:
//! - Memory: bounded in-process LRU of live values
//! - Disk: persistent cache over the KV storage engine, driven by a serial worker
//! - Tiered: memory + disk read-through facade, shared by name via the registry

pub mod codec;
pub mod disk;
pub mod executor;
pub mod lru;
pub mod memory;
pub mod registry;
pub mod tiered;

pub use codec::{
    Annotated, BincodeCodec, Codec, CostMetric, FilenameStrategy, HashedFilename, JsonCodec,
    RawCodec,
};
pub use disk::DiskCache;
pub use executor::{Completion, SerialExecutor, Ticker};
pub use memory::{ChannelRelease, MemoryCache, MemoryHook, ReleaseMode, ReleasePolicy};
pub use registry::CacheRegistry;
pub use tiered::TieredCache;

//! KV Storage Engine
//!
//! Durable key → blob store backing the disk cache:
//! - SQLite index (`index.db`) with one row per key
//! - `blobs/` directory for file-placed values
//! - `trash/` directory drained in the background after bulk wipes
//!
//! Values are placed inline, in files, or by size (see [`StorageMode`]).

pub mod blobs;
pub mod engine;
pub mod index;

pub use crate::core::StorageMode;
pub use blobs::default_filename;
pub use engine::{KvStorage, SweepReport};

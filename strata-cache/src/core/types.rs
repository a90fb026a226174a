use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where the engine places value bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Every value is a standalone file, the index only holds metadata
    File,
    /// Value bytes live in the index row
    Inline,
    /// Values up to `inline_threshold` bytes go inline, larger ones to files
    Mixed { inline_threshold: usize },
}

impl StorageMode {
    /// Pick a mode from a disk cache inline threshold
    ///
    /// `0` means every value is a file, `usize::MAX` means every value is inline.
    pub fn from_threshold(inline_threshold: usize) -> Self {
        match inline_threshold {
            0 => Self::File,
            usize::MAX => Self::Inline,
            t => Self::Mixed {
                inline_threshold: t,
            },
        }
    }

    /// Whether a value of `size` bytes is stored as a file
    pub fn uses_file(&self, size: usize) -> bool {
        match *self {
            Self::File => true,
            Self::Inline => false,
            Self::Mixed { inline_threshold } => size > inline_threshold,
        }
    }
}

/// Item metadata as recorded in the index, without value bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub key: String,
    /// Backing file name, present only for file-placed values
    pub filename: Option<String>,
    /// Value size in bytes
    pub size: u64,
    /// Last write, milliseconds since the Unix epoch
    pub mod_time: i64,
    /// Last read or write, milliseconds since the Unix epoch
    pub access_time: i64,
    /// Opaque caller metadata
    pub extended_data: Option<Vec<u8>>,
}

/// A stored item with its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub info: ItemInfo,
    pub value: Vec<u8>,
}

impl StoredItem {
    pub fn key(&self) -> &str {
        &self.info.key
    }

    pub fn extended_data(&self) -> Option<&[u8]> {
        self.info.extended_data.as_deref()
    }
}

/// Hit/miss statistics for the memory tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub inserts: u64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Current wall clock in milliseconds since the Unix epoch
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Millisecond clock that never repeats or goes backwards
///
/// Index timestamps order LRU eviction, so two stamps issued by the same
/// engine must never compare equal.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    /// Start after `floor`, typically the newest stamp already on disk
    pub fn starting_after(floor: i64) -> Self {
        Self { last: floor }
    }

    pub fn now(&mut self) -> i64 {
        let stamp = unix_millis().max(self.last + 1);
        self.last = stamp;
        stamp
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default inline threshold for mixed storage (20 KiB)
pub const DEFAULT_INLINE_THRESHOLD: usize = 20 * 1024;

/// Top-level configuration for a tiered cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory: MemoryCacheConfig,
    pub disk: DiskCacheConfig,
    pub logging: LoggingConfig,
}

impl CacheConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::core::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> crate::core::Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| crate::core::CacheError::InvalidArgument(format!("config: {}", e)))
    }
}

/// Memory tier limits and policies
///
/// Unset limits are unbounded. Times are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub name: Option<String>,
    pub count_limit: Option<usize>,
    pub cost_limit: Option<usize>,
    pub age_limit_secs: Option<f64>,
    pub auto_trim_interval_secs: f64,
    pub remove_all_on_memory_warning: bool,
    pub remove_all_on_background: bool,
    /// Drop evicted values on the housekeeping thread instead of the caller's
    pub release_asynchronously: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            name: None,
            count_limit: None,
            cost_limit: None,
            age_limit_secs: None,
            auto_trim_interval_secs: 5.0,
            remove_all_on_memory_warning: true,
            remove_all_on_background: true,
            release_asynchronously: true,
        }
    }
}

/// Disk tier location, limits and policies
///
/// Unset limits are unbounded. Times are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    pub path: PathBuf,
    pub name: Option<String>,
    /// `0` stores every value as a file, `usize::MAX` stores every value inline
    pub inline_threshold: usize,
    pub count_limit: Option<usize>,
    pub cost_limit: Option<u64>,
    pub age_limit_secs: Option<f64>,
    /// Minimum free bytes to keep on the cache volume
    pub free_disk_space_limit: u64,
    pub auto_trim_interval_secs: f64,
    pub error_logs_enabled: bool,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/cache"),
            name: None,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            count_limit: None,
            cost_limit: None,
            age_limit_secs: None,
            free_disk_space_limit: 0,
            auto_trim_interval_secs: 60.0,
            error_logs_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Seconds to `Duration`, clamping negatives to zero and overflow to `Duration::MAX`
pub fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Optional seconds to `Duration`, `None` meaning unbounded
pub fn secs_or_max(value: Option<f64>) -> Duration {
    value.map(secs).unwrap_or(Duration::MAX)
}

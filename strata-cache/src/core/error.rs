use thiserror::Error;

/// Main error type for Strata cache operations
///
/// A missing key is never an error: lookups return `Option` and removals of
/// absent keys succeed.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Consistency violation for key {key}: {reason}")]
    Consistency { key: String, reason: String },

    #[error("Cache worker stopped")]
    WorkerStopped,
}

impl CacheError {
    /// Whether this error means the volume ran out of space
    pub fn is_storage_full(&self) -> bool {
        match self {
            Self::Io(e) => {
                e.kind() == std::io::ErrorKind::StorageFull
                    || e.raw_os_error() == Some(28) // ENOSPC
            }
            Self::Index(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::DiskFull
            }
            _ => false,
        }
    }
}

impl From<bincode::error::EncodeError> for CacheError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CacheError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Codec(e.to_string())
    }
}

/// Result type alias for Strata cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_full_from_io() {
        let err = CacheError::from(std::io::Error::from_raw_os_error(28));
        assert!(err.is_storage_full());

        let err = CacheError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!err.is_storage_full());
    }

    #[test]
    fn test_storage_full_from_sqlite() {
        let err = CacheError::Index(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        ));
        assert!(err.is_storage_full());
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::Consistency {
            key: "k".to_string(),
            reason: "missing blob".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Consistency violation for key k: missing blob"
        );
    }
}

//! Error types for cache, invalidation and metrics operations
//!
//! Most failures inside the persistent tier or the invalidation backend are
//! recovered locally and only logged. The variants below are the ones that
//! either reach the caller or are carried through internal `Result`s.

use thiserror::Error;

/// Main error type for the caching subsystem
#[derive(Error, Debug)]
pub enum CacheError {
    /// A single entry can never fit inside the memory cap
    #[error("Entry too large: {size} bytes exceeds the {max} byte memory limit")]
    EntryTooLarge { size: usize, max: usize },

    /// Key rejected before touching any tier
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Caller supplied options that cannot be honored
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persistent storage read/write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Persistent storage has no room left
    #[error("Storage quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    /// Codec failure while compressing or decompressing a payload
    #[error("Compression error: {0}")]
    Compression(String),

    /// Remote invalidation backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Operation exceeded its time budget
    #[error("Operation timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No invalidation strategy registered under the given id
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    /// Report export format that is not implemented
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl CacheError {
    /// Build a timeout error for an operation that ran past its budget
    pub fn timeout(timeout: std::time::Duration, context: impl Into<String>) -> Self {
        CacheError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
            context: context.into(),
        }
    }

    /// Whether the error threatens a cache invariant and must reach the caller
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            CacheError::EntryTooLarge { .. }
                | CacheError::InvalidKey(_)
                | CacheError::InvalidOptions(_)
                | CacheError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let error = CacheError::EntryTooLarge { size: 2048, max: 1024 };
        assert_eq!(
            error.to_string(),
            "Entry too large: 2048 bytes exceeds the 1024 byte memory limit"
        );

        let timeout_error = CacheError::timeout(Duration::from_secs(5), "get_many");
        assert!(timeout_error.to_string().contains("timed out after 5000ms"));

        let quota = CacheError::QuotaExceeded {
            needed: 100,
            available: 10,
        };
        assert!(quota.to_string().contains("10 available"));
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: CacheError = json_err.into();
        assert!(matches!(error, CacheError::Serialization(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let error: CacheError = io_err.into();
        assert!(matches!(error, CacheError::Storage(_)));
    }

    #[test]
    fn test_caller_facing() {
        assert!(CacheError::EntryTooLarge { size: 1, max: 0 }.is_caller_facing());
        assert!(!CacheError::Storage("disk".into()).is_caller_facing());
        assert!(!CacheError::Backend("down".into()).is_caller_facing());
    }
}

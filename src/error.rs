//! Error types for the compressed page cache
//!
//! Construction and configuration failures use [`Error`]. The store/load hot
//! path reports its outcomes through dedicated types in [`crate::cache`]
//! (`RejectReason`, `LoadError`) so callers can pick a fallback without
//! string matching.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving the cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Compressor name is not registered
    #[error("Compressor not available: {0}")]
    UnknownCompressor(String),

    /// Allocator backend name is not registered
    #[error("Allocator backend not available: {0}")]
    UnknownAllocator(String),

    /// Cache was not initialised with a usable pool
    #[error("No usable pool: {0}")]
    PoolUnavailable(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Monitoring Errors
    // =========================================================================
    /// Prometheus registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownCompressor("lzo".into());
        assert_eq!(err.to_string(), "Compressor not available: lzo");

        let err = Error::DecompressionFailed {
            algorithm: "zstd".into(),
            reason: "truncated frame".into(),
        };
        assert_eq!(
            err.to_string(),
            "Decompression with zstd failed: truncated frame"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

//! Error types for the cache engine.
//!
//! The taxonomy separates caller bugs from tier outages. Only
//! [`CacheError`] crosses the public API boundary; tier-level failures
//! ([`TierError`], [`RemoteError`]) are absorbed by the coordinator,
//! logged, and treated as a miss or a skipped write. A caching failure
//! must never abort the rendering pipeline that called into us.

use std::time::Duration;
use thiserror::Error;

/// Errors that surface to callers of the cache API.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The caller supplied render options that cannot be canonicalized
    /// into a cache key (nested values, non-finite floats). This is a
    /// caller bug and fails fast rather than caching under a bogus key.
    #[error("Malformed key input: {0}")]
    MalformedKeyInput(String),

    /// Invalid cache configuration (zero budget, bad thresholds).
    /// Rejected at service construction, never at request time.
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// I/O failure while opening the cache (creating the durable
    /// directory, initial scan). Runtime tier I/O errors do not use
    /// this variant; they are absorbed internally.
    #[error("Cache startup I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Analytics export could not be serialized.
    #[error("Analytics export failed: {0}")]
    Export(#[from] serde_json::Error),
}

/// Errors raised by a distributed store implementation.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// Transport-level failure (connect, read, TLS).
    #[error("HTTP transport error: {0}")]
    Http(String),

    /// The store answered with an unexpected status code.
    #[error("HTTP {code} from remote store")]
    Status { code: u16 },

    /// The store is not reachable or refused the operation.
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
}

/// Internal tier-level failures.
///
/// These never escape the coordinator: reads fall through to the next
/// tier, writes skip the failing tier, and the error is logged with the
/// tier name attached.
#[derive(Error, Debug)]
pub enum TierError {
    #[error("Tier I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Remote operation timed out after {0:?}")]
    Timeout(Duration),

    /// A single entry exceeds the whole memory budget: even a fully
    /// drained tier could not hold it, so the insert is skipped for the
    /// memory tier only.
    #[error("Entry of {size} bytes exceeds memory budget of {budget} bytes")]
    EntryTooLarge { size: usize, budget: usize },

    /// The memory tier lock was poisoned by a panicking thread.
    #[error("Cache lock poisoned")]
    Lock,
}

/// Failure reported by a [`Renderer`](crate::scheduler::Renderer) when
/// asked to produce an artifact during preloading.
#[derive(Error, Debug, Clone)]
pub enum RenderError {
    #[error("Render failed: {0}")]
    Failed(String),
}

/// Internal failures of the optimization pipeline. Absorbed by
/// [`TemplateOptimizer::optimize`](crate::optimizer::TemplateOptimizer::optimize),
/// which returns the original content unchanged.
#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Template source is not valid UTF-8")]
    NotText,

    #[error("Embedded payload rejected: {0}")]
    Payload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_key_input_message() {
        let err = CacheError::MalformedKeyInput("nested value for option `style`".to_string());
        assert_eq!(
            err.to_string(),
            "Malformed key input: nested value for option `style`"
        );
    }

    #[test]
    fn test_io_error_converts_into_cache_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CacheError = io.into();
        assert!(matches!(err, CacheError::Io(_)));
    }

    #[test]
    fn test_entry_too_large_reports_sizes() {
        let err = TierError::EntryTooLarge {
            size: 200,
            budget: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("200"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_timeout_formats_duration() {
        let err = TierError::Timeout(Duration::from_secs(3));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_remote_error_converts_into_tier_error() {
        let err: TierError = RemoteError::Status { code: 503 }.into();
        assert!(matches!(err, TierError::Remote(_)));
    }
}

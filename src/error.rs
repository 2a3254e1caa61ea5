//! Error types for the caching engine

use thiserror::Error;

/// Errors surfaced by tier operations.
///
/// Capacity pressure is deliberately not represented here: an insertion that
/// cannot free enough space within the eviction retry budget still succeeds,
/// leaving the tier transiently over its target. A stale write-back is
/// reported through [`ByteTier::flush`](crate::tier::bytes::ByteTier::flush)
/// returning `false`, not through an error.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The configured codec could not encode or decode a value. The
    /// triggering operation aborts without mutating tier state.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The tier has been closed; all subsequent operations fail fast.
    #[error("tier is closed")]
    Closed,

    /// A tier was constructed with invalid settings.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A caller-supplied computation failed while materializing a value.
    #[error("computation failed: {0}")]
    Compute(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type alias
pub type CacheResult<T> = std::result::Result<T, CacheError>;

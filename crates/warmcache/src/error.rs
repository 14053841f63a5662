//! Error types for the cache-warming layer

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-warming layer error
#[derive(Debug, Error)]
pub enum CacheError {
    /// A read/write/copy against a physical device region failed
    #[error("device I/O error while {context}: {source}")]
    DeviceIo {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Signature present but the bitmap behind it could not be read
    #[error("cache metadata corrupt: {0}")]
    MetadataCorrupt(String),

    /// Bad block size or trailer geometry that leaves no cacheable blocks
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Origin device too small to back the cache device
    #[error("device size mismatch: origin has {origin_sectors} sectors, cache requires {required_sectors}")]
    DeviceMismatch {
        origin_sectors: u64,
        required_sectors: u64,
    },

    /// Request range exceeds the logical device size
    #[error("request [{sector}, {sector}+{count}) exceeds device size of {total_sectors} sectors")]
    OutOfBounds {
        sector: u64,
        count: u64,
        total_sectors: u64,
    },

    /// A block copy failed; the whole originating request is terminated
    #[error(transparent)]
    Copy(#[from] CopyFailed),
}

impl CacheError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::DeviceIo { context, source }
    }
}

/// Failure of a single origin-to-cache block copy.
///
/// Cloneable so the one outcome of a shared copy can be delivered to the
/// copier and to every request queued behind the same block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("copy of block {block} failed: {reason}")]
pub struct CopyFailed {
    /// Block index whose copy failed
    pub block: u64,
    /// Underlying I/O error, stringified
    pub reason: String,
}

//! Warmcache: on-demand cache warming between block devices
//!
//! This crate sits between a slow "origin" block device and a fast "cache"
//! block device. Requests addressed to the logical device first ensure the
//! fixed-size blocks they touch have been copied from origin to cache,
//! then are served from the cache device. Blocks are copied once and stay
//! valid for the lifetime of the cache metadata; there is no eviction,
//! writeback, or invalidation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  incoming I/O    │
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │  CacheSession    │  dispatch: find missing blocks, route/split
//! │  - CacheLayout   │
//! │  - CopyBitmap    │
//! │  - coordinator   │  one in-flight copy per block, wait lists
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │  BlockIoExecutor │  raw copy/read/write against the devices
//! └──────────────────┘
//! ```
//!
//! The copied-block bitmap is persisted in a trailer at the tail of the
//! cache device: the last sector holds a signature, the sectors before it
//! hold one bit per block.

pub mod bitmap;
pub mod error;
pub mod executor;
pub mod layout;
pub mod session;
pub mod split;

mod copier;

pub use bitmap::{BitmapLoad, BitmapStore, CopyBitmap};
pub use error::{CacheError, CacheResult, CopyFailed};
pub use executor::{BlockIoExecutor, DeviceId, DeviceRegion, FileExecutor, MemoryExecutor};
pub use layout::{BlockIndex, CacheLayout};
pub use session::{CacheSession, CacheStats, SessionConfig};
pub use split::{RoutePlan, plan_route};

/// Device sector size in bytes (standard 512-byte sectors)
pub const SECTOR_SIZE: u64 = 512;

/// Magic written to the last sector of the cache device to mark an
/// initialized metadata trailer
pub const SIGNATURE: [u8; 9] = *b"WARMCACHE";

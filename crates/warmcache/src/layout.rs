//! Cache device layout and block index math
//!
//! The cache device mirrors the origin device block for block, except for a
//! reserved trailer at its tail:
//!
//! ```text
//! +--------------------------------+  sector 0
//! |   cached data blocks           |
//! |   (one bit each in the bitmap) |
//! +--------------------------------+  frontier sector
//! |   partial block / slack        |
//! +--------------------------------+  total - (bitmap_sectors + 1)
//! |   copied-block bitmap          |
//! +--------------------------------+  total - 1
//! |   signature sector             |
//! +--------------------------------+  total
//! ```
//!
//! Addresses at or past the frontier are never cached; requests touching
//! them are routed to the origin device instead.

use crate::SECTOR_SIZE;
use crate::error::{CacheError, CacheResult};

/// Index of a fixed-size cache block
pub type BlockIndex = u64;

/// Fixed geometry of one cache device, computed at attach time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    /// Block size in sectors (power of two)
    block_sectors: u64,
    /// log2 of `block_sectors`
    block_shift: u32,
    /// Total cache device size in sectors
    total_sectors: u64,
    /// Number of blocks tracked by the bitmap
    total_blocks: u64,
    /// Sectors reserved for the bitmap (excluding the signature sector)
    bitmap_sectors: u64,
    /// Last block index whose full extent fits before the trailer
    last_caching_block: BlockIndex,
}

impl CacheLayout {
    /// Compute the layout for a cache device of `total_sectors` sectors
    /// using `block_size` byte blocks.
    pub fn new(block_size: u64, total_sectors: u64) -> CacheResult<Self> {
        if block_size < SECTOR_SIZE || !block_size.is_power_of_two() {
            return Err(CacheError::InvalidConfiguration(format!(
                "block size {} must be a power of two of at least {} bytes",
                block_size, SECTOR_SIZE
            )));
        }

        let block_sectors = block_size / SECTOR_SIZE;
        let block_shift = block_sectors.trailing_zeros();
        let total_blocks = total_sectors.div_ceil(block_sectors);

        let bits_per_sector = SECTOR_SIZE * 8;
        let bitmap_sectors = total_blocks.div_ceil(bits_per_sector);
        let trailer_sectors = bitmap_sectors + 1;
        if trailer_sectors >= total_sectors {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache device of {} sectors cannot hold its {} sector metadata trailer",
                total_sectors, trailer_sectors
            )));
        }

        // Only blocks that fit entirely before the trailer are cacheable.
        let data_sectors = total_sectors - trailer_sectors;
        let full_blocks = data_sectors >> block_shift;
        if full_blocks == 0 {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache device of {} sectors has no room for even one {} sector block",
                total_sectors, block_sectors
            )));
        }

        Ok(Self {
            block_sectors,
            block_shift,
            total_sectors,
            total_blocks,
            bitmap_sectors,
            last_caching_block: full_blocks - 1,
        })
    }

    /// Block size in sectors
    pub fn block_sectors(&self) -> u64 {
        self.block_sectors
    }

    /// Total cache device size in sectors
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Number of blocks tracked by the bitmap
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Sectors reserved for the persisted bitmap
    pub fn bitmap_sectors(&self) -> u64 {
        self.bitmap_sectors
    }

    /// Size of the in-memory bitmap buffer in bytes
    pub fn bitmap_bytes(&self) -> usize {
        (self.bitmap_sectors * SECTOR_SIZE) as usize
    }

    /// Last block index managed by the cache (the caching frontier)
    pub fn last_caching_block(&self) -> BlockIndex {
        self.last_caching_block
    }

    /// First sector past the cacheable extent
    pub fn frontier_sector(&self) -> u64 {
        (self.last_caching_block + 1) << self.block_shift
    }

    /// First sector of the persisted bitmap range
    pub fn bitmap_start_sector(&self) -> u64 {
        self.total_sectors - (self.bitmap_sectors + 1)
    }

    /// Sector holding the metadata signature
    pub fn signature_sector(&self) -> u64 {
        self.total_sectors - 1
    }

    /// Convert a sector address to the block index containing it
    pub fn sector_to_block(&self, sector: u64) -> BlockIndex {
        sector >> self.block_shift
    }

    /// Convert a block index to its first sector address
    pub fn block_to_sector(&self, block: BlockIndex) -> u64 {
        block << self.block_shift
    }
}

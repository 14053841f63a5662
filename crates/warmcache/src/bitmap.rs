//! Copied-block bitmap and its on-device trailer store
//!
//! One bit per block, little-endian bit order within each byte. The bitmap
//! is persisted at the tail of the cache device: the last sector carries a
//! fixed signature identifying the metadata format, the sectors before it
//! hold the bits. A missing or garbage signature is not corruption; it is
//! the recognized "cache never initialized" state.

use crate::error::{CacheError, CacheResult};
use crate::executor::{BlockIoExecutor, DeviceId, DeviceRegion};
use crate::layout::{BlockIndex, CacheLayout};
use crate::{SECTOR_SIZE, SIGNATURE};

use bytes::BytesMut;
use tracing::debug;

/// In-memory copied-block bitmap
///
/// Bit set means the block's content has been copied from origin to cache
/// and the cache device is authoritative for it. Bits are only ever set,
/// never cleared, for the lifetime of the bound metadata.
#[derive(Debug, Clone)]
pub struct CopyBitmap {
    /// Bit storage, sized to the full persisted bitmap range
    bits: Vec<u8>,
    /// Number of blocks tracked
    total_blocks: u64,
    /// Cached count of set bits in `[0, total_blocks)`
    copied: u64,
}

impl CopyBitmap {
    /// Create an all-zero bitmap for the given layout
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            bits: vec![0u8; layout.bitmap_bytes()],
            total_blocks: layout.total_blocks(),
            copied: 0,
        }
    }

    /// Rebuild a bitmap from its persisted bytes
    pub fn from_bytes(bits: Vec<u8>, total_blocks: u64) -> Self {
        let mut copied = 0u64;
        for block in 0..total_blocks {
            if Self::is_set_in_slice(&bits, block) {
                copied += 1;
            }
        }
        Self {
            bits,
            total_blocks,
            copied,
        }
    }

    /// The persisted byte form of the bitmap
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of blocks tracked
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Number of blocks marked copied
    pub fn copied(&self) -> u64 {
        self.copied
    }

    /// Whether a block has been copied to the cache device
    pub fn is_copied(&self, block: BlockIndex) -> bool {
        debug_assert!(block < self.total_blocks);
        Self::is_set_in_slice(&self.bits, block)
    }

    /// Mark a block copied. Idempotent.
    pub fn set(&mut self, block: BlockIndex) {
        debug_assert!(block < self.total_blocks);
        let byte_idx = (block / 8) as usize;
        let bit = 1u8 << (block % 8);
        if self.bits[byte_idx] & bit == 0 {
            self.bits[byte_idx] |= bit;
            self.copied += 1;
        }
    }

    /// First missing block in `[start, end]`, scanning ascending.
    ///
    /// Returns `None` when every block in the range is copied or the range
    /// is empty. Callers clamp `end` to the caching frontier.
    pub fn next_missing(&self, start: BlockIndex, end: BlockIndex) -> Option<BlockIndex> {
        if start > end {
            return None;
        }
        let end = end.min(self.total_blocks - 1);
        (start..=end).find(|&block| !Self::is_set_in_slice(&self.bits, block))
    }

    fn is_set_in_slice(bits: &[u8], block: u64) -> bool {
        bits[(block / 8) as usize] & (1 << (block % 8)) != 0
    }
}

/// Outcome of reading the cache device trailer
#[derive(Debug)]
pub enum BitmapLoad {
    /// Valid signature; bitmap read back
    Loaded(CopyBitmap),
    /// No signature; the cache was never initialized
    Uninitialized,
}

/// Reads and writes the bitmap trailer on the cache device
#[derive(Debug, Clone)]
pub struct BitmapStore {
    device: DeviceId,
    bitmap_start_sector: u64,
    bitmap_sectors: u64,
    signature_sector: u64,
    total_blocks: u64,
}

impl BitmapStore {
    /// Bind a store to the trailer region of a cache device
    pub fn new(device: DeviceId, layout: &CacheLayout) -> Self {
        Self {
            device,
            bitmap_start_sector: layout.bitmap_start_sector(),
            bitmap_sectors: layout.bitmap_sectors(),
            signature_sector: layout.signature_sector(),
            total_blocks: layout.total_blocks(),
        }
    }

    /// Read the trailer.
    ///
    /// A signature mismatch reports [`BitmapLoad::Uninitialized`]; the
    /// caller is expected to create an all-zero bitmap and persist it. An
    /// unreadable bitmap behind a valid signature is corruption.
    pub async fn load(&self, executor: &dyn BlockIoExecutor) -> CacheResult<BitmapLoad> {
        let mut sig = vec![0u8; SECTOR_SIZE as usize];
        executor
            .read_region(self.signature_region(), &mut sig)
            .await
            .map_err(|e| CacheError::io("reading metadata signature", e))?;

        if sig[..SIGNATURE.len()] != SIGNATURE {
            debug!("no metadata signature on cache device");
            return Ok(BitmapLoad::Uninitialized);
        }

        let mut bits = vec![0u8; (self.bitmap_sectors * SECTOR_SIZE) as usize];
        executor
            .read_region(self.bitmap_region(), &mut bits)
            .await
            .map_err(|e| {
                CacheError::MetadataCorrupt(format!(
                    "signature present but bitmap unreadable: {}",
                    e
                ))
            })?;

        Ok(BitmapLoad::Loaded(CopyBitmap::from_bytes(
            bits,
            self.total_blocks,
        )))
    }

    /// Persist the bitmap range, then the signature sector
    pub async fn save(
        &self,
        executor: &dyn BlockIoExecutor,
        bitmap: &CopyBitmap,
    ) -> CacheResult<()> {
        executor
            .write_region(self.bitmap_region(), bitmap.as_bytes())
            .await
            .map_err(|e| CacheError::io("writing bitmap sectors", e))?;

        let mut sig = BytesMut::zeroed(SECTOR_SIZE as usize);
        sig[..SIGNATURE.len()].copy_from_slice(&SIGNATURE);
        executor
            .write_region(self.signature_region(), &sig)
            .await
            .map_err(|e| CacheError::io("writing metadata signature", e))?;

        debug!(
            "persisted bitmap: {}/{} blocks copied",
            bitmap.copied(),
            bitmap.total_blocks()
        );
        Ok(())
    }

    fn bitmap_region(&self) -> DeviceRegion {
        DeviceRegion {
            device: self.device,
            sector: self.bitmap_start_sector,
            count: self.bitmap_sectors,
        }
    }

    fn signature_region(&self) -> DeviceRegion {
        DeviceRegion {
            device: self.device,
            sector: self.signature_sector,
            count: 1,
        }
    }
}

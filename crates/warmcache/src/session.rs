//! Cache session: request dispatch over the warm-once block cache
//!
//! One session per attached logical device. Every read or write lands here
//! first: the dispatcher finds the missing blocks in the request's range,
//! drives the copy coordinator over them in ascending order, and once the
//! range is resident routes the request to the cache device, the origin
//! device, or both via the frontier split.

use crate::bitmap::{BitmapLoad, BitmapStore, CopyBitmap};
use crate::copier::CopyCoordinator;
use crate::error::{CacheError, CacheResult};
use crate::executor::{BlockIoExecutor, DeviceId, DeviceRegion};
use crate::layout::CacheLayout;
use crate::split::{RoutePlan, plan_route};
use crate::SECTOR_SIZE;

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Attach-time parameters supplied by the surrounding storage stack
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cache block size in bytes (power of two, at least one sector)
    pub block_size: u64,
    /// Origin device size in sectors
    pub origin_sectors: u64,
    /// Cache device size in sectors
    pub cache_sectors: u64,
}

/// Counters for one session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Blocks tracked by the bitmap
    pub total_blocks: u64,
    /// Blocks currently marked copied
    pub copied_blocks: u64,
    /// Copies issued to the executor
    pub copies_issued: u64,
    /// Requests that queued behind an in-flight copy
    pub copy_waits: u64,
    /// Requests split at the caching frontier
    pub split_requests: u64,
    /// Requests served by a single pass-through I/O
    pub whole_requests: u64,
}

/// A live cache-warming session between one origin and one cache device
pub struct CacheSession {
    origin: DeviceId,
    cache: DeviceId,
    layout: CacheLayout,
    bitmap: RwLock<CopyBitmap>,
    store: BitmapStore,
    copier: CopyCoordinator,
    executor: Arc<dyn BlockIoExecutor>,
    split_requests: AtomicU64,
    whole_requests: AtomicU64,
}

impl std::fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession")
            .field("origin", &self.origin)
            .field("cache", &self.cache)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl CacheSession {
    /// Attach to a device pair, loading or initializing the cache metadata.
    ///
    /// A cache device with no metadata signature gets an all-zero bitmap
    /// persisted immediately; one with a valid signature resumes from the
    /// persisted bitmap. Any other load failure aborts the attach.
    pub async fn attach(
        origin: DeviceId,
        cache: DeviceId,
        config: SessionConfig,
        executor: Arc<dyn BlockIoExecutor>,
    ) -> CacheResult<Self> {
        let layout = CacheLayout::new(config.block_size, config.cache_sectors)?;
        if config.origin_sectors < config.cache_sectors {
            return Err(CacheError::DeviceMismatch {
                origin_sectors: config.origin_sectors,
                required_sectors: config.cache_sectors,
            });
        }

        let store = BitmapStore::new(cache, &layout);
        let bitmap = match store.load(executor.as_ref()).await? {
            BitmapLoad::Loaded(bitmap) => {
                info!(
                    "attached: resumed bitmap with {}/{} blocks copied",
                    bitmap.copied(),
                    bitmap.total_blocks()
                );
                bitmap
            }
            BitmapLoad::Uninitialized => {
                let bitmap = CopyBitmap::new(&layout);
                store.save(executor.as_ref(), &bitmap).await?;
                info!(
                    "attached: initialized empty cache metadata for {} blocks",
                    bitmap.total_blocks()
                );
                bitmap
            }
        };

        Ok(Self {
            origin,
            cache,
            layout,
            bitmap: RwLock::new(bitmap),
            store,
            copier: CopyCoordinator::new(),
            executor,
            split_requests: AtomicU64::new(0),
            whole_requests: AtomicU64::new(0),
        })
    }

    /// The session's device geometry
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Read `buf.len()` bytes starting at `sector`.
    ///
    /// Suspends until every cacheable block in the range is resident, then
    /// serves the request from the cache device (split at the frontier if
    /// the range reaches the metadata trailer).
    pub async fn read(&self, sector: u64, buf: &mut [u8]) -> CacheResult<()> {
        let Some(count) = self.request_sectors(sector, buf.len())? else {
            return Ok(());
        };
        self.ensure_resident(sector, count).await?;

        match plan_route(&self.layout, sector, count) {
            RoutePlan::Cache => {
                self.whole_requests.fetch_add(1, Ordering::Relaxed);
                self.executor
                    .read_region(self.region(self.cache, sector, count), buf)
                    .await
                    .map_err(|e| CacheError::io("reading from cache device", e))
            }
            RoutePlan::Origin => {
                self.whole_requests.fetch_add(1, Ordering::Relaxed);
                self.executor
                    .read_region(self.region(self.origin, sector, count), buf)
                    .await
                    .map_err(|e| CacheError::io("reading from origin device", e))
            }
            RoutePlan::Split { cache_sectors } => {
                self.split_requests.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "splitting read at sector {}: {} sectors cached, {} from origin",
                    sector,
                    cache_sectors,
                    count - cache_sectors
                );
                let (front, back) = buf.split_at_mut((cache_sectors * SECTOR_SIZE) as usize);
                // Prefix first; its failure aborts the request before the
                // suffix is ever issued.
                self.executor
                    .read_region(self.region(self.cache, sector, cache_sectors), front)
                    .await
                    .map_err(|e| CacheError::io("reading split prefix from cache device", e))?;
                self.executor
                    .read_region(
                        self.region(
                            self.origin,
                            sector + cache_sectors,
                            count - cache_sectors,
                        ),
                        back,
                    )
                    .await
                    .map_err(|e| CacheError::io("reading split suffix from origin device", e))
            }
        }
    }

    /// Write `data` starting at `sector`.
    ///
    /// Blocks in the range are warmed first so the cache device holds the
    /// surrounding block content before the write lands on it.
    pub async fn write(&self, sector: u64, data: &[u8]) -> CacheResult<()> {
        let Some(count) = self.request_sectors(sector, data.len())? else {
            return Ok(());
        };
        self.ensure_resident(sector, count).await?;

        match plan_route(&self.layout, sector, count) {
            RoutePlan::Cache => {
                self.whole_requests.fetch_add(1, Ordering::Relaxed);
                self.executor
                    .write_region(self.region(self.cache, sector, count), data)
                    .await
                    .map_err(|e| CacheError::io("writing to cache device", e))
            }
            RoutePlan::Origin => {
                self.whole_requests.fetch_add(1, Ordering::Relaxed);
                self.executor
                    .write_region(self.region(self.origin, sector, count), data)
                    .await
                    .map_err(|e| CacheError::io("writing to origin device", e))
            }
            RoutePlan::Split { cache_sectors } => {
                self.split_requests.fetch_add(1, Ordering::Relaxed);
                let (front, back) = data.split_at((cache_sectors * SECTOR_SIZE) as usize);
                self.executor
                    .write_region(self.region(self.cache, sector, cache_sectors), front)
                    .await
                    .map_err(|e| CacheError::io("writing split prefix to cache device", e))?;
                self.executor
                    .write_region(
                        self.region(
                            self.origin,
                            sector + cache_sectors,
                            count - cache_sectors,
                        ),
                        back,
                    )
                    .await
                    .map_err(|e| CacheError::io("writing split suffix to origin device", e))
            }
        }
    }

    /// Persist the current bitmap to the cache device trailer
    pub async fn flush(&self) -> CacheResult<()> {
        // Snapshot under the lock, write outside it
        let snapshot = self.bitmap.read().clone();
        self.store.save(self.executor.as_ref(), &snapshot).await
    }

    /// Flush the bitmap and detach
    pub async fn close(self) -> CacheResult<()> {
        self.flush().await?;
        info!(
            "detached: {}/{} blocks copied",
            self.bitmap.read().copied(),
            self.layout.total_blocks()
        );
        Ok(())
    }

    /// Current session counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_blocks: self.layout.total_blocks(),
            copied_blocks: self.bitmap.read().copied(),
            copies_issued: self.copier.copies_issued(),
            copy_waits: self.copier.copy_waits(),
            split_requests: self.split_requests.load(Ordering::Relaxed),
            whole_requests: self.whole_requests.load(Ordering::Relaxed),
        }
    }

    /// Validate a request and return its sector count, or `None` for an
    /// empty request.
    fn request_sectors(&self, sector: u64, len: usize) -> CacheResult<Option<u64>> {
        if len == 0 {
            return Ok(None);
        }
        if len as u64 % SECTOR_SIZE != 0 {
            return Err(CacheError::InvalidConfiguration(format!(
                "request of {} bytes is not a whole number of sectors",
                len
            )));
        }
        let count = len as u64 / SECTOR_SIZE;
        let in_bounds = sector
            .checked_add(count)
            .is_some_and(|end| end <= self.layout.total_sectors());
        if !in_bounds {
            return Err(CacheError::OutOfBounds {
                sector,
                count,
                total_sectors: self.layout.total_sectors(),
            });
        }
        Ok(Some(count))
    }

    /// Copy every missing cacheable block in the range, ascending.
    ///
    /// Blocks past the caching frontier are skipped; they are served from
    /// the origin device by the split path and never cached. A copy
    /// failure anywhere terminates the request; bits set for earlier
    /// blocks stay set, since each copied block is independently valid.
    async fn ensure_resident(&self, sector: u64, count: u64) -> CacheResult<()> {
        let start_block = self.layout.sector_to_block(sector);
        let end_block = self.layout.sector_to_block(sector + count - 1);
        let end = end_block.min(self.layout.last_caching_block());

        let mut next = start_block;
        loop {
            let missing = self.bitmap.read().next_missing(next, end);
            let Some(block) = missing else {
                return Ok(());
            };
            self.copier
                .copy_block(
                    block,
                    &self.layout,
                    &self.bitmap,
                    self.origin,
                    self.cache,
                    self.executor.as_ref(),
                )
                .await?;
            next = block + 1;
        }
    }

    fn region(&self, device: DeviceId, sector: u64, count: u64) -> DeviceRegion {
        DeviceRegion {
            device,
            sector,
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;
    use std::time::Duration;

    const BLOCK: usize = 4096;

    struct Fixture {
        exec: Arc<MemoryExecutor>,
        origin: DeviceId,
        cache: DeviceId,
        config: SessionConfig,
    }

    /// 4KB blocks on a 754 sector device pair: 95 tracked blocks, blocks
    /// 0..=93 cacheable, frontier at sector 752. The origin device is
    /// filled with a per-sector pattern so misroutes show up as data
    /// mismatches.
    async fn fixture() -> Fixture {
        let exec = Arc::new(MemoryExecutor::new());
        let sectors = 754;
        let origin = exec.add_device(sectors);
        let cache = exec.add_device(sectors);

        for sector in 0..sectors {
            let fill = vec![(sector % 251) as u8; SECTOR_SIZE as usize];
            exec.write_region(
                DeviceRegion {
                    device: origin,
                    sector,
                    count: 1,
                },
                &fill,
            )
            .await
            .unwrap();
        }

        Fixture {
            exec,
            origin,
            cache,
            config: SessionConfig {
                block_size: BLOCK as u64,
                origin_sectors: sectors,
                cache_sectors: sectors,
            },
        }
    }

    fn origin_pattern(sector: u64, count: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity((count * SECTOR_SIZE) as usize);
        for s in sector..sector + count {
            out.extend(std::iter::repeat_n((s % 251) as u8, SECTOR_SIZE as usize));
        }
        out
    }

    async fn attach(f: &Fixture) -> CacheSession {
        CacheSession::attach(f.origin, f.cache, f.config.clone(), f.exec.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_attach_initializes_fresh_metadata() {
        let f = fixture().await;
        let session = attach(&f).await;

        let stats = session.stats();
        assert_eq!(stats.total_blocks, 95);
        assert_eq!(stats.copied_blocks, 0);

        // Re-attach resumes instead of re-initializing
        drop(session);
        let session = attach(&f).await;
        assert_eq!(session.stats().copied_blocks, 0);
    }

    #[tokio::test]
    async fn test_attach_rejects_undersized_origin() {
        let f = fixture().await;
        let mut config = f.config.clone();
        config.origin_sectors = 100;
        let err = CacheSession::attach(f.origin, f.cache, config, f.exec.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DeviceMismatch { .. }));
    }

    #[tokio::test]
    async fn test_read_warms_missing_blocks_then_serves_from_cache() {
        let f = fixture().await;
        let session = attach(&f).await;

        // Blocks 2..=4
        let mut buf = vec![0u8; 3 * BLOCK];
        session.read(16, &mut buf).await.unwrap();
        assert_eq!(buf, origin_pattern(16, 24));

        let stats = session.stats();
        assert_eq!(stats.copied_blocks, 3);
        assert_eq!(stats.copies_issued, 3);
        assert_eq!(stats.whole_requests, 1);
        assert_eq!(stats.split_requests, 0);

        // Copies landed in ascending block order
        let copies = f.exec.copies();
        let sectors: Vec<u64> = copies.iter().map(|(from, _)| from.sector).collect();
        assert_eq!(sectors, vec![16, 24, 32]);

        // Second read over the same range is a pure cache hit
        let mut again = vec![0u8; 3 * BLOCK];
        session.read(16, &mut again).await.unwrap();
        assert_eq!(again, buf);
        assert_eq!(session.stats().copies_issued, 3);
    }

    #[tokio::test]
    async fn test_copied_block_never_reported_missing_again() {
        let f = fixture().await;
        let session = attach(&f).await;

        let mut buf = vec![0u8; BLOCK];
        session.read(40, &mut buf).await.unwrap();

        for _ in 0..5 {
            session.read(40, &mut buf).await.unwrap();
        }
        assert_eq!(session.stats().copies_issued, 1);
        assert!(session.bitmap.read().next_missing(5, 5).is_none());
    }

    #[tokio::test]
    async fn test_partially_resident_range_copies_only_missing_blocks() {
        let f = fixture().await;
        let session = attach(&f).await;

        // Warm blocks 88 and 89
        let mut buf = vec![0u8; 2 * BLOCK];
        session.read(88 * 8, &mut buf).await.unwrap();
        assert_eq!(session.stats().copies_issued, 2);

        // Blocks 88..=92 with 88, 89 already set: copies 90, 91, 92 in order
        let mut buf = vec![0u8; 5 * BLOCK];
        session.read(88 * 8, &mut buf).await.unwrap();
        assert_eq!(buf, origin_pattern(88 * 8, 40));
        assert_eq!(session.stats().copies_issued, 5);

        let sectors: Vec<u64> = f.exec.copies().iter().map(|(from, _)| from.sector).collect();
        assert_eq!(sectors, vec![88 * 8, 89 * 8, 90 * 8, 91 * 8, 92 * 8]);
        assert_eq!(session.stats().split_requests, 0);
    }

    #[tokio::test]
    async fn test_request_crossing_frontier_splits_and_skips_uncacheable_blocks() {
        let f = fixture().await;
        let session = attach(&f).await;

        // Sectors 736..754 touch blocks 92..=94; block 94 lies past the
        // frontier and is never copied
        let mut buf = vec![0u8; 18 * SECTOR_SIZE as usize];
        session.read(736, &mut buf).await.unwrap();
        assert_eq!(buf, origin_pattern(736, 18));

        let stats = session.stats();
        assert_eq!(stats.copies_issued, 2); // blocks 92, 93 only
        assert_eq!(stats.split_requests, 1);
        assert!(session.bitmap.read().next_missing(94, 94).is_some());
    }

    #[tokio::test]
    async fn test_request_entirely_past_frontier_bypasses_cache() {
        let f = fixture().await;
        let session = attach(&f).await;

        let mut buf = vec![0u8; 2 * SECTOR_SIZE as usize];
        session.read(752, &mut buf).await.unwrap();
        assert_eq!(buf, origin_pattern(752, 2));

        let stats = session.stats();
        assert_eq!(stats.copies_issued, 0);
        assert_eq!(stats.split_requests, 0);
        assert_eq!(stats.whole_requests, 1);
    }

    #[tokio::test]
    async fn test_write_goes_to_cache_after_warming() {
        let f = fixture().await;
        let session = attach(&f).await;

        let data = vec![0xEEu8; BLOCK];
        session.write(8, &data).await.unwrap();

        // The block was warmed, then overwritten on the cache device only
        assert_eq!(session.stats().copies_issued, 1);
        let cache_data = f.exec.device_data(f.cache);
        assert_eq!(&cache_data[8 * 512..8 * 512 + BLOCK], data.as_slice());

        let mut read = vec![0u8; BLOCK];
        session.read(8, &mut read).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_copy_failure_fails_request_and_keeps_earlier_bits() {
        let f = fixture().await;
        let session = attach(&f).await;
        f.exec.fail_copies_from(2 * 8);

        // Blocks 0..=2; block 2's copy fails
        let mut buf = vec![0u8; 3 * BLOCK];
        let err = session.read(0, &mut buf).await.unwrap_err();
        assert!(matches!(err, CacheError::Copy(ref c) if c.block == 2));

        // Earlier blocks stay copied, the failed one stays missing
        let stats = session.stats();
        assert_eq!(stats.copied_blocks, 2);
        assert!(session.bitmap.read().is_copied(0));
        assert!(session.bitmap.read().is_copied(1));
        assert!(!session.bitmap.read().is_copied(2));
    }

    #[tokio::test]
    async fn test_split_prefix_failure_suppresses_origin_suffix() {
        let f = fixture().await;
        let session = attach(&f).await;
        f.exec.fail_reads_from(f.cache, 736);

        // Sectors 736..754 split at the frontier. Warming succeeds (copies
        // bypass the read path) but the cache-side prefix read fails, so
        // the origin-side suffix must never be issued.
        let mut buf = vec![0u8; 18 * SECTOR_SIZE as usize];
        let err = session.read(736, &mut buf).await.unwrap_err();
        assert!(matches!(err, CacheError::DeviceIo { .. }));

        assert_eq!(session.stats().copies_issued, 2);
        assert!(f.exec.reads().iter().all(|r| r.device != f.origin));
    }

    #[tokio::test]
    async fn test_out_of_bounds_and_misaligned_requests_rejected() {
        let f = fixture().await;
        let session = attach(&f).await;

        let mut buf = vec![0u8; BLOCK];
        assert!(matches!(
            session.read(750, &mut buf).await.unwrap_err(),
            CacheError::OutOfBounds { .. }
        ));

        let mut odd = vec![0u8; 100];
        assert!(matches!(
            session.read(0, &mut odd).await.unwrap_err(),
            CacheError::InvalidConfiguration(_)
        ));

        // Empty request is a no-op
        let mut empty = vec![0u8; 0];
        session.read(0, &mut empty).await.unwrap();

        // A start sector near u64::MAX must not wrap past the bounds check
        assert!(matches!(
            session.read(u64::MAX - 4, &mut buf).await.unwrap_err(),
            CacheError::OutOfBounds { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_copy() {
        const READERS: u64 = 8;

        let f = fixture().await;
        let session = Arc::new(attach(&f).await);
        f.exec.pause_copies();

        let mut handles = Vec::new();
        for _ in 0..READERS {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = vec![0u8; BLOCK];
                session.read(24, &mut buf).await.map(|()| buf)
            }));
        }

        // Wait until one copy is in flight and everyone else is queued
        // behind it, then release the gate.
        while session.stats().copy_waits < READERS - 1 || f.exec.copy_count() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(f.exec.copy_count(), 1);
        f.exec.resume_copies();

        for handle in handles {
            let buf = handle.await.unwrap().unwrap();
            assert_eq!(buf, origin_pattern(24, 8));
        }

        let stats = session.stats();
        assert_eq!(stats.copies_issued, 1);
        assert_eq!(stats.copy_waits, READERS - 1);
        assert_eq!(f.exec.copy_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_fail_uniformly_when_copy_fails() {
        const READERS: u64 = 4;

        let f = fixture().await;
        let session = Arc::new(attach(&f).await);
        f.exec.fail_copies_from(48);
        f.exec.pause_copies();

        let mut handles = Vec::new();
        for _ in 0..READERS {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = vec![0u8; BLOCK];
                session.read(48, &mut buf).await
            }));
        }

        while session.stats().copy_waits < READERS - 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        f.exec.resume_copies();

        // Every request completes, none hangs, all see the copy failure
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, CacheError::Copy(ref c) if c.block == 6));
        }
        assert_eq!(f.exec.copy_count(), 1);
        assert!(!session.bitmap.read().is_copied(6));
    }

    #[tokio::test]
    async fn test_flush_persists_and_reattach_resumes() {
        let f = fixture().await;
        let session = attach(&f).await;

        let mut buf = vec![0u8; 2 * BLOCK];
        session.read(0, &mut buf).await.unwrap();
        session.close().await.unwrap();

        // A new session over the same devices sees the copied blocks and
        // serves them without touching the origin again.
        let session = attach(&f).await;
        assert_eq!(session.stats().copied_blocks, 2);

        let mut again = vec![0u8; 2 * BLOCK];
        session.read(0, &mut again).await.unwrap();
        assert_eq!(again, buf);
        assert_eq!(session.stats().copies_issued, 0);
    }
}

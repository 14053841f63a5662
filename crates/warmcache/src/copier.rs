//! Per-block copy orchestration
//!
//! At most one origin-to-cache copy is outstanding per block index. The
//! first request to need a block becomes its copier; requests arriving
//! while the copy is in flight enqueue a oneshot waiter and suspend. The
//! copier delivers one shared outcome to itself and to every waiter, so a
//! failing copy fails the whole queue uniformly. The in-flight map is
//! guarded by a short-held mutex that is never held across an await.

use crate::bitmap::CopyBitmap;
use crate::error::CopyFailed;
use crate::executor::{BlockIoExecutor, DeviceId, DeviceRegion};
use crate::layout::{BlockIndex, CacheLayout};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type CopyOutcome = Result<(), CopyFailed>;

/// Tracks in-flight block copies and the requests queued behind them
pub(crate) struct CopyCoordinator {
    /// Block index -> waiters for the outstanding copy of that block.
    /// A key is present iff a copy for the block is in flight.
    inflight: Mutex<HashMap<BlockIndex, Vec<oneshot::Sender<CopyOutcome>>>>,
    copies_issued: AtomicU64,
    copy_waits: AtomicU64,
}

impl CopyCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            copies_issued: AtomicU64::new(0),
            copy_waits: AtomicU64::new(0),
        }
    }

    /// Copies issued to the executor so far
    pub(crate) fn copies_issued(&self) -> u64 {
        self.copies_issued.load(Ordering::Relaxed)
    }

    /// Requests that queued behind an already in-flight copy
    pub(crate) fn copy_waits(&self) -> u64 {
        self.copy_waits.load(Ordering::Relaxed)
    }

    /// Ensure `block` is copied to the cache device.
    ///
    /// Either joins the wait list of an in-flight copy or performs the
    /// copy itself, setting the bitmap bit on success. Returns once the
    /// block is resident or its copy has failed.
    pub(crate) async fn copy_block(
        &self,
        block: BlockIndex,
        layout: &CacheLayout,
        bitmap: &RwLock<CopyBitmap>,
        origin: DeviceId,
        cache: DeviceId,
        executor: &dyn BlockIoExecutor,
    ) -> CopyOutcome {
        let waiter = {
            let mut inflight = self.inflight.lock();
            match inflight.entry(block) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(entry) => {
                    entry.insert(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            self.copy_waits.fetch_add(1, Ordering::Relaxed);
            debug!("queued behind in-flight copy of block {}", block);
            // The executor completes every copy exactly once, so the sender
            // side only disappears after delivering an outcome.
            return rx.await.unwrap_or_else(|_| {
                Err(CopyFailed {
                    block,
                    reason: "copy abandoned before completion".to_string(),
                })
            });
        }

        // This request is the copier. The block may have become resident
        // between the caller's bitmap scan and the in-flight reservation;
        // re-check before touching the devices.
        let outcome = if bitmap.read().is_copied(block) {
            Ok(())
        } else {
            self.perform_copy(block, layout, bitmap, origin, cache, executor)
                .await
        };

        let waiters = self.inflight.lock().remove(&block).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
        outcome
    }

    async fn perform_copy(
        &self,
        block: BlockIndex,
        layout: &CacheLayout,
        bitmap: &RwLock<CopyBitmap>,
        origin: DeviceId,
        cache: DeviceId,
        executor: &dyn BlockIoExecutor,
    ) -> CopyOutcome {
        let sector = layout.block_to_sector(block);
        let count = layout.block_sectors();
        let from = DeviceRegion {
            device: origin,
            sector,
            count,
        };
        let to = DeviceRegion {
            device: cache,
            sector,
            count,
        };

        self.copies_issued.fetch_add(1, Ordering::Relaxed);
        debug!("copying block {} ({} sectors at {})", block, count, sector);

        match executor.copy_region(from, to).await {
            Ok(()) => {
                bitmap.write().set(block);
                Ok(())
            }
            Err(e) => {
                warn!("copy of block {} failed: {}", block, e);
                Err(CopyFailed {
                    block,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;

    struct Fixture {
        layout: CacheLayout,
        bitmap: RwLock<CopyBitmap>,
        exec: MemoryExecutor,
        origin: DeviceId,
        cache: DeviceId,
    }

    fn fixture() -> Fixture {
        let layout = CacheLayout::new(512, 100).unwrap();
        let exec = MemoryExecutor::new();
        let origin = exec.add_device(100);
        let cache = exec.add_device(100);
        let bitmap = RwLock::new(CopyBitmap::new(&layout));
        Fixture {
            layout,
            bitmap,
            exec,
            origin,
            cache,
        }
    }

    #[tokio::test]
    async fn test_copy_sets_bit_and_moves_data() {
        let f = fixture();
        let payload = vec![0x77u8; 512];
        f.exec
            .write_region(
                DeviceRegion {
                    device: f.origin,
                    sector: 3,
                    count: 1,
                },
                &payload,
            )
            .await
            .unwrap();

        let coordinator = CopyCoordinator::new();
        coordinator
            .copy_block(3, &f.layout, &f.bitmap, f.origin, f.cache, &f.exec)
            .await
            .unwrap();

        assert!(f.bitmap.read().is_copied(3));
        assert_eq!(coordinator.copies_issued(), 1);
        let cache_data = f.exec.device_data(f.cache);
        assert_eq!(&cache_data[3 * 512..4 * 512], payload.as_slice());
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_bit_clear() {
        let f = fixture();
        f.exec.fail_copies_from(f.layout.block_to_sector(5));

        let coordinator = CopyCoordinator::new();
        let err = coordinator
            .copy_block(5, &f.layout, &f.bitmap, f.origin, f.cache, &f.exec)
            .await
            .unwrap_err();

        assert_eq!(err.block, 5);
        assert!(!f.bitmap.read().is_copied(5));
    }

    #[tokio::test]
    async fn test_already_resident_block_issues_no_copy() {
        let f = fixture();
        f.bitmap.write().set(9);

        let coordinator = CopyCoordinator::new();
        coordinator
            .copy_block(9, &f.layout, &f.bitmap, f.origin, f.cache, &f.exec)
            .await
            .unwrap();

        assert_eq!(coordinator.copies_issued(), 0);
        assert_eq!(f.exec.copy_count(), 0);
    }
}

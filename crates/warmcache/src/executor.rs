//! Block I/O executor interface and reference implementations
//!
//! The executor is the collaborator that actually touches physical devices.
//! The cache core only describes regions and directions; submission,
//! scheduling, and completion are the executor's problem. Every submitted
//! operation completes exactly once, success or failure.
//!
//! Two implementations ship with the crate: [`MemoryExecutor`] backs
//! devices with in-memory sector arrays and adds the failure injection and
//! copy gating the concurrency tests need, and [`FileExecutor`] backs
//! devices with regular files via positioned I/O.

use crate::SECTOR_SIZE;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Opaque handle to an attached physical device
pub type DeviceId = u64;

/// A contiguous sector range on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRegion {
    /// Device the region lives on
    pub device: DeviceId,
    /// First sector of the region
    pub sector: u64,
    /// Length in sectors
    pub count: u64,
}

impl DeviceRegion {
    /// Byte offset of the region start
    pub fn byte_offset(&self) -> u64 {
        self.sector * SECTOR_SIZE
    }

    /// Region length in bytes
    pub fn byte_len(&self) -> usize {
        (self.count * SECTOR_SIZE) as usize
    }
}

/// Asynchronous raw block I/O, provided by the surrounding storage stack.
///
/// Implementations must complete every call exactly once and must tolerate
/// concurrent submissions against overlapping regions; the cache core does
/// its own per-block serialization on top.
#[async_trait]
pub trait BlockIoExecutor: Send + Sync {
    /// Copy `from` to `to` in one shot. The regions have equal length.
    async fn copy_region(&self, from: DeviceRegion, to: DeviceRegion) -> io::Result<()>;

    /// Read a region into `buf`; `buf.len()` equals the region byte length.
    async fn read_region(&self, region: DeviceRegion, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` over a region; `data.len()` equals the region byte length.
    async fn write_region(&self, region: DeviceRegion, data: &[u8]) -> io::Result<()>;
}

fn check_len(region: &DeviceRegion, len: usize) -> io::Result<()> {
    if len != region.byte_len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "buffer of {} bytes does not match region of {} sectors",
                len, region.count
            ),
        ));
    }
    Ok(())
}

/// In-memory executor backing each device with a sector array.
///
/// Besides serving as a reference implementation it is the test harness
/// for the cache core: it logs every copy and read it is asked to perform,
/// can fail copies and reads at chosen sectors, and can hold issued copies
/// open behind a gate so tests can pile requests onto one in-flight block
/// deterministically.
pub struct MemoryExecutor {
    devices: RwLock<HashMap<DeviceId, Arc<Mutex<Vec<u8>>>>>,
    next_id: AtomicU64,
    copy_log: Mutex<Vec<(DeviceRegion, DeviceRegion)>>,
    read_log: Mutex<Vec<DeviceRegion>>,
    fail_copy_sectors: Mutex<HashSet<u64>>,
    fail_read_sectors: Mutex<HashSet<(DeviceId, u64)>>,
    gate: watch::Sender<bool>,
}

impl MemoryExecutor {
    /// Create an executor with no devices
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            devices: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            copy_log: Mutex::new(Vec::new()),
            read_log: Mutex::new(Vec::new()),
            fail_copy_sectors: Mutex::new(HashSet::new()),
            fail_read_sectors: Mutex::new(HashSet::new()),
            gate,
        }
    }

    /// Add a zero-filled device of the given sector count
    pub fn add_device(&self, sectors: u64) -> DeviceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let data = vec![0u8; (sectors * SECTOR_SIZE) as usize];
        self.devices.write().insert(id, Arc::new(Mutex::new(data)));
        id
    }

    /// Snapshot a device's full contents
    pub fn device_data(&self, device: DeviceId) -> Vec<u8> {
        let handle = self
            .devices
            .read()
            .get(&device)
            .cloned()
            .expect("unknown device");
        let data = handle.lock();
        data.clone()
    }

    /// Copies performed so far, in issue order
    pub fn copies(&self) -> Vec<(DeviceRegion, DeviceRegion)> {
        self.copy_log.lock().clone()
    }

    /// Number of copies performed so far
    pub fn copy_count(&self) -> usize {
        self.copy_log.lock().len()
    }

    /// Reads performed so far, in issue order
    pub fn reads(&self) -> Vec<DeviceRegion> {
        self.read_log.lock().clone()
    }

    /// Make every copy whose source starts at `sector` fail
    pub fn fail_copies_from(&self, sector: u64) {
        self.fail_copy_sectors.lock().insert(sector);
    }

    /// Make every read of `device` starting at `sector` fail
    pub fn fail_reads_from(&self, device: DeviceId, sector: u64) {
        self.fail_read_sectors.lock().insert((device, sector));
    }

    /// Hold all subsequent copies open until [`Self::resume_copies`]
    pub fn pause_copies(&self) {
        self.gate.send_replace(false);
    }

    /// Release copies held by [`Self::pause_copies`]
    pub fn resume_copies(&self) {
        self.gate.send_replace(true);
    }

    fn device(&self, id: DeviceId) -> io::Result<Arc<Mutex<Vec<u8>>>> {
        self.devices
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {}", id)))
    }

    fn read_bytes(&self, region: DeviceRegion) -> io::Result<Vec<u8>> {
        let handle = self.device(region.device)?;
        let data = handle.lock();
        let start = region.byte_offset() as usize;
        let end = start + region.byte_len();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("region [{}, {}) past end of device", start, end),
            ));
        }
        Ok(data[start..end].to_vec())
    }

    fn write_bytes(&self, region: DeviceRegion, bytes: &[u8]) -> io::Result<()> {
        let handle = self.device(region.device)?;
        let mut data = handle.lock();
        let start = region.byte_offset() as usize;
        let end = start + region.byte_len();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("region [{}, {}) past end of device", start, end),
            ));
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    async fn wait_gate(&self) {
        let mut rx = self.gate.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockIoExecutor for MemoryExecutor {
    async fn copy_region(&self, from: DeviceRegion, to: DeviceRegion) -> io::Result<()> {
        // Log at issue time so gated copies are still observable
        self.copy_log.lock().push((from, to));
        self.wait_gate().await;

        if self.fail_copy_sectors.lock().contains(&from.sector) {
            return Err(io::Error::other(format!(
                "injected copy failure at sector {}",
                from.sector
            )));
        }

        let bytes = self.read_bytes(from)?;
        self.write_bytes(to, &bytes)
    }

    async fn read_region(&self, region: DeviceRegion, buf: &mut [u8]) -> io::Result<()> {
        check_len(&region, buf.len())?;
        self.read_log.lock().push(region);

        if self
            .fail_read_sectors
            .lock()
            .contains(&(region.device, region.sector))
        {
            return Err(io::Error::other(format!(
                "injected read failure at sector {}",
                region.sector
            )));
        }

        let bytes = self.read_bytes(region)?;
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    async fn write_region(&self, region: DeviceRegion, data: &[u8]) -> io::Result<()> {
        check_len(&region, data.len())?;
        self.write_bytes(region, data)
    }
}

/// File-backed executor using positioned I/O on a blocking thread.
pub struct FileExecutor {
    files: RwLock<HashMap<DeviceId, Arc<File>>>,
    next_id: AtomicU64,
}

impl FileExecutor {
    /// Create an executor with no devices
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open an existing file as a device
    pub fn open_device(&self, path: impl AsRef<Path>) -> io::Result<DeviceId> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(self.register(file))
    }

    /// Create (or truncate) a file of `sectors` sectors and open it
    pub fn create_device(&self, path: impl AsRef<Path>, sectors: u64) -> io::Result<DeviceId> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors * SECTOR_SIZE)?;
        Ok(self.register(file))
    }

    /// Size of a device in sectors
    pub fn device_sectors(&self, device: DeviceId) -> io::Result<u64> {
        let file = self.file(device)?;
        Ok(file.metadata()?.len() / SECTOR_SIZE)
    }

    fn register(&self, file: File) -> DeviceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.files.write().insert(id, Arc::new(file));
        id
    }

    fn file(&self, id: DeviceId) -> io::Result<Arc<File>> {
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {}", id)))
    }
}

impl Default for FileExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockIoExecutor for FileExecutor {
    async fn copy_region(&self, from: DeviceRegion, to: DeviceRegion) -> io::Result<()> {
        let src = self.file(from.device)?;
        let dst = self.file(to.device)?;
        let len = from.byte_len();
        let src_off = from.byte_offset();
        let dst_off = to.byte_offset();

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            src.read_exact_at(&mut buf, src_off)?;
            dst.write_all_at(&buf, dst_off)
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn read_region(&self, region: DeviceRegion, buf: &mut [u8]) -> io::Result<()> {
        check_len(&region, buf.len())?;
        let file = self.file(region.device)?;
        let offset = region.byte_offset();
        let len = buf.len();

        let bytes = tokio::task::spawn_blocking(move || {
            let mut v = vec![0u8; len];
            file.read_exact_at(&mut v, offset)?;
            Ok::<_, io::Error>(v)
        })
        .await
        .map_err(io::Error::other)??;

        buf.copy_from_slice(&bytes);
        Ok(())
    }

    async fn write_region(&self, region: DeviceRegion, data: &[u8]) -> io::Result<()> {
        check_len(&region, data.len())?;
        let file = self.file(region.device)?;
        let offset = region.byte_offset();
        let bytes = data.to_vec();

        tokio::task::spawn_blocking(move || file.write_all_at(&bytes, offset))
            .await
            .map_err(io::Error::other)?
    }
}

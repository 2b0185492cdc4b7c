//! Storage subsystem: disks, their queues, the block manager and I/O statistics.
//!
//! A [`StorageSubsystem`] is created explicitly and threaded through container and algorithm
//! constructors. [`StorageSubsystem::global`] is a convenience accessor configured from the
//! environment on first use.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Bid;
use crate::block_manager::{AllocStrategy, BlockManager};
use crate::buffer::AlignedBuffer;
use crate::config::{QueuePolicy, StorageConfig};
use crate::error::{Error, Result};
use crate::file::{open_file, BlockFile};
use crate::queue::DiskQueue;
use crate::request::{Request, RequestKind};
use crate::stats::{Stats, StatsSnapshot};

static GLOBAL: Mutex<Option<Arc<StorageSubsystem>>> = parking_lot::const_mutex(None);

pub struct StorageSubsystem {
    // queues go first: dropping them joins the workers before the files close
    queues: Vec<DiskQueue>,
    files: Vec<Arc<dyn BlockFile>>,
    bm: BlockManager,
    stats: Arc<Stats>,
    _scratch: Option<tempfile::TempDir>,
}

impl StorageSubsystem {
    /// Opens every configured disk and starts its workers.
    pub fn open(config: StorageConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let scratch = if config.scratch {
            let dir = tempfile::Builder::new()
                .prefix("extmem")
                .tempdir()
                .map_err(|err| Error::device("temporary directory", err))?;
            log::info!("using {} as scratch directory", dir.path().display());
            Some(dir)
        } else {
            None
        };

        let mut disks = Vec::with_capacity(config.disks.len());
        for disk in &config.disks {
            let file = open_file(disk, scratch.as_ref().map(|dir| dir.path()))?;
            disks.push((file, disk.capacity));
        }

        Self::build(disks, config.threads_per_disk, config.queue_policy, scratch)
    }

    /// Builds a subsystem over already opened devices, `(file, capacity)` per disk.
    pub fn with_files(
        disks: Vec<(Arc<dyn BlockFile>, u64)>,
        threads_per_disk: usize,
        policy: QueuePolicy,
    ) -> Result<Arc<Self>> {
        if disks.is_empty() {
            return Err(Error::BadParameter("no disks configured".to_string()));
        }
        if threads_per_disk == 0 {
            return Err(Error::BadParameter("threads_per_disk must be positive".to_string()));
        }
        Self::build(disks, threads_per_disk, policy, None)
    }

    fn build(
        disks: Vec<(Arc<dyn BlockFile>, u64)>,
        threads_per_disk: usize,
        policy: QueuePolicy,
        scratch: Option<tempfile::TempDir>,
    ) -> Result<Arc<Self>> {
        let stats = Arc::new(Stats::new());
        let files: Vec<Arc<dyn BlockFile>> = disks.iter().map(|(file, _)| file.clone()).collect();
        let capacities: Vec<u64> = disks.iter().map(|(_, capacity)| *capacity).collect();

        let mut queues = Vec::with_capacity(files.len());
        for (disk, file) in files.iter().enumerate() {
            queues.push(DiskQueue::start(disk, file.clone(), threads_per_disk, policy, stats.clone())?);
        }

        log::info!(
            "storage subsystem ready ({} disks, {} workers per disk, {:?})",
            files.len(),
            threads_per_disk,
            policy
        );

        return Ok(Arc::new(StorageSubsystem {
            queues,
            bm: BlockManager::new(files.clone(), &capacities),
            files,
            stats,
            _scratch: scratch,
        }));
    }

    /// Process-wide subsystem, configured by [`StorageConfig::from_env`] on first use.
    ///
    /// Statics are never dropped: call [`StorageSubsystem::shutdown_global`] before exit, or a
    /// scratch directory created for it is left behind.
    pub fn global() -> Result<Arc<Self>> {
        let mut global = GLOBAL.lock();
        if let Some(storage) = global.as_ref() {
            return Ok(storage.clone());
        }

        let storage = Self::open(StorageConfig::from_env()?)?;
        *global = Some(storage.clone());
        return Ok(storage);
    }

    /// Releases the process-wide subsystem. Returns `false` if none was open.
    ///
    /// Workers stop and the scratch directory is removed once the last handle drops. A later
    /// [`StorageSubsystem::global`] opens a fresh subsystem.
    pub fn shutdown_global() -> bool {
        let released = GLOBAL.lock().take();
        if released.is_some() {
            log::info!("process-wide storage subsystem released");
        }
        released.is_some()
    }

    /// Temporary directory holding scratch disks, if any.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self._scratch.as_ref().map(|dir| dir.path())
    }

    pub fn disk_count(&self) -> usize {
        self.files.len()
    }

    fn check_request(&self, bid: &Bid, buffer: &AlignedBuffer) -> Result<()> {
        let file = self
            .files
            .get(bid.disk)
            .ok_or_else(|| Error::BadParameter(format!("{} names an unknown disk", bid)))?;
        if buffer.len() < bid.size {
            return Err(Error::BadParameter(format!(
                "buffer of {} bytes is too small for {}",
                buffer.len(),
                bid
            )));
        }
        let alignment = file.alignment() as u64;
        if alignment > 1 && (bid.offset % alignment != 0 || bid.size as u64 % alignment != 0) {
            return Err(Error::BadParameter(format!(
                "{} is not aligned to {} bytes",
                bid, alignment
            )));
        }
        return Ok(());
    }

    fn submit(&self, kind: RequestKind, bid: Bid, buffer: AlignedBuffer) -> Result<Request> {
        self.check_request(&bid, &buffer)?;
        let request = Request::new(kind, bid, buffer, self.stats.clone());
        self.queues[bid.disk].submit(request.clone());
        return Ok(request);
    }

    /// Queues a read of `bid` into `buffer`.
    pub fn aread(&self, bid: Bid, buffer: AlignedBuffer) -> Result<Request> {
        self.submit(RequestKind::Read, bid, buffer)
    }

    /// Queues a write of `buffer` to `bid`.
    pub fn awrite(&self, bid: Bid, buffer: AlignedBuffer) -> Result<Request> {
        self.submit(RequestKind::Write, bid, buffer)
    }

    /// Marks a queued request critical, moving it to the head of its disk queue.
    pub fn promote(&self, request: &Request) -> bool {
        match self.queues.get(request.bid().disk) {
            Some(queue) => queue.promote(request),
            None => false,
        }
    }

    pub fn new_blocks(&self, strategy: AllocStrategy, count: usize, block_size: usize) -> Result<Vec<Bid>> {
        self.bm.new_blocks(strategy, count, block_size)
    }

    pub fn delete_blocks(&self, bids: &[Bid]) -> Result<()> {
        self.bm.delete_blocks(bids)
    }

    /// Bytes currently allocated to containers and algorithms.
    pub fn allocated_bytes(&self) -> u64 {
        self.bm.allocated_bytes()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Flushes every device.
    pub fn sync(&self) -> Result<()> {
        for file in &self.files {
            file.sync().map_err(|err| Error::device(file.name(), err))?;
        }
        return Ok(());
    }
}

//! Block allocation across disks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::block::{check_block_size, Bid};
use crate::error::{Error, Result};
use crate::file::BlockFile;

/// Placement of the blocks of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// Consecutive blocks on consecutive disks, round robin.
    Striping,
    /// Every block on a uniformly random disk.
    FullyRandom,
    /// Each run of `D` consecutive blocks on a random permutation of the disks.
    RandomCyclic,
    /// All blocks on the given disk.
    SingleDisk(usize),
}

impl Default for AllocStrategy {
    fn default() -> Self {
        AllocStrategy::Striping
    }
}

/// First-fit free list of byte extents on one disk, coalescing on free.
#[derive(Debug)]
pub struct FreeList {
    /// Free extents, `offset -> length`, never adjacent to each other.
    extents: BTreeMap<u64, u64>,
    /// End of the managed region.
    end: u64,
    growable: bool,
}

impl FreeList {
    /// `capacity` bytes of free space, or an empty region growing on demand when zero.
    pub fn new(capacity: u64) -> Self {
        let mut extents = BTreeMap::new();
        if capacity > 0 {
            extents.insert(0, capacity);
        }
        FreeList {
            extents,
            end: capacity,
            growable: capacity == 0,
        }
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn free_bytes(&self) -> u64 {
        self.extents.values().sum()
    }

    /// Returns the offset of `size` fresh bytes, or `None` if a fixed region is exhausted.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let fit = self
            .extents
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(offset, len)| (*offset, *len));

        if let Some((offset, len)) = fit {
            self.extents.remove(&offset);
            if len > size {
                self.extents.insert(offset + size, len - size);
            }
            log::trace!("allocated {} bytes at {} (first fit)", size, offset);
            return Some(offset);
        }

        if !self.growable {
            return None;
        }

        // a free tail is extended rather than skipped
        let tail = self
            .extents
            .iter()
            .next_back()
            .filter(|(offset, len)| **offset + **len == self.end)
            .map(|(offset, _)| *offset);
        let offset = match tail {
            Some(offset) => {
                self.extents.remove(&offset);
                offset
            }
            None => self.end,
        };
        self.end = offset + size;
        log::trace!("allocated {} bytes at {} (grew to {})", size, offset, self.end);
        return Some(offset);
    }

    /// Returns `[offset, offset + size)` to the free list.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        if offset + size > self.end {
            return Err(Error::logic(format!(
                "freeing [{}, {}) beyond region end {}",
                offset,
                offset + size,
                self.end
            )));
        }

        let prev = self.extents.range(..=offset).next_back().map(|(o, l)| (*o, *l));
        let next = self.extents.range(offset..).next().map(|(o, l)| (*o, *l));

        if let Some((prev_offset, prev_len)) = prev {
            if prev_offset + prev_len > offset {
                return Err(Error::logic(format!("double free of [{}, {})", offset, offset + size)));
            }
        }
        if let Some((next_offset, _)) = next {
            if next_offset < offset + size {
                return Err(Error::logic(format!("double free of [{}, {})", offset, offset + size)));
            }
        }

        let mut start = offset;
        let mut len = size;
        if let Some((prev_offset, prev_len)) = prev {
            if prev_offset + prev_len == offset {
                self.extents.remove(&prev_offset);
                start = prev_offset;
                len += prev_len;
            }
        }
        if let Some((next_offset, next_len)) = next {
            if next_offset == offset + size {
                self.extents.remove(&next_offset);
                len += next_len;
            }
        }
        self.extents.insert(start, len);
        log::trace!("freed [{}, {}), coalesced into [{}, {})", offset, offset + size, start, start + len);
        return Ok(());
    }
}

struct DiskSpace {
    free: FreeList,
    allocated: u64,
}

/// Allocator of blocks over all disks of a storage subsystem.
///
/// Allocation state is guarded by one mutex; I/O never touches it.
pub struct BlockManager {
    disks: Mutex<Vec<DiskSpace>>,
    files: Vec<Arc<dyn BlockFile>>,
    cursor: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl BlockManager {
    /// `capacities[i]` bytes on disk `i`; zero grows the disk as needed.
    pub fn new(files: Vec<Arc<dyn BlockFile>>, capacities: &[u64]) -> Self {
        let disks = capacities
            .iter()
            .map(|capacity| DiskSpace {
                free: FreeList::new(*capacity),
                allocated: 0,
            })
            .collect();

        BlockManager {
            disks: Mutex::new(disks),
            files,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn disk_count(&self) -> usize {
        self.files.len()
    }

    fn place(&self, strategy: AllocStrategy, count: usize) -> Result<Vec<usize>> {
        let disks = self.disk_count();
        let placement = match strategy {
            AllocStrategy::Striping => {
                let start = self.cursor.fetch_add(count, Ordering::Relaxed);
                (0..count).map(|idx| (start + idx) % disks).collect()
            }
            AllocStrategy::FullyRandom => {
                let mut rng = self.rng.lock();
                (0..count).map(|_| rng.gen_range(0..disks)).collect()
            }
            AllocStrategy::RandomCyclic => {
                let mut rng = self.rng.lock();
                let mut cycle: Vec<usize> = (0..disks).collect();
                let mut placement = Vec::with_capacity(count);
                while placement.len() < count {
                    cycle.shuffle(&mut *rng);
                    placement.extend(cycle.iter().take(count - placement.len()));
                }
                placement
            }
            AllocStrategy::SingleDisk(disk) => {
                if disk >= disks {
                    return Err(Error::BadParameter(format!(
                        "disk {} requested but only {} configured",
                        disk, disks
                    )));
                }
                vec![disk; count]
            }
        };
        return Ok(placement);
    }

    /// Allocates `count` blocks of `block_size` bytes, one extent per involved disk.
    pub fn new_blocks(&self, strategy: AllocStrategy, count: usize, block_size: usize) -> Result<Vec<Bid>> {
        check_block_size(block_size)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let placement = self.place(strategy, count)?;
        let mut per_disk = vec![0u64; self.disk_count()];
        for disk in &placement {
            per_disk[*disk] += 1;
        }

        let mut state = self.disks.lock();
        let mut bases: Vec<Option<u64>> = vec![None; per_disk.len()];
        for (disk, blocks) in per_disk.iter().enumerate().filter(|(_, blocks)| **blocks > 0) {
            let size = blocks * block_size as u64;
            match self.allocate_extent(&mut state, disk, size) {
                Ok(offset) => bases[disk] = Some(offset),
                Err(err) => {
                    // roll back extents already taken for this call
                    for (disk, base) in bases.iter().enumerate() {
                        if let Some(offset) = base {
                            let size = per_disk[disk] * block_size as u64;
                            state[disk].free.free(*offset, size)?;
                            state[disk].allocated -= size;
                        }
                    }
                    return Err(err);
                }
            }
        }
        drop(state);

        let mut used = vec![0u64; per_disk.len()];
        let mut bids = Vec::with_capacity(count);
        for disk in placement {
            let base = bases[disk].ok_or_else(|| Error::logic("placement without extent"))?;
            bids.push(Bid::new(disk, base + used[disk] * block_size as u64, block_size));
            used[disk] += 1;
        }

        log::trace!("allocated {} blocks of {} bytes ({:?})", count, block_size, strategy);
        return Ok(bids);
    }

    fn allocate_extent(&self, state: &mut [DiskSpace], disk: usize, size: u64) -> Result<u64> {
        let space = &mut state[disk];
        let old_end = space.free.end();
        let offset = space
            .free
            .allocate(size)
            .ok_or(Error::NoSpace { disk, requested: size })?;

        if space.free.end() > old_end {
            if let Err(err) = self.files[disk].set_size(space.free.end()) {
                space.free.free(offset, size)?;
                return Err(Error::device(self.files[disk].name(), err));
            }
        }
        space.allocated += size;
        return Ok(offset);
    }

    /// Returns blocks to their disks' free lists.
    pub fn delete_blocks(&self, bids: &[Bid]) -> Result<()> {
        let mut state = self.disks.lock();
        for bid in bids {
            let space = state
                .get_mut(bid.disk)
                .ok_or_else(|| Error::logic(format!("{} names an unknown disk", bid)))?;
            space.free.free(bid.offset, bid.size as u64)?;
            space.allocated -= bid.size as u64;
        }
        return Ok(());
    }

    /// Bytes currently handed out across all disks.
    pub fn allocated_bytes(&self) -> u64 {
        self.disks.lock().iter().map(|space| space.allocated).sum()
    }

    /// Bytes currently handed out on `disk`.
    pub fn allocated_bytes_on(&self, disk: usize) -> u64 {
        self.disks.lock().get(disk).map_or(0, |space| space.allocated)
    }
}

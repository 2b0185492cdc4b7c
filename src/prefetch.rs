//! Sliding-window block reader.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::Bid;
use crate::buffer::AlignedBuffer;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::storage::StorageSubsystem;

/// Reads a fixed sequence of blocks ahead of consumption.
///
/// Keeps up to `window` reads in flight. Reads are submitted in sequence order and blocks are
/// handed out in that same order, whatever order the disks complete them in.
pub struct Prefetcher {
    storage: Arc<StorageSubsystem>,
    bids: Vec<Bid>,
    window: usize,
    next_issue: usize,
    pulled: usize,
    in_flight: VecDeque<Request>,
    spare: Vec<AlignedBuffer>,
}

impl Prefetcher {
    pub fn new(storage: Arc<StorageSubsystem>, bids: Vec<Bid>, window: usize) -> Result<Self> {
        if window == 0 {
            return Err(Error::BadParameter("prefetch window must be positive".to_string()));
        }

        let mut prefetcher = Prefetcher {
            storage,
            bids,
            window,
            next_issue: 0,
            pulled: 0,
            in_flight: VecDeque::with_capacity(window),
            spare: Vec::new(),
        };
        prefetcher.issue()?;

        return Ok(prefetcher);
    }

    fn issue(&mut self) -> Result<()> {
        while self.in_flight.len() < self.window && self.next_issue < self.bids.len() {
            let bid = self.bids[self.next_issue];
            let buffer = match self.spare.pop() {
                Some(buffer) if buffer.len() >= bid.size => buffer,
                _ => AlignedBuffer::new(bid.size)?,
            };
            self.in_flight.push_back(self.storage.aread(bid, buffer)?);
            self.next_issue += 1;
        }
        return Ok(());
    }

    /// Returns the next block, blocking until its read completes.
    ///
    /// A read the caller is about to block on is promoted to the head of its disk queue. The
    /// vacated window slot is refilled before returning.
    pub fn pull(&mut self) -> Result<Option<AlignedBuffer>> {
        let request = match self.in_flight.pop_front() {
            Some(request) => request,
            None => return Ok(None),
        };

        if !request.poll() {
            self.storage.promote(&request);
        }
        let buffer = request.into_buffer()?;
        self.pulled += 1;
        self.issue()?;

        return Ok(Some(buffer));
    }

    /// Hands a consumed buffer back for reuse by later reads.
    pub fn recycle(&mut self, buffer: AlignedBuffer) {
        if self.spare.len() < self.window {
            self.spare.push(buffer);
        }
    }

    /// Blocks not yet pulled.
    pub fn remaining(&self) -> usize {
        self.bids.len() - self.pulled
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        for request in &self.in_flight {
            request.cancel();
        }
        // reads already in flight run to completion before their blocks may be reused
        for request in self.in_flight.drain(..) {
            if let Err(err) = request.wait() {
                if !matches!(err, Error::Cancelled) {
                    log::debug!("abandoned read failed: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::Prefetcher;
    use crate::block::PAGE_SIZE;
    use crate::block_manager::AllocStrategy;
    use crate::buffer::AlignedBuffer;
    use crate::config::StorageConfig;
    use crate::storage::StorageSubsystem;

    #[rstest]
    #[case(1, 1)]
    #[case(3, 4)]
    #[case(4, 64)]
    fn test_prefetcher_order(#[case] disks: usize, #[case] window: usize) {
        let storage = StorageSubsystem::open(StorageConfig::memory(disks, 0).with_threads_per_disk(2)).unwrap();
        let mut bids = storage.new_blocks(AllocStrategy::FullyRandom, 40, PAGE_SIZE).unwrap();
        for (idx, bid) in bids.iter().enumerate() {
            let mut buffer = AlignedBuffer::new(PAGE_SIZE).unwrap();
            buffer[..8].copy_from_slice(&(idx as u64).to_le_bytes());
            storage.awrite(*bid, buffer).unwrap().wait().unwrap();
        }
        // the order of submission is what counts, not the order of allocation
        bids.reverse();

        let mut prefetcher = Prefetcher::new(storage.clone(), bids.clone(), window).unwrap();
        let mut seen = Vec::new();
        while let Some(buffer) = prefetcher.pull().unwrap() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buffer[..8]);
            seen.push(u64::from_le_bytes(raw));
            prefetcher.recycle(buffer);
        }

        assert_eq!(seen, (0..40u64).rev().collect::<Vec<_>>());
        assert_eq!(prefetcher.remaining(), 0);
        storage.delete_blocks(&bids).unwrap();
    }

    #[test]
    fn test_prefetcher_drop_midway() {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
        let bids = storage.new_blocks(AllocStrategy::Striping, 16, PAGE_SIZE).unwrap();

        let mut prefetcher = Prefetcher::new(storage.clone(), bids.clone(), 8).unwrap();
        assert!(prefetcher.pull().unwrap().is_some());
        assert_eq!(prefetcher.remaining(), 15);
        drop(prefetcher);

        storage.delete_blocks(&bids).unwrap();
        assert_eq!(storage.allocated_bytes(), 0);
    }

    #[test]
    fn test_prefetcher_zero_window() {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
        assert!(Prefetcher::new(storage, Vec::new(), 0).is_err());
    }
}

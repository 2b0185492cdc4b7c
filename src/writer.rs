//! Sliding-window block writer.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::{check_block_size, Bid};
use crate::buffer::AlignedBuffer;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::storage::StorageSubsystem;

/// Overlaps block production with writing.
///
/// At most `window` writes are in flight, and at most one per block.
pub struct BufferedWriter {
    storage: Arc<StorageSubsystem>,
    block_size: usize,
    window: usize,
    in_flight: VecDeque<Request>,
    spare: Vec<AlignedBuffer>,
}

impl BufferedWriter {
    pub fn new(storage: Arc<StorageSubsystem>, block_size: usize, window: usize) -> Result<Self> {
        check_block_size(block_size)?;
        if window == 0 {
            return Err(Error::BadParameter("write window must be positive".to_string()));
        }

        return Ok(BufferedWriter {
            storage,
            block_size,
            window,
            in_flight: VecDeque::with_capacity(window),
            spare: Vec::new(),
        });
    }

    /// Returns a buffer to fill, blocking on the oldest write if every slot is busy.
    pub fn free_block(&mut self) -> Result<AlignedBuffer> {
        if let Some(buffer) = self.spare.pop() {
            return Ok(buffer);
        }
        if self.in_flight.len() < self.window {
            return AlignedBuffer::new(self.block_size);
        }

        let oldest = self.in_flight.pop_front().ok_or_else(|| Error::logic("empty write window"))?;
        oldest.into_buffer()
    }

    fn retire_oldest(&mut self) -> Result<()> {
        if let Some(request) = self.in_flight.pop_front() {
            let buffer = request.into_buffer()?;
            if self.spare.len() < self.window {
                self.spare.push(buffer);
            }
        }
        return Ok(());
    }

    /// Issues the write of `buffer` to `bid`.
    pub fn write(&mut self, bid: Bid, buffer: AlignedBuffer) -> Result<()> {
        if let Some(pos) = self.in_flight.iter().position(|request| request.bid() == bid) {
            // a block is never written twice concurrently
            if let Some(previous) = self.in_flight.remove(pos) {
                previous.wait()?;
            }
        }
        while self.in_flight.len() >= self.window {
            self.retire_oldest()?;
        }

        let request = self.storage.awrite(bid, buffer)?;
        self.in_flight.push_back(request);
        return Ok(());
    }

    /// Waits for every issued write. Reports the first failure after all have finished.
    pub fn flush(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(request) = self.in_flight.pop_front() {
            match request.into_buffer() {
                Ok(buffer) => {
                    if self.spare.len() < self.window {
                        self.spare.push(buffer);
                    }
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!("write failed while dropping buffered writer: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::BufferedWriter;
    use crate::block::PAGE_SIZE;
    use crate::block_manager::AllocStrategy;
    use crate::buffer::AlignedBuffer;
    use crate::config::StorageConfig;
    use crate::storage::StorageSubsystem;

    #[rstest]
    #[case(1)]
    #[case(3)]
    fn test_flushed_blocks_read_back(#[case] window: usize) {
        let storage = StorageSubsystem::open(StorageConfig::memory(2, 0)).unwrap();
        let bids = storage.new_blocks(AllocStrategy::Striping, 10, PAGE_SIZE).unwrap();

        let mut writer = BufferedWriter::new(storage.clone(), PAGE_SIZE, window).unwrap();
        for (idx, bid) in bids.iter().enumerate() {
            let mut buffer = writer.free_block().unwrap();
            buffer.fill(idx as u8);
            writer.write(*bid, buffer).unwrap();
            assert!(writer.in_flight() <= window);
        }
        // rewriting a block waits for its previous write
        let mut buffer = writer.free_block().unwrap();
        buffer.fill(0xee);
        writer.write(bids[9], buffer).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.in_flight(), 0);

        for (idx, bid) in bids.iter().enumerate() {
            let expected = if idx == 9 { 0xee } else { idx as u8 };
            let buffer = storage.aread(*bid, AlignedBuffer::new(PAGE_SIZE).unwrap()).unwrap();
            assert!(buffer.into_buffer().unwrap().iter().all(|b| *b == expected));
        }
        storage.delete_blocks(&bids).unwrap();
    }

    #[test]
    fn test_writer_rejects_bad_parameters() {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
        assert!(BufferedWriter::new(storage.clone(), PAGE_SIZE, 0).is_err());
        assert!(BufferedWriter::new(storage, 1000, 2).is_err());
    }
}

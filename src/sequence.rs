//! Block-backed sequences of records.
//!
//! A [`Sequence`] is the on-disk form of a stream of fixed-width records: an ordered list of
//! blocks plus a record count. Sorted runs, sort inputs and sort outputs are all sequences.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::block::{check_block_size, records_per_block, Bid, Record, TypedBlock};
use crate::block_manager::AllocStrategy;
use crate::error::{Error, Result};
use crate::prefetch::Prefetcher;
use crate::storage::StorageSubsystem;
use crate::writer::BufferedWriter;

/// Default number of blocks kept in flight by sequence readers and writers.
pub const DEFAULT_WINDOW: usize = 4;

/// Records stored in a list of blocks. Dropping the sequence frees its blocks.
pub struct Sequence<T: Record> {
    storage: Arc<StorageSubsystem>,
    bids: Vec<Bid>,
    len: u64,
    block_size: usize,
    _record: PhantomData<T>,
}

impl<T: Record> Sequence<T> {
    /// Writes every record of `iter` to a new sequence.
    pub fn from_iter<I>(storage: Arc<StorageSubsystem>, block_size: usize, iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
    {
        let mut writer = SequenceWriter::new(storage, block_size, AllocStrategy::default(), DEFAULT_WINDOW, None)?;
        for record in iter {
            writer.push(record)?;
        }
        writer.finish()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks backing the sequence, in record order.
    pub fn bids(&self) -> &[Bid] {
        &self.bids
    }

    pub fn storage(&self) -> &Arc<StorageSubsystem> {
        &self.storage
    }

    /// Reads the sequence front to back, keeping `window` blocks in flight.
    pub fn reader(&self, window: usize) -> Result<SequenceReader<'_, T>> {
        SequenceReader::new(self.storage.clone(), self.bids.clone(), self.len, window, None)
    }

    /// Consumes the sequence. Each block is freed as soon as the reader is done with it.
    pub fn into_reader(mut self, window: usize) -> Result<SequenceReader<'static, T>> {
        let bids = std::mem::take(&mut self.bids);
        let release = Release {
            storage: self.storage.clone(),
            bids: bids.clone(),
            next: 0,
        };
        SequenceReader::new(self.storage.clone(), bids, self.len, window, Some(release))
    }

    /// Loads the whole sequence into memory.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut records = Vec::with_capacity(self.len as usize);
        for record in self.reader(DEFAULT_WINDOW)? {
            records.push(record?);
        }
        return Ok(records);
    }
}

impl<T: Record> Drop for Sequence<T> {
    fn drop(&mut self) {
        if self.bids.is_empty() {
            return;
        }
        if let Err(err) = self.storage.delete_blocks(&self.bids) {
            log::error!("failed to free {} sequence blocks: {}", self.bids.len(), err);
        }
    }
}

/// Frees the blocks of a consumed sequence, front to back.
struct Release {
    storage: Arc<StorageSubsystem>,
    bids: Vec<Bid>,
    next: usize,
}

impl Release {
    fn release_next(&mut self) -> Result<()> {
        if let Some(bid) = self.bids.get(self.next) {
            self.next += 1;
            self.storage.delete_blocks(std::slice::from_ref(bid))?;
        }
        return Ok(());
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        let rest = &self.bids[self.next..];
        if rest.is_empty() {
            return;
        }
        if let Err(err) = self.storage.delete_blocks(rest) {
            log::error!("failed to free {} consumed sequence blocks: {}", rest.len(), err);
        }
    }
}

/// Forward cursor over a [`Sequence`].
///
/// Also an iterator of `Result<T>`: the first error ends the iteration.
pub struct SequenceReader<'a, T: Record> {
    // the prefetcher must settle its reads before released blocks are handed back
    prefetcher: Prefetcher,
    release: Option<Release>,
    current: Option<TypedBlock<T>>,
    pos: usize,
    in_block: usize,
    remaining: u64,
    failed: bool,
    _sequence: PhantomData<&'a Sequence<T>>,
}

impl<'a, T: Record> SequenceReader<'a, T> {
    fn new(
        storage: Arc<StorageSubsystem>,
        bids: Vec<Bid>,
        len: u64,
        window: usize,
        release: Option<Release>,
    ) -> Result<Self> {
        let prefetcher = Prefetcher::new(storage, bids, window)?;
        return Ok(SequenceReader {
            prefetcher,
            release,
            current: None,
            pos: 0,
            in_block: 0,
            remaining: len,
            failed: false,
            _sequence: PhantomData,
        });
    }

    fn load(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        if self.current.is_some() && self.pos < self.in_block {
            return Ok(true);
        }

        if let Some(block) = self.current.take() {
            self.prefetcher.recycle(block.into_buffer());
        }
        let buffer = self
            .prefetcher
            .pull()?
            .ok_or_else(|| Error::logic(format!("sequence ended {} records early", self.remaining)))?;
        if let Some(release) = self.release.as_mut() {
            release.release_next()?;
        }

        let block = TypedBlock::new(buffer)?;
        self.in_block = (block.capacity() as u64).min(self.remaining) as usize;
        self.pos = 0;
        self.current = Some(block);
        return Ok(true);
    }

    /// Returns the record under the cursor without moving it.
    pub fn peek(&mut self) -> Result<Option<T>> {
        if !self.load()? {
            return Ok(None);
        }
        Ok(self.current.as_ref().map(|block| block.get(self.pos)))
    }

    /// Returns the record under the cursor and moves past it.
    pub fn advance(&mut self) -> Result<Option<T>> {
        let record = self.peek()?;
        if record.is_some() {
            self.pos += 1;
            self.remaining -= 1;
        }
        return Ok(record);
    }

    /// Records not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<'a, T: Record> Iterator for SequenceReader<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.advance().transpose();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.failed { 0 } else { self.remaining as usize };
        (0, Some(remaining))
    }
}

/// Appends records to a new [`Sequence`] block by block.
///
/// With a length hint every block is allocated up front. Otherwise blocks are allocated one by
/// one as they fill up. Dropping an unfinished writer frees everything it allocated.
pub struct SequenceWriter<T: Record> {
    writer: BufferedWriter,
    storage: Arc<StorageSubsystem>,
    strategy: AllocStrategy,
    block_size: usize,
    bids: Vec<Bid>,
    reserved: VecDeque<Bid>,
    current: Option<TypedBlock<T>>,
    fill: usize,
    len: u64,
}

impl<T: Record> SequenceWriter<T> {
    pub fn new(
        storage: Arc<StorageSubsystem>,
        block_size: usize,
        strategy: AllocStrategy,
        window: usize,
        expected_len: Option<u64>,
    ) -> Result<Self> {
        check_block_size(block_size)?;
        let per_block = records_per_block::<T>(block_size) as u64;
        if per_block == 0 {
            return Err(Error::BadParameter(format!(
                "record of {} bytes does not fit a {} byte block",
                T::SIZE,
                block_size
            )));
        }

        let reserved = match expected_len {
            Some(len) if len > 0 => {
                let blocks = ((len + per_block - 1) / per_block) as usize;
                storage.new_blocks(strategy, blocks, block_size)?.into()
            }
            _ => VecDeque::new(),
        };

        return Ok(SequenceWriter {
            writer: BufferedWriter::new(storage.clone(), block_size, window)?,
            storage,
            strategy,
            block_size,
            bids: Vec::new(),
            reserved,
            current: None,
            fill: 0,
            len: 0,
        });
    }

    fn next_bid(&mut self) -> Result<Bid> {
        if let Some(bid) = self.reserved.pop_front() {
            return Ok(bid);
        }
        let mut bids = self.storage.new_blocks(self.strategy, 1, self.block_size)?;
        bids.pop().ok_or_else(|| Error::logic("block manager returned no block"))
    }

    fn flush_block(&mut self) -> Result<()> {
        if let Some(block) = self.current.take() {
            let bid = self.next_bid()?;
            // recorded before the write so that a failed write is still freed
            self.bids.push(bid);
            self.writer.write(bid, block.into_buffer())?;
        }
        self.fill = 0;
        return Ok(());
    }

    pub fn push(&mut self, record: T) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(TypedBlock::new(self.writer.free_block()?)?);
            self.fill = 0;
        }

        let full = match self.current.as_mut() {
            Some(block) => {
                block.set(self.fill, &record);
                self.fill += 1;
                self.fill == block.capacity()
            }
            None => false,
        };
        self.len += 1;

        if full {
            self.flush_block()?;
        }
        return Ok(());
    }

    /// Records pushed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes the partial last block, waits for every write and seals the sequence.
    pub fn finish(mut self) -> Result<Sequence<T>> {
        if self.fill > 0 {
            self.flush_block()?;
        }
        self.writer.flush()?;

        let unused: Vec<Bid> = self.reserved.drain(..).collect();
        if !unused.is_empty() {
            self.storage.delete_blocks(&unused)?;
        }

        log::trace!("sealed sequence of {} records in {} blocks", self.len, self.bids.len());
        return Ok(Sequence {
            storage: self.storage.clone(),
            bids: std::mem::take(&mut self.bids),
            len: self.len,
            block_size: self.block_size,
            _record: PhantomData,
        });
    }
}

impl<T: Record> Drop for SequenceWriter<T> {
    fn drop(&mut self) {
        if self.bids.is_empty() && self.reserved.is_empty() {
            return;
        }
        if let Err(err) = self.writer.flush() {
            log::debug!("abandoned sequence write failed: {}", err);
        }

        let mut abandoned = std::mem::take(&mut self.bids);
        abandoned.extend(self.reserved.drain(..));
        if let Err(err) = self.storage.delete_blocks(&abandoned) {
            log::error!("failed to free {} abandoned sequence blocks: {}", abandoned.len(), err);
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{Sequence, SequenceWriter};
    use crate::block::PAGE_SIZE;
    use crate::block_manager::AllocStrategy;
    use crate::config::StorageConfig;
    use crate::storage::StorageSubsystem;

    #[rstest]
    #[case(0, None)]
    #[case(511, None)]
    #[case(512, Some(512))]
    #[case(5000, Some(5000))]
    #[case(5000, Some(9000))]
    fn test_sequence_write_read(#[case] len: u64, #[case] hint: Option<u64>) {
        let storage = StorageSubsystem::open(StorageConfig::memory(2, 0)).unwrap();
        let mut writer = SequenceWriter::new(storage.clone(), PAGE_SIZE, AllocStrategy::Striping, 2, hint).unwrap();
        for value in 0..len {
            writer.push(value * 3).unwrap();
        }
        let sequence: Sequence<u64> = writer.finish().unwrap();

        assert_eq!(sequence.len(), len);
        assert_eq!(sequence.bids().len() as u64, (len + 511) / 512);
        assert_eq!(storage.allocated_bytes(), sequence.bids().len() as u64 * PAGE_SIZE as u64);
        assert_eq!(sequence.to_vec().unwrap(), (0..len).map(|v| v * 3).collect::<Vec<_>>());

        drop(sequence);
        assert_eq!(storage.allocated_bytes(), 0);
    }

    #[test]
    fn test_reader_cursor() {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
        let sequence = Sequence::from_iter(storage, PAGE_SIZE, vec![7u32, 8, 9]).unwrap();

        let mut reader = sequence.reader(1).unwrap();
        assert_eq!(reader.peek().unwrap(), Some(7));
        assert_eq!(reader.peek().unwrap(), Some(7));
        assert_eq!(reader.advance().unwrap(), Some(7));
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.collect::<Result<Vec<_>, _>>().unwrap(), vec![8, 9]);
    }

    #[test]
    fn test_consuming_reader_frees_blocks() {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
        let sequence = Sequence::from_iter(storage.clone(), PAGE_SIZE, 0..4096u64).unwrap();
        assert_eq!(storage.allocated_bytes(), 8 * PAGE_SIZE as u64);

        let mut reader = sequence.into_reader(2).unwrap();
        for expected in 0..1024u64 {
            assert_eq!(reader.advance().unwrap(), Some(expected));
        }
        // two blocks consumed so far
        assert_eq!(storage.allocated_bytes(), 6 * PAGE_SIZE as u64);

        drop(reader);
        assert_eq!(storage.allocated_bytes(), 0);
    }

    #[test]
    fn test_abandoned_writer_frees_blocks() {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
        let mut writer = SequenceWriter::new(storage.clone(), PAGE_SIZE, AllocStrategy::Striping, 2, Some(10_000)).unwrap();
        for value in 0..3000u64 {
            writer.push(value).unwrap();
        }
        assert!(storage.allocated_bytes() > 0);
        drop(writer);
        assert_eq!(storage.allocated_bytes(), 0);
    }
}

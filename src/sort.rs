//! External sorter.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::slice::ParallelSliceMut;

use crate::block::{check_block_size, records_per_block, Record};
use crate::block_manager::AllocStrategy;
use crate::compare::{check_sentinels, CompareFn, Comparator, Natural};
use crate::error::{Error, Result};
use crate::merger::LoserTreeMerger;
use crate::sequence::{Sequence, SequenceReader, SequenceWriter};
use crate::storage::StorageSubsystem;

/// Default sort block size.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;
/// Default memory budget.
pub const DEFAULT_MEMORY: usize = 64 * DEFAULT_BLOCK_SIZE;
/// Upper bound of the merge fan-in.
pub const MAX_FAN_IN: usize = 512;

/// Blocks reserved for the merge output.
const OUTPUT_WINDOW: usize = 2;
/// Smallest prefetch window of one merge input.
const MIN_INPUT_WINDOW: usize = 2;

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder {
    /// Number of threads to be used to sort runs in memory.
    threads_number: Option<usize>,
    /// Storage the runs live on.
    storage: Option<Arc<StorageSubsystem>>,
    /// Memory budget in bytes.
    memory: usize,
    /// Run block size.
    block_size: usize,
    /// Placement of run blocks.
    strategy: AllocStrategy,
    /// Merge fan-in cap.
    max_fan_in: usize,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => StorageSubsystem::global()?,
        };
        ExternalSorter::new(
            storage,
            self.threads_number,
            self.memory,
            self.block_size,
            self.strategy,
            self.max_fan_in,
        )
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets the storage subsystem. The process-wide one is used otherwise.
    pub fn with_storage(mut self, storage: Arc<StorageSubsystem>) -> ExternalSorterBuilder {
        self.storage = Some(storage);
        return self;
    }

    /// Sets the memory budget in bytes.
    pub fn with_memory(mut self, memory: usize) -> ExternalSorterBuilder {
        self.memory = memory;
        return self;
    }

    /// Sets the block size of runs.
    pub fn with_block_size(mut self, block_size: usize) -> ExternalSorterBuilder {
        self.block_size = block_size;
        return self;
    }

    /// Sets the placement strategy of run blocks.
    pub fn with_strategy(mut self, strategy: AllocStrategy) -> ExternalSorterBuilder {
        self.strategy = strategy;
        return self;
    }

    /// Caps the number of runs merged at once.
    pub fn with_max_fan_in(mut self, max_fan_in: usize) -> ExternalSorterBuilder {
        self.max_fan_in = max_fan_in;
        return self;
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            storage: None,
            memory: DEFAULT_MEMORY,
            block_size: DEFAULT_BLOCK_SIZE,
            strategy: AllocStrategy::Striping,
            max_fan_in: MAX_FAN_IN,
        }
    }
}

/// External multi-way merge sorter.
///
/// Memory of `M` bytes in blocks of `B` bytes is split as follows:
/// * run formation sorts `M / 2B` blocks at a time, the other half serves the input prefetcher
///   and the run writer;
/// * a merge pass merges up to `k = min(max_fan_in, (M/B - 2) / 2)` runs, each read through a
///   window of at least two blocks, into a two block output window.
pub struct ExternalSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    storage: Arc<StorageSubsystem>,
    memory_blocks: usize,
    block_size: usize,
    strategy: AllocStrategy,
    fan_in: usize,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `storage` - Storage holding the runs
    /// * `threads_number` - Number of threads to be used to sort runs in memory. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `memory` - Memory budget in bytes
    /// * `block_size` - Run block size, a power of two of at least one page
    /// * `strategy` - Placement of run blocks
    /// * `max_fan_in` - Merge fan-in cap
    pub fn new(
        storage: Arc<StorageSubsystem>,
        threads_number: Option<usize>,
        memory: usize,
        block_size: usize,
        strategy: AllocStrategy,
        max_fan_in: usize,
    ) -> Result<Self> {
        check_block_size(block_size)?;
        let memory_blocks = memory / block_size;
        let fan_in = max_fan_in.min(memory_blocks.saturating_sub(OUTPUT_WINDOW) / MIN_INPUT_WINDOW);
        if fan_in < 2 {
            return Err(Error::BadParameter(format!(
                "merge fan-in {} below 2 (memory of {} blocks, fan-in cap {})",
                fan_in, memory_blocks, max_fan_in
            )));
        }

        log::info!(
            "external sorter: memory {} blocks of {}, fan-in {}, {:?}",
            memory_blocks,
            bytesize::ByteSize(block_size as u64),
            fan_in,
            strategy
        );

        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            storage,
            memory_blocks,
            block_size,
            strategy,
            fan_in,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| Error::ThreadPool(Arc::new(err)))?;

        return Ok(thread_pool);
    }

    pub fn storage(&self) -> &Arc<StorageSubsystem> {
        &self.storage
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximum number of runs merged in one pass.
    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    /// Records of type `T` in one run.
    pub fn run_capacity<T: Record>(&self) -> usize {
        self.run_blocks() * records_per_block::<T>(self.block_size)
    }

    fn run_blocks(&self) -> usize {
        self.memory_blocks / 2
    }

    fn read_window(&self) -> usize {
        ((self.memory_blocks - self.run_blocks()) / 2).max(1)
    }

    fn write_window(&self) -> usize {
        (self.memory_blocks - self.run_blocks() - self.read_window()).max(1)
    }

    fn input_window(&self, runs: usize) -> usize {
        ((self.memory_blocks - OUTPUT_WINDOW) / runs.max(1)).max(MIN_INPUT_WINDOW)
    }

    /// Sorts `input` in ascending order into a new sequence.
    pub fn sort<T: Record + Ord>(&self, input: &Sequence<T>) -> Result<Sequence<T>> {
        self.sort_with(input, Natural)
    }

    /// Sorts `input` using a custom compare function.
    pub fn sort_by<T, F>(&self, input: &Sequence<T>, compare: F) -> Result<Sequence<T>>
    where
        T: Record,
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        self.sort_with(input, CompareFn(compare))
    }

    /// Sorts `input` using a fallible comparator.
    pub fn sort_with<T, C>(&self, input: &Sequence<T>, cmp: C) -> Result<Sequence<T>>
    where
        T: Record,
        C: Comparator<T>,
    {
        let reader = input.reader(self.read_window())?;
        self.sort_results(reader, cmp)
    }

    /// Sorts the records of an in-memory iterator into a new sequence.
    pub fn sort_iter<T, I, C>(&self, input: I, cmp: C) -> Result<Sequence<T>>
    where
        T: Record,
        I: IntoIterator<Item = T>,
        C: Comparator<T>,
    {
        self.sort_results(input.into_iter().map(Ok), cmp)
    }

    /// Sorts `input` but leaves the final merge to the caller: the returned stream merges the
    /// last runs as it is pulled.
    pub fn stream_by<T, C>(&self, input: &Sequence<T>, cmp: C) -> Result<SortedStream<T, C>>
    where
        T: Record,
        C: Comparator<T>,
    {
        check_sentinels(&cmp)?;
        let reader = input.reader(self.read_window())?;
        let runs = self.prepare_runs(reader, &cmp)?;

        let total = runs.iter().map(|run| run.len()).sum();
        let window = self.input_window(runs.len());
        let readers = runs
            .into_iter()
            .map(|run| run.into_reader(window))
            .collect::<Result<Vec<_>>>()?;

        return Ok(SortedStream {
            merger: LoserTreeMerger::new(readers, cmp),
            remaining: total,
        });
    }

    fn sort_results<T, I, C>(&self, input: I, cmp: C) -> Result<Sequence<T>>
    where
        T: Record,
        I: Iterator<Item = Result<T>>,
        C: Comparator<T>,
    {
        check_sentinels(&cmp)?;
        let started = Instant::now();
        let before = self.storage.stats();

        let mut runs = self.prepare_runs(input, &cmp)?;
        let sorted = match runs.len() {
            0 => SequenceWriter::new(self.storage.clone(), self.block_size, self.strategy, 1, None)?.finish()?,
            // whole input fit one run
            1 => runs.remove(0),
            _ => self.merge_runs(runs, &cmp)?,
        };

        log::info!(
            "sorted {} records in {:.3}s\n{}",
            sorted.len(),
            started.elapsed().as_secs_f64(),
            self.storage.stats() - before
        );
        return Ok(sorted);
    }

    /// Forms runs and merges them until at most `fan_in` remain.
    fn prepare_runs<T, I, C>(&self, input: I, cmp: &C) -> Result<Vec<Sequence<T>>>
    where
        T: Record,
        I: Iterator<Item = Result<T>>,
        C: Comparator<T>,
    {
        let mut runs = self.form_runs(input, cmp)?;
        log::info!(
            "formed {} runs ({} records each at most, fan-in {})",
            runs.len(),
            self.run_capacity::<T>(),
            self.fan_in
        );

        let mut pass = 0;
        while runs.len() > self.fan_in {
            pass += 1;
            log::debug!("merge pass {}: {} runs", pass, runs.len());

            let mut merged = Vec::with_capacity((runs.len() + self.fan_in - 1) / self.fan_in);
            let mut rest = runs.into_iter();
            loop {
                let group: Vec<Sequence<T>> = rest.by_ref().take(self.fan_in).collect();
                match group.len() {
                    0 => break,
                    1 => merged.extend(group),
                    _ => merged.push(self.merge_runs(group, cmp)?),
                }
            }
            runs = merged;
        }

        return Ok(runs);
    }

    fn form_runs<T, I, C>(&self, input: I, cmp: &C) -> Result<Vec<Sequence<T>>>
    where
        T: Record,
        I: Iterator<Item = Result<T>>,
        C: Comparator<T>,
    {
        let capacity = self.run_capacity::<T>();
        if capacity == 0 {
            return Err(Error::BadParameter(format!(
                "record of {} bytes does not fit a {} byte block",
                T::SIZE,
                self.block_size
            )));
        }

        let mut runs = Vec::new();
        let mut buffer = Vec::new();
        for item in input {
            buffer.push(item?);
            if buffer.len() == capacity {
                runs.push(self.create_run(&mut buffer, cmp)?);
            }
        }

        if !buffer.is_empty() {
            runs.push(self.create_run(&mut buffer, cmp)?);
        }

        return Ok(runs);
    }

    fn create_run<T, C>(&self, buffer: &mut Vec<T>, cmp: &C) -> Result<Sequence<T>>
    where
        T: Record,
        C: Comparator<T>,
    {
        log::debug!("sorting run of {} records ...", buffer.len());
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        self.thread_pool.install(|| {
            buffer.par_sort_by(|a, b| match cmp.compare(a, b) {
                Ok(ordering) => ordering,
                Err(err) => {
                    failure.lock().get_or_insert(err);
                    Ordering::Equal
                }
            });
        });
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }

        log::debug!("saving run");
        let mut writer = SequenceWriter::new(
            self.storage.clone(),
            self.block_size,
            self.strategy,
            self.write_window(),
            Some(buffer.len() as u64),
        )?;
        for record in buffer.drain(..) {
            writer.push(record)?;
        }

        writer.finish()
    }

    /// Merges `runs` into one. Blocks of the inputs are freed as they are consumed.
    fn merge_runs<T, C>(&self, runs: Vec<Sequence<T>>, cmp: &C) -> Result<Sequence<T>>
    where
        T: Record,
        C: Comparator<T>,
    {
        let total: u64 = runs.iter().map(|run| run.len()).sum();
        let window = self.input_window(runs.len());
        log::debug!("merging {} runs ({} records, window {})", runs.len(), total, window);

        let readers = runs
            .into_iter()
            .map(|run| run.into_reader(window))
            .collect::<Result<Vec<_>>>()?;
        let mut writer = SequenceWriter::new(
            self.storage.clone(),
            self.block_size,
            self.strategy,
            OUTPUT_WINDOW,
            Some(total),
        )?;
        for record in LoserTreeMerger::new(readers, cmp) {
            writer.push(record?)?;
        }

        if writer.len() != total {
            return Err(Error::logic(format!(
                "merge emitted {} of {} records",
                writer.len(),
                total
            )));
        }
        writer.finish()
    }
}

/// Final merge of a sort, pulled record by record.
pub struct SortedStream<T: Record, C: Comparator<T>> {
    merger: LoserTreeMerger<T, C, SequenceReader<'static, T>>,
    remaining: u64,
}

impl<T: Record, C: Comparator<T>> SortedStream<T, C> {
    /// Records not yet pulled.
    pub fn len(&self) -> u64 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl<T: Record, C: Comparator<T>> Iterator for SortedStream<T, C> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.merger.next()?;
        if item.is_ok() {
            self.remaining = self.remaining.saturating_sub(1);
        }
        Some(item)
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder};
    use crate::block::PAGE_SIZE;
    use crate::compare::{Bounded, Comparator, Natural};
    use crate::config::{QueuePolicy, StorageConfig};
    use crate::error::{Error, Result};
    use crate::file::{BlockFile, MemoryFile};
    use crate::sequence::Sequence;
    use crate::storage::StorageSubsystem;

    #[fixture]
    fn storage() -> Arc<StorageSubsystem> {
        StorageSubsystem::open(StorageConfig::memory(2, 0)).unwrap()
    }

    fn sorter(storage: &Arc<StorageSubsystem>, memory_blocks: usize) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_storage(storage.clone())
            .with_memory(memory_blocks * PAGE_SIZE)
            .with_block_size(PAGE_SIZE)
            .with_threads_number(2)
            .build()
            .unwrap()
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter(storage: Arc<StorageSubsystem>, #[case] reversed: bool) {
        let input_sorted = 0..20_000;

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, input_shuffled).unwrap();

        let sorter = sorter(&storage, 8);

        let compare = if reversed {
            |a: &i32, b: &i32| a.cmp(b).reverse()
        } else {
            |a: &i32, b: &i32| a.cmp(b)
        };

        let result = sorter.sort_by(&input, compare).unwrap();

        let actual_result = result.to_vec().unwrap();
        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result)
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter_stability(storage: Arc<StorageSubsystem>, #[case] reversed: bool) {
        let input_sorted = (0..2000).flat_map(|x| (0..5).map(move |y| (x, y)));

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());
        // sort input by the second field to check sorting stability
        input_shuffled.sort_by(|a: &(i32, i32), b: &(i32, i32)| {
            if reversed {
                a.1.cmp(&b.1).reverse()
            } else {
                a.1.cmp(&b.1)
            }
        });
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, input_shuffled).unwrap();

        let sorter = sorter(&storage, 8);

        let compare = if reversed {
            |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0).reverse()
        } else {
            |a: &(i32, i32), b: &(i32, i32)| a.0.cmp(&b.0)
        };

        let result = sorter.sort_by(&input, compare).unwrap();

        let actual_result = result.to_vec().unwrap();
        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result)
    }

    #[rstest]
    fn test_tiny_sort(storage: Arc<StorageSubsystem>) {
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, vec![42u64, 0, 23]).unwrap();
        let sorted = sorter(&storage, 64).sort(&input).unwrap();

        assert_eq!(sorted.to_vec().unwrap(), vec![0, 23, 42]);
        drop((input, sorted));
        assert_eq!(storage.allocated_bytes(), 0);
    }

    #[rstest]
    fn test_large_sort(storage: Arc<StorageSubsystem>) {
        let n = 192 * PAGE_SIZE / 8;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let records: Vec<u64> = (0..n).map(|_| 1 + rng.gen::<u64>() % 0x0FFF_FFFF).collect();
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, records.clone()).unwrap();

        let sorted = sorter(&storage, 64).sort(&input).unwrap();
        let actual = sorted.to_vec().unwrap();

        let mut expected = records;
        expected.sort();
        assert_eq!(actual.len(), n);
        assert!(actual.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_second_merge_pass(storage: Arc<StorageSubsystem>) {
        let sorter = sorter(&storage, 8);
        assert_eq!(sorter.fan_in(), 3);
        assert_eq!(sorter.run_capacity::<u64>(), 2048);

        // fan-in + 1 runs
        let n = 4 * 2048u64;
        let mut records: Vec<u64> = (0..n).collect();
        records.shuffle(&mut StdRng::seed_from_u64(7));
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, records).unwrap();
        let input_bytes = storage.allocated_bytes();

        let before = storage.stats();
        let sorted = sorter.sort(&input).unwrap();
        let delta = storage.stats() - before;

        // runs, then three of them merged, then the final merge
        assert_eq!(delta.writes, 16 + 12 + 16);
        assert_eq!(storage.allocated_bytes(), 2 * input_bytes);
        assert_eq!(sorted.to_vec().unwrap(), (0..n).collect::<Vec<_>>());

        drop((input, sorted));
        assert_eq!(storage.allocated_bytes(), 0);
    }

    #[rstest]
    fn test_empty_input(storage: Arc<StorageSubsystem>) {
        let input: Sequence<u64> = Sequence::from_iter(storage.clone(), PAGE_SIZE, Vec::new()).unwrap();
        let sorted = sorter(&storage, 8).sort(&input).unwrap();
        assert!(sorted.is_empty());
        assert!(sorted.bids().is_empty());
    }

    #[rstest]
    fn test_stream_by(storage: Arc<StorageSubsystem>) {
        let sorter = sorter(&storage, 8);
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, (0..10_000u32).rev()).unwrap();

        let mut stream = sorter.stream_by(&input, Natural).unwrap();
        assert_eq!(stream.len(), 10_000);
        assert_eq!(stream.next().unwrap().unwrap(), 0);
        assert_eq!(stream.len(), 9_999);

        let rest: Result<Vec<u32>> = stream.collect();
        assert_eq!(rest.unwrap(), (1..10_000).collect::<Vec<_>>());
    }

    #[rstest]
    fn test_sort_iter(storage: Arc<StorageSubsystem>) {
        let sorted = sorter(&storage, 6).sort_iter(vec![3i16, -1, 2, -7], Natural).unwrap();
        assert_eq!(sorted.to_vec().unwrap(), vec![-7, -1, 2, 3]);
    }

    #[rstest]
    #[case(5, 512)]
    #[case(64, 1)]
    fn test_bad_fan_in(storage: Arc<StorageSubsystem>, #[case] memory_blocks: usize, #[case] max_fan_in: usize) {
        let result = ExternalSorterBuilder::new()
            .with_storage(storage)
            .with_memory(memory_blocks * PAGE_SIZE)
            .with_block_size(PAGE_SIZE)
            .with_max_fan_in(max_fan_in)
            .build();
        assert!(matches!(result, Err(Error::BadParameter(_))));
    }

    #[rstest]
    fn test_inverted_sentinels(storage: Arc<StorageSubsystem>) {
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, vec![1u32, 2]).unwrap();
        let result = sorter(&storage, 8).sort_with(&input, Bounded::new(Natural, u32::MAX, 0));
        assert!(matches!(result, Err(Error::BadParameter(_))));
    }

    struct FailingComparator {
        calls: AtomicUsize,
        limit: usize,
    }

    impl Comparator<u64> for FailingComparator {
        fn compare(&self, a: &u64, b: &u64) -> Result<Ordering> {
            if self.calls.fetch_add(1, AtomicOrdering::Relaxed) >= self.limit {
                return Err(Error::Comparator("comparison budget exhausted".to_string()));
            }
            Ok(a.cmp(b))
        }
    }

    #[rstest]
    #[case(100)]
    #[case(30_000)]
    fn test_comparator_failure(storage: Arc<StorageSubsystem>, #[case] limit: usize) {
        let mut records: Vec<u64> = (0..8192).collect();
        records.shuffle(&mut StdRng::seed_from_u64(11));
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, records).unwrap();
        let input_bytes = storage.allocated_bytes();

        let cmp = FailingComparator {
            calls: AtomicUsize::new(0),
            limit,
        };
        let result = sorter(&storage, 8).sort_with(&input, cmp);

        assert!(matches!(result, Err(Error::Comparator(_))));
        assert_eq!(storage.allocated_bytes(), input_bytes);
    }

    /// Memory device failing exactly one read.
    struct FailingFile {
        inner: MemoryFile,
        reads: AtomicUsize,
        fail_at: usize,
    }

    impl BlockFile for FailingFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            if self.reads.fetch_add(1, AtomicOrdering::SeqCst) + 1 == self.fail_at {
                return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
            }
            self.inner.read_at(offset, buf)
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
            self.inner.write_at(offset, buf)
        }

        fn size(&self) -> io::Result<u64> {
            self.inner.size()
        }

        fn set_size(&self, size: u64) -> io::Result<()> {
            self.inner.set_size(size)
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_read_failure_frees_everything() {
        let file: Arc<dyn BlockFile> = Arc::new(FailingFile {
            inner: MemoryFile::new("ram"),
            reads: AtomicUsize::new(0),
            fail_at: 17,
        });
        let storage = StorageSubsystem::with_files(vec![(file, 0)], 1, QueuePolicy::Fifo).unwrap();

        // 16 input blocks: the 17th read belongs to the merge
        let input = Sequence::from_iter(storage.clone(), PAGE_SIZE, (0..8192u64).rev()).unwrap();
        let input_bytes = storage.allocated_bytes();

        let result = sorter(&storage, 8).sort(&input);

        assert!(matches!(result, Err(Error::Io { .. })), "{:?}", result.err());
        assert_eq!(storage.allocated_bytes(), input_bytes);
        drop(input);
        assert_eq!(storage.allocated_bytes(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn sort_is_sorted_permutation(records in proptest::collection::vec(any::<u32>(), 0..8000)) {
            let storage = StorageSubsystem::open(StorageConfig::memory(3, 0)).unwrap();
            let sorter = sorter(&storage, 6);

            let sorted = sorter.sort_iter(records.clone(), Natural).unwrap();
            let mut expected = records;
            expected.sort();
            prop_assert_eq!(sorted.to_vec().unwrap(), expected.clone());

            // sorting sorted data changes nothing
            let again = sorter.sort(&sorted).unwrap();
            prop_assert_eq!(again.to_vec().unwrap(), expected);
        }
    }
}

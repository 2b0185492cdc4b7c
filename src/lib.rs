//! `ext-memory` provides containers and algorithms for data that does not fit into main memory.
//!
//! Data lives in fixed-size blocks spread over one or more disks. Every disk is served by its own
//! queue and worker threads, so transfers run asynchronously and overlap with computation. On top
//! of that block layer the crate builds:
//!
//! * **Sequences:**
//!   append-only runs of fixed-width records, written through a window of in-flight blocks and
//!   read back through a prefetcher.
//! * **External sort:**
//!   run formation in memory sorted in parallel, followed by loser tree merges of up to `k` runs
//!   at a time. Extra merge passes are added when the memory budget cannot hold all runs at once.
//! * **External map:**
//!   an ordered map stored as a disk-paged B+ tree with LRU caches of inner nodes and leaves.
//!
//! # Example
//!
//! ```no_run
//! use ext_memory::{ExternalSorterBuilder, Sequence, StorageConfig, StorageSubsystem};
//!
//! fn main() {
//!     let storage = StorageSubsystem::open(StorageConfig::scratch(2)).unwrap();
//!     let input = Sequence::from_iter(storage.clone(), 1 << 20, (0..1_000_000u64).rev()).unwrap();
//!
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_storage(storage)
//!         .with_memory(64 << 20)
//!         .with_block_size(1 << 20)
//!         .build()
//!         .unwrap();
//!     let sorted = sorter.sort(&input).unwrap();
//!
//!     for record in sorted.reader(4).unwrap() {
//!         println!("{}", record.unwrap());
//!     }
//! }
//! ```

pub mod block;
pub mod block_manager;
pub mod buffer;
pub mod compare;
pub mod config;
pub mod error;
pub mod file;
pub mod map;
pub mod merger;
pub mod prefetch;
pub mod queue;
pub mod request;
pub mod sequence;
pub mod sort;
pub mod stats;
pub mod storage;
pub mod writer;

pub use block::{Bid, Record, TypedBlock, PAGE_SIZE};
pub use block_manager::AllocStrategy;
pub use buffer::AlignedBuffer;
pub use compare::{Bounded, CompareFn, Comparator, Natural};
pub use config::{DiskConfig, IoFlavor, QueuePolicy, StorageConfig};
pub use error::{Error, Result};
pub use map::{CacheStats, ExtMap, ExtMapBuilder};
pub use merger::{LoserTree, LoserTreeMerger};
pub use prefetch::Prefetcher;
pub use request::{Request, RequestKind, RequestState};
pub use sequence::{Sequence, SequenceReader, SequenceWriter};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortedStream};
pub use stats::StatsSnapshot;
pub use storage::StorageSubsystem;
pub use writer::BufferedWriter;

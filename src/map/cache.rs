//! LRU cache of decoded tree nodes.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::node::NodeCodec;
use crate::block::Bid;
use crate::buffer::AlignedBuffer;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::storage::StorageSubsystem;

/// Counters of one node cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    /// Nodes read synchronously.
    pub misses: u64,
    /// Nodes served by a read issued ahead of time.
    pub prefetched: u64,
    /// Dirty nodes written back.
    pub writebacks: u64,
}

struct Slot<N> {
    node: N,
    dirty: bool,
}

/// Nodes keyed by their block. Dirty nodes are written back when evicted.
pub(crate) struct NodeCache<N> {
    lru: LruCache<Bid, Slot<N>>,
    /// Read issued ahead of a forward scan.
    pending: Option<Request>,
    stats: CacheStats,
}

fn write_back<N: NodeCodec>(storage: &StorageSubsystem, bid: Bid, node: &N) -> Result<()> {
    let mut buffer = AlignedBuffer::new(bid.size)?;
    node.encode(&mut buffer);
    storage.awrite(bid, buffer)?.wait()
}

impl<N: NodeCodec> NodeCache<N> {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::BadParameter("node cache needs at least one block".to_string()))?;

        return Ok(NodeCache {
            lru: LruCache::new(capacity),
            pending: None,
            stats: CacheStats::default(),
        });
    }

    /// Returns the node stored at `bid`, reading it on a miss.
    pub fn get(&mut self, storage: &StorageSubsystem, bid: Bid) -> Result<&N> {
        if self.lru.contains(&bid) {
            self.stats.hits += 1;
        } else {
            let node = self.fetch(storage, bid)?;
            self.insert(storage, bid, Slot { node, dirty: false })?;
        }

        self.lru
            .get(&bid)
            .map(|slot| &slot.node)
            .ok_or_else(|| Error::logic(format!("{} vanished from the node cache", bid)))
    }

    fn fetch(&mut self, storage: &StorageSubsystem, bid: Bid) -> Result<N> {
        let buffer = match self.pending.take() {
            Some(request) if request.bid() == bid => {
                self.stats.prefetched += 1;
                request.into_buffer()?
            }
            pending => {
                self.pending = pending;
                self.stats.misses += 1;
                storage.aread(bid, AlignedBuffer::new(bid.size)?)?.into_buffer()?
            }
        };
        N::decode(&buffer, bid)
    }

    fn insert(&mut self, storage: &StorageSubsystem, bid: Bid, slot: Slot<N>) -> Result<()> {
        if let Some((evicted, old)) = self.lru.push(bid, slot) {
            if evicted != bid && old.dirty {
                log::debug!("evicting dirty node {}", evicted);
                write_back(storage, evicted, &old.node)?;
                self.stats.writebacks += 1;
            }
        }
        return Ok(());
    }

    fn forget_pending(&mut self, bid: Bid) {
        if matches!(&self.pending, Some(request) if request.bid() == bid) {
            if let Some(request) = self.pending.take() {
                request.cancel();
            }
        }
    }

    /// Stores a modified node.
    pub fn put(&mut self, storage: &StorageSubsystem, bid: Bid, node: N) -> Result<()> {
        self.forget_pending(bid);
        self.insert(storage, bid, Slot { node, dirty: true })
    }

    /// Drops the node of a freed block without writing it.
    pub fn discard(&mut self, bid: Bid) {
        self.forget_pending(bid);
        self.lru.pop(&bid);
    }

    /// Starts reading `bid` unless it is resident or already on its way.
    pub fn hint(&mut self, storage: &StorageSubsystem, bid: Bid) -> Result<()> {
        if self.lru.contains(&bid) || matches!(&self.pending, Some(request) if request.bid() == bid) {
            return Ok(());
        }
        if let Some(previous) = self.pending.take() {
            previous.cancel();
        }

        self.pending = Some(storage.aread(bid, AlignedBuffer::new(bid.size)?)?);
        return Ok(());
    }

    /// Writes every dirty node back.
    pub fn flush(&mut self, storage: &StorageSubsystem) -> Result<()> {
        let mut written = 0;
        for (bid, slot) in self.lru.iter_mut() {
            if slot.dirty {
                write_back(storage, *bid, &slot.node)?;
                slot.dirty = false;
                written += 1;
            }
        }
        self.stats.writebacks += written;
        return Ok(());
    }

    /// Forgets every node without writing anything.
    pub fn clear(&mut self) {
        if let Some(request) = self.pending.take() {
            request.cancel();
        }
        self.lru.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }
}

impl<N> Drop for NodeCache<N> {
    fn drop(&mut self) {
        if let Some(request) = self.pending.take() {
            request.cancel();
            // the block may be freed right after
            let _ = request.wait();
        }
    }
}

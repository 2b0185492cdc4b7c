//! Ordered map paged to disk as a B+ tree.
//!
//! Inner nodes and leaves are kept decoded in two LRU caches sized at construction; every
//! other node lives only on disk. Leaves are chained front to back for range scans. The map
//! owns its blocks: [`ExtMap::clear`] and dropping the map free them synchronously.
//!
//! A map is meant for one thread at a time. The cache mutex is its only lock.

mod cache;
mod node;

use std::collections::BTreeSet;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{check_block_size, Bid, Record};
use crate::block_manager::AllocStrategy;
use crate::error::{Error, Result};
use crate::storage::StorageSubsystem;
pub use cache::CacheStats;
use cache::NodeCache;
use node::{leaf_capacity, node_capacity, Inner, Leaf};

/// Default block size of tree nodes.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;
/// Default number of inner nodes kept in memory.
pub const DEFAULT_NODE_CACHE: usize = 16;
/// Default number of leaves kept in memory.
pub const DEFAULT_LEAF_CACHE: usize = 32;

/// Smallest usable number of entries per leaf and of keys per inner node.
const MIN_FANOUT: usize = 3;

/// Builder of [`ExtMap`].
#[derive(Clone)]
pub struct ExtMapBuilder {
    storage: Option<Arc<StorageSubsystem>>,
    block_size: usize,
    node_cache: usize,
    leaf_cache: usize,
    strategy: AllocStrategy,
    leaf_fanout: Option<usize>,
    node_fanout: Option<usize>,
}

impl ExtMapBuilder {
    pub fn new() -> Self {
        ExtMapBuilder::default()
    }

    /// Sets the storage subsystem. The process-wide one is used otherwise.
    pub fn with_storage(mut self, storage: Arc<StorageSubsystem>) -> ExtMapBuilder {
        self.storage = Some(storage);
        return self;
    }

    pub fn with_block_size(mut self, block_size: usize) -> ExtMapBuilder {
        self.block_size = block_size;
        return self;
    }

    /// Sets the number of inner nodes kept in memory.
    pub fn with_node_cache(mut self, blocks: usize) -> ExtMapBuilder {
        self.node_cache = blocks;
        return self;
    }

    /// Sets the number of leaves kept in memory.
    pub fn with_leaf_cache(mut self, blocks: usize) -> ExtMapBuilder {
        self.leaf_cache = blocks;
        return self;
    }

    pub fn with_strategy(mut self, strategy: AllocStrategy) -> ExtMapBuilder {
        self.strategy = strategy;
        return self;
    }

    /// Caps the entries per leaf below what a block holds.
    pub fn with_leaf_fanout(mut self, entries: usize) -> ExtMapBuilder {
        self.leaf_fanout = Some(entries);
        return self;
    }

    /// Caps the separator keys per inner node below what a block holds.
    pub fn with_node_fanout(mut self, keys: usize) -> ExtMapBuilder {
        self.node_fanout = Some(keys);
        return self;
    }

    pub fn build<K: Record + Ord, V: Record>(self) -> Result<ExtMap<K, V>> {
        check_block_size(self.block_size)?;
        let storage = match self.storage {
            Some(storage) => storage,
            None => StorageSubsystem::global()?,
        };

        let leaf_fanout = capped(leaf_capacity::<K, V>(self.block_size), self.leaf_fanout);
        let node_fanout = capped(node_capacity::<K>(self.block_size), self.node_fanout);
        if leaf_fanout < MIN_FANOUT || node_fanout < MIN_FANOUT {
            return Err(Error::BadParameter(format!(
                "fanout of {} entries per leaf and {} keys per node is below {}",
                leaf_fanout, node_fanout, MIN_FANOUT
            )));
        }

        let mut tree = Tree {
            storage,
            block_size: self.block_size,
            strategy: self.strategy,
            leaf_fanout,
            node_fanout,
            root: Bid::new(0, 0, self.block_size),
            height: 0,
            len: 0,
            leaves: NodeCache::new(self.leaf_cache)?,
            nodes: NodeCache::new(self.node_cache)?,
            blocks: BTreeSet::new(),
        };
        tree.root = tree.allocate()?;
        tree.leaves.put(&tree.storage, tree.root, Leaf::new())?;

        log::debug!(
            "external map: {} byte nodes, {} entries per leaf, {} keys per node",
            self.block_size,
            leaf_fanout,
            node_fanout
        );
        return Ok(ExtMap { tree: Mutex::new(tree) });
    }
}

impl Default for ExtMapBuilder {
    fn default() -> Self {
        ExtMapBuilder {
            storage: None,
            block_size: DEFAULT_BLOCK_SIZE,
            node_cache: DEFAULT_NODE_CACHE,
            leaf_cache: DEFAULT_LEAF_CACHE,
            strategy: AllocStrategy::Striping,
            leaf_fanout: None,
            node_fanout: None,
        }
    }
}

fn take_spare(spare: &mut Vec<Bid>) -> Result<Bid> {
    spare.pop().ok_or_else(|| Error::logic("split ran out of reserved blocks"))
}

fn capped(capacity: usize, cap: Option<usize>) -> usize {
    match cap {
        Some(cap) => capacity.min(cap),
        None => capacity,
    }
}

/// Ordered map of fixed-width keys and values stored in a disk-paged B+ tree.
///
/// Inserting an existing key leaves the map unchanged.
pub struct ExtMap<K: Record + Ord, V: Record> {
    tree: Mutex<Tree<K, V>>,
}

struct Tree<K: Record + Ord, V: Record> {
    storage: Arc<StorageSubsystem>,
    block_size: usize,
    strategy: AllocStrategy,
    leaf_fanout: usize,
    node_fanout: usize,
    root: Bid,
    /// Inner levels above the leaves.
    height: usize,
    len: u64,
    leaves: NodeCache<Leaf<K, V>>,
    nodes: NodeCache<Inner<K>>,
    /// Every block owned by the tree.
    blocks: BTreeSet<Bid>,
}

/// Inner nodes passed on the way down, with the child taken at each.
type Path = Vec<(Bid, usize)>;

impl<K: Record + Ord, V: Record> Tree<K, V> {
    fn allocate(&mut self) -> Result<Bid> {
        let bid = self
            .storage
            .new_blocks(self.strategy, 1, self.block_size)?
            .pop()
            .ok_or_else(|| Error::logic("block manager returned no block"))?;
        self.blocks.insert(bid);
        return Ok(bid);
    }

    fn release(&mut self, bid: Bid) -> Result<()> {
        if !self.blocks.remove(&bid) {
            return Err(Error::logic(format!("{} freed twice by the tree", bid)));
        }
        self.storage.delete_blocks(&[bid])
    }

    fn min_leaf(&self) -> usize {
        self.leaf_fanout / 2
    }

    fn min_node(&self) -> usize {
        self.node_fanout / 2
    }

    fn leaf(&mut self, bid: Bid) -> Result<&Leaf<K, V>> {
        self.leaves.get(&self.storage, bid)
    }

    fn inner(&mut self, bid: Bid) -> Result<&Inner<K>> {
        self.nodes.get(&self.storage, bid)
    }

    /// Walks from the root to the leaf that holds `key` or would hold it.
    fn descend(&mut self, key: &K, mut path: Option<&mut Path>) -> Result<Bid> {
        let mut bid = self.root;
        for _ in 0..self.height {
            let node = self.inner(bid)?;
            let idx = node.child_index(key);
            let child = node.children[idx];
            if let Some(path) = path.as_mut() {
                path.push((bid, idx));
            }
            bid = child;
        }
        return Ok(bid);
    }

    fn edge_leaf(&mut self, rightmost: bool) -> Result<Bid> {
        let mut bid = self.root;
        for _ in 0..self.height {
            let node = self.inner(bid)?;
            let child = if rightmost { node.children.last() } else { node.children.first() };
            bid = *child.ok_or_else(|| Error::logic(format!("inner node {} without children", bid)))?;
        }
        return Ok(bid);
    }

    fn find(&mut self, key: &K) -> Result<Option<V>> {
        let bid = self.descend(key, None)?;
        let leaf = self.leaf(bid)?;
        Ok(leaf.find(key).ok().map(|pos| leaf.entries[pos].1))
    }

    /// First entry at or after position `pos` of leaf `bid`, following the leaf chain.
    fn first_from(&mut self, mut bid: Bid, mut pos: usize) -> Result<Option<(K, V)>> {
        loop {
            let leaf = self.leaf(bid)?;
            if let Some(entry) = leaf.entries.get(pos) {
                return Ok(Some(*entry));
            }
            match leaf.next {
                Some(next) => {
                    bid = next;
                    pos = 0;
                }
                None => return Ok(None),
            }
        }
    }

    fn lower_bound(&mut self, key: &K) -> Result<Option<(K, V)>> {
        let bid = self.descend(key, None)?;
        let pos = self.leaf(bid)?.lower(key);
        self.first_from(bid, pos)
    }

    fn upper_bound(&mut self, key: &K) -> Result<Option<(K, V)>> {
        let bid = self.descend(key, None)?;
        let pos = self.leaf(bid)?.upper(key);
        self.first_from(bid, pos)
    }

    /// Leaf and position of the first entry not below `start`.
    fn seek(&mut self, start: Bound<&K>) -> Result<(Bid, usize)> {
        match start {
            Bound::Included(key) => {
                let bid = self.descend(key, None)?;
                Ok((bid, self.leaf(bid)?.lower(key)))
            }
            Bound::Excluded(key) => {
                let bid = self.descend(key, None)?;
                Ok((bid, self.leaf(bid)?.upper(key)))
            }
            Bound::Unbounded => Ok((self.edge_leaf(false)?, 0)),
        }
    }

    fn last(&mut self) -> Result<Option<(K, V)>> {
        let bid = self.edge_leaf(true)?;
        Ok(self.leaf(bid)?.entries.last().copied())
    }

    fn insert(&mut self, key: K, value: V) -> Result<bool> {
        let mut path = Path::with_capacity(self.height);
        let bid = self.descend(&key, Some(&mut path))?;

        let mut leaf = self.leaf(bid)?.clone();
        match leaf.find(&key) {
            Ok(_) => return Ok(false),
            Err(pos) => leaf.entries.insert(pos, (key, value)),
        }

        if leaf.entries.len() <= self.leaf_fanout {
            self.len += 1;
            self.leaves.put(&self.storage, bid, leaf)?;
            return Ok(true);
        }

        // a failed reservation leaves the tree untouched
        let mut spare = self.reserve_split(&path)?;
        self.len += 1;

        let right_bid = take_spare(&mut spare)?;
        let right_entries = leaf.entries.split_off(leaf.entries.len() / 2);
        let separator = right_entries[0].0;
        let right = Leaf {
            entries: right_entries,
            next: leaf.next,
        };
        leaf.next = Some(right_bid);
        self.leaves.put(&self.storage, bid, leaf)?;
        self.leaves.put(&self.storage, right_bid, right)?;

        self.insert_separator(path, bid, separator, right_bid, &mut spare)?;
        if !spare.is_empty() {
            return Err(Error::logic(format!("split left {} reserved blocks unused", spare.len())));
        }
        return Ok(true);
    }

    /// Allocates every block a split of the leaf below `path` consumes: the new leaf, one sibling
    /// per full ancestor, and a new root when all of them are full.
    fn reserve_split(&mut self, path: &Path) -> Result<Vec<Bid>> {
        let mut needed = 1;
        let mut root_splits = true;
        for (bid, _) in path.iter().rev() {
            if self.inner(*bid)?.keys.len() < self.node_fanout {
                root_splits = false;
                break;
            }
            needed += 1;
        }
        if root_splits {
            needed += 1;
        }

        let bids = self.storage.new_blocks(self.strategy, needed, self.block_size)?;
        self.blocks.extend(bids.iter().copied());
        return Ok(bids);
    }

    /// Hooks the new right sibling of `left` into the parent, splitting upwards as needed.
    fn insert_separator(
        &mut self,
        mut path: Path,
        mut left: Bid,
        mut separator: K,
        mut right: Bid,
        spare: &mut Vec<Bid>,
    ) -> Result<()> {
        loop {
            let (parent_bid, idx) = match path.pop() {
                Some(step) => step,
                None => {
                    let root = Inner {
                        keys: vec![separator],
                        children: vec![left, right],
                    };
                    let root_bid = take_spare(spare)?;
                    self.nodes.put(&self.storage, root_bid, root)?;
                    self.root = root_bid;
                    self.height += 1;
                    log::debug!("root split, tree height {}", self.height + 1);
                    return Ok(());
                }
            };

            let mut parent = self.inner(parent_bid)?.clone();
            parent.keys.insert(idx, separator);
            parent.children.insert(idx + 1, right);
            if parent.keys.len() <= self.node_fanout {
                return self.nodes.put(&self.storage, parent_bid, parent);
            }

            let mid = parent.keys.len() / 2;
            let right_keys = parent.keys.split_off(mid + 1);
            let up = parent
                .keys
                .pop()
                .ok_or_else(|| Error::logic("split of an inner node without keys"))?;
            let right_children = parent.children.split_off(mid + 1);
            let sibling_bid = take_spare(spare)?;
            self.nodes.put(&self.storage, parent_bid, parent)?;
            self.nodes.put(
                &self.storage,
                sibling_bid,
                Inner {
                    keys: right_keys,
                    children: right_children,
                },
            )?;

            left = parent_bid;
            separator = up;
            right = sibling_bid;
        }
    }

    fn erase(&mut self, key: &K) -> Result<bool> {
        let mut path = Path::with_capacity(self.height);
        let bid = self.descend(key, Some(&mut path))?;

        let mut leaf = self.leaf(bid)?.clone();
        match leaf.find(key) {
            Ok(pos) => {
                leaf.entries.remove(pos);
            }
            Err(_) => return Ok(false),
        }
        self.len -= 1;

        self.rebalance_leaf(path, bid, leaf)?;
        return Ok(true);
    }

    fn rebalance_leaf(&mut self, mut path: Path, bid: Bid, mut leaf: Leaf<K, V>) -> Result<()> {
        let (parent_bid, idx) = match path.last() {
            Some(step) if leaf.entries.len() < self.min_leaf() => *step,
            _ => return self.leaves.put(&self.storage, bid, leaf),
        };
        let mut parent = self.inner(parent_bid)?.clone();

        if idx > 0 {
            let left_bid = parent.children[idx - 1];
            let mut left = self.leaf(left_bid)?.clone();
            if left.entries.len() > self.min_leaf() {
                if let Some(entry) = left.entries.pop() {
                    leaf.entries.insert(0, entry);
                    parent.keys[idx - 1] = entry.0;
                }
                self.leaves.put(&self.storage, left_bid, left)?;
                self.leaves.put(&self.storage, bid, leaf)?;
                return self.nodes.put(&self.storage, parent_bid, parent);
            }

            left.entries.extend(leaf.entries);
            left.next = leaf.next;
            self.leaves.put(&self.storage, left_bid, left)?;
            self.leaves.discard(bid);
            self.release(bid)?;
            parent.keys.remove(idx - 1);
            parent.children.remove(idx);
        } else {
            let right_bid = parent.children[idx + 1];
            let mut right = self.leaf(right_bid)?.clone();
            if right.entries.len() > self.min_leaf() {
                let entry = right.entries.remove(0);
                leaf.entries.push(entry);
                parent.keys[idx] = right.entries[0].0;
                self.leaves.put(&self.storage, right_bid, right)?;
                self.leaves.put(&self.storage, bid, leaf)?;
                return self.nodes.put(&self.storage, parent_bid, parent);
            }

            leaf.entries.extend(right.entries);
            leaf.next = right.next;
            self.leaves.put(&self.storage, bid, leaf)?;
            self.leaves.discard(right_bid);
            self.release(right_bid)?;
            parent.keys.remove(idx);
            parent.children.remove(idx + 1);
        }

        path.pop();
        self.rebalance_inner(path, parent_bid, parent)
    }

    fn rebalance_inner(&mut self, mut path: Path, mut bid: Bid, mut node: Inner<K>) -> Result<()> {
        loop {
            let (parent_bid, idx) = match path.last() {
                Some(step) => *step,
                None => {
                    if node.keys.is_empty() {
                        self.root = node.children[0];
                        self.height -= 1;
                        self.nodes.discard(bid);
                        self.release(bid)?;
                        log::debug!("root collapsed, tree height {}", self.height + 1);
                        return Ok(());
                    }
                    return self.nodes.put(&self.storage, bid, node);
                }
            };
            if node.keys.len() >= self.min_node() {
                return self.nodes.put(&self.storage, bid, node);
            }

            let mut parent = self.inner(parent_bid)?.clone();
            if idx > 0 {
                let left_bid = parent.children[idx - 1];
                let mut left = self.inner(left_bid)?.clone();
                if left.keys.len() > self.min_node() {
                    if let (Some(key), Some(child)) = (left.keys.pop(), left.children.pop()) {
                        node.keys.insert(0, parent.keys[idx - 1]);
                        node.children.insert(0, child);
                        parent.keys[idx - 1] = key;
                    }
                    self.nodes.put(&self.storage, left_bid, left)?;
                    self.nodes.put(&self.storage, bid, node)?;
                    return self.nodes.put(&self.storage, parent_bid, parent);
                }

                left.keys.push(parent.keys.remove(idx - 1));
                left.keys.extend(node.keys);
                left.children.extend(node.children);
                parent.children.remove(idx);
                self.nodes.put(&self.storage, left_bid, left)?;
                self.nodes.discard(bid);
                self.release(bid)?;
            } else {
                let right_bid = parent.children[idx + 1];
                let mut right = self.inner(right_bid)?.clone();
                if right.keys.len() > self.min_node() {
                    let key = right.keys.remove(0);
                    let child = right.children.remove(0);
                    node.keys.push(parent.keys[idx]);
                    node.children.push(child);
                    parent.keys[idx] = key;
                    self.nodes.put(&self.storage, right_bid, right)?;
                    self.nodes.put(&self.storage, bid, node)?;
                    return self.nodes.put(&self.storage, parent_bid, parent);
                }

                node.keys.push(parent.keys.remove(idx));
                node.keys.extend(right.keys);
                node.children.extend(right.children);
                parent.children.remove(idx + 1);
                self.nodes.put(&self.storage, bid, node)?;
                self.nodes.discard(right_bid);
                self.release(right_bid)?;
            }

            path.pop();
            bid = parent_bid;
            node = parent;
        }
    }

    fn free_all(&mut self) -> Result<()> {
        self.leaves.clear();
        self.nodes.clear();
        let blocks: Vec<Bid> = std::mem::take(&mut self.blocks).into_iter().collect();
        self.storage.delete_blocks(&blocks)
    }

    fn clear(&mut self) -> Result<()> {
        self.free_all()?;
        self.height = 0;
        self.len = 0;
        self.root = self.allocate()?;
        self.leaves.put(&self.storage, self.root, Leaf::new())
    }

    #[cfg(test)]
    fn check(&mut self) -> Result<()> {
        let mut level = vec![self.root];
        for depth in 0..self.height {
            let mut below = Vec::new();
            for bid in level {
                let node = self.inner(bid)?.clone();
                assert_eq!(node.children.len(), node.keys.len() + 1);
                assert!(node.keys.windows(2).all(|pair| pair[0] < pair[1]));
                assert!(node.keys.len() <= self.node_fanout);
                if depth > 0 {
                    assert!(node.keys.len() >= self.min_node(), "underfull inner node {}", bid);
                }
                below.extend(node.children);
            }
            level = below;
        }

        let mut seen = 0u64;
        let mut previous: Option<K> = None;
        let mut bid = Some(self.edge_leaf(false)?);
        let mut leaves = 0;
        while let Some(current) = bid {
            let leaf = self.leaf(current)?.clone();
            assert!(leaf.entries.len() <= self.leaf_fanout);
            if self.height > 0 {
                assert!(leaf.entries.len() >= self.min_leaf(), "underfull leaf {}", current);
            }
            for (key, _) in &leaf.entries {
                assert!(previous.map_or(true, |previous| previous < *key));
                previous = Some(*key);
            }
            seen += leaf.entries.len() as u64;
            leaves += 1;
            bid = leaf.next;
        }

        assert_eq!(leaves, level.len());
        assert_eq!(seen, self.len);
        return Ok(());
    }
}

impl<K: Record + Ord, V: Record> Drop for Tree<K, V> {
    fn drop(&mut self) {
        if let Err(err) = self.free_all() {
            log::error!("failed to free map blocks: {}", err);
        }
    }
}

impl<K: Record + Ord, V: Record> ExtMap<K, V> {
    /// Creates an empty map with default parameters on `storage`.
    pub fn new(storage: Arc<StorageSubsystem>) -> Result<Self> {
        ExtMapBuilder::new().with_storage(storage).build()
    }

    pub fn len(&self) -> u64 {
        self.tree.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value stored under `key`.
    pub fn find(&self, key: &K) -> Result<Option<V>> {
        self.tree.lock().find(key)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.find(key)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Inserts `key` unless present. Returns whether the map changed.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        self.tree.get_mut().insert(key, value)
    }

    /// Inserts every pair, skipping keys already present. Returns the number inserted.
    pub fn insert_bulk<I>(&mut self, entries: I) -> Result<u64>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let tree = self.tree.get_mut();
        let mut inserted = 0;
        for (key, value) in entries {
            if tree.insert(key, value)? {
                inserted += 1;
            }
        }
        return Ok(inserted);
    }

    /// Removes `key`. Returns whether it was present.
    pub fn erase(&mut self, key: &K) -> Result<bool> {
        self.tree.get_mut().erase(key)
    }

    /// Removes every key within `range`. Returns the number removed.
    pub fn erase_range<R: RangeBounds<K>>(&mut self, range: R) -> Result<u64> {
        let tree = self.tree.get_mut();
        let mut start = range.start_bound().cloned();
        let mut removed = 0;
        loop {
            let (bid, pos) = tree.seek(start.as_ref())?;
            let key = match tree.first_from(bid, pos)? {
                Some((key, _)) if range.contains(&key) => key,
                _ => break,
            };
            tree.erase(&key)?;
            removed += 1;
            start = Bound::Excluded(key);
        }
        return Ok(removed);
    }

    /// First entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &K) -> Result<Option<(K, V)>> {
        self.tree.lock().lower_bound(key)
    }

    /// First entry whose key is greater than `key`.
    pub fn upper_bound(&self, key: &K) -> Result<Option<(K, V)>> {
        self.tree.lock().upper_bound(key)
    }

    pub fn first(&self) -> Result<Option<(K, V)>> {
        let mut tree = self.tree.lock();
        let bid = tree.edge_leaf(false)?;
        tree.first_from(bid, 0)
    }

    pub fn last(&self) -> Result<Option<(K, V)>> {
        self.tree.lock().last()
    }

    /// Forward iteration over all entries.
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.range(..)
    }

    /// Forward iteration over the entries within `range`.
    ///
    /// While a leaf is consumed, the read of its successor is already in flight.
    pub fn range<R: RangeBounds<K>>(&self, range: R) -> Iter<'_, K, V> {
        Iter {
            map: self,
            start: Some(range.start_bound().cloned()),
            end: range.end_bound().cloned(),
            entries: Vec::new(),
            pos: 0,
            next: None,
            done: false,
        }
    }

    /// Removes every entry and frees the blocks right away.
    pub fn clear(&mut self) -> Result<()> {
        self.tree.get_mut().clear()
    }

    /// Writes every dirty cached node back to disk.
    pub fn flush(&self) -> Result<()> {
        let mut tree = self.tree.lock();
        let tree = &mut *tree;
        tree.nodes.flush(&tree.storage)?;
        tree.leaves.flush(&tree.storage)
    }

    /// Counters of the inner node cache and of the leaf cache.
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        let tree = self.tree.lock();
        (tree.nodes.stats(), tree.leaves.stats())
    }

    /// Levels from the root down to the leaves.
    pub fn height(&self) -> usize {
        self.tree.lock().height + 1
    }

    /// Blocks owned by the map.
    pub fn blocks(&self) -> usize {
        self.tree.lock().blocks.len()
    }
}

/// Forward iterator over a range of an [`ExtMap`].
pub struct Iter<'a, K: Record + Ord, V: Record> {
    map: &'a ExtMap<K, V>,
    start: Option<Bound<K>>,
    end: Bound<K>,
    entries: Vec<(K, V)>,
    pos: usize,
    next: Option<Bid>,
    done: bool,
}

impl<'a, K: Record + Ord, V: Record> Iter<'a, K, V> {
    fn load(&mut self) -> Result<bool> {
        let mut tree = self.map.tree.lock();
        let tree = &mut *tree;

        let (bid, pos) = match self.start.take() {
            Some(start) => tree.seek(start.as_ref())?,
            None => match self.next {
                Some(next) => (next, 0),
                None => return Ok(false),
            },
        };

        let leaf = tree.leaves.get(&tree.storage, bid)?;
        self.entries.clear();
        self.entries.extend_from_slice(&leaf.entries);
        self.pos = pos;
        self.next = leaf.next;
        if let Some(next) = self.next {
            tree.leaves.hint(&tree.storage, next)?;
        }
        return Ok(true);
    }

    fn advance(&mut self) -> Result<Option<(K, V)>> {
        while self.pos >= self.entries.len() {
            if !self.load()? {
                return Ok(None);
            }
        }

        let entry = self.entries[self.pos];
        let within = match &self.end {
            Bound::Included(end) => entry.0 <= *end,
            Bound::Excluded(end) => entry.0 < *end,
            Bound::Unbounded => true,
        };
        if !within {
            return Ok(None);
        }
        self.pos += 1;
        return Ok(Some(entry));
    }
}

impl<'a, K: Record + Ord, V: Record> Iterator for Iter<'a, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::ops::Bound;
    use std::sync::Arc;

    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::*;

    use super::{ExtMap, ExtMapBuilder};
    use crate::block::PAGE_SIZE;
    use crate::config::StorageConfig;
    use crate::error::{Error, Result};
    use crate::storage::StorageSubsystem;

    #[fixture]
    fn storage() -> Arc<StorageSubsystem> {
        StorageSubsystem::open(StorageConfig::memory(2, 0)).unwrap()
    }

    /// Small fanouts and caches so that a few thousand keys exercise splits, merges and eviction.
    fn small_map(storage: &Arc<StorageSubsystem>) -> ExtMap<u64, u64> {
        ExtMapBuilder::new()
            .with_storage(storage.clone())
            .with_block_size(PAGE_SIZE)
            .with_leaf_fanout(8)
            .with_node_fanout(5)
            .with_leaf_cache(4)
            .with_node_cache(3)
            .build()
            .unwrap()
    }

    fn collect(map: &ExtMap<u64, u64>) -> Vec<(u64, u64)> {
        map.iter().collect::<Result<Vec<_>>>().unwrap()
    }

    #[rstest]
    fn test_insert_find_erase(storage: Arc<StorageSubsystem>) {
        let mut map = small_map(&storage);
        assert!(map.is_empty());
        assert_eq!(map.first().unwrap(), None);

        for key in (0..500u64).rev() {
            assert!(map.insert(key, key + 1).unwrap());
        }
        assert!(!map.insert(7, 0).unwrap());
        assert_eq!(map.find(&7).unwrap(), Some(8));
        assert_eq!(map.len(), 500);
        assert!(map.height() > 2);
        map.tree.get_mut().check().unwrap();

        for key in (0..500u64).filter(|key| key % 3 != 0) {
            assert!(map.erase(&key).unwrap());
        }
        assert!(!map.erase(&1).unwrap());
        map.tree.get_mut().check().unwrap();
        assert_eq!(collect(&map), (0..500u64).step_by(3).map(|key| (key, key + 1)).collect::<Vec<_>>());

        for key in (0..500u64).step_by(3) {
            assert!(map.erase(&key).unwrap());
        }
        assert!(map.is_empty());
        assert_eq!(map.height(), 1);
        assert_eq!(map.blocks(), 1);
        map.tree.get_mut().check().unwrap();
    }

    #[rstest]
    fn test_bounds_and_ranges(storage: Arc<StorageSubsystem>) {
        let mut map = small_map(&storage);
        map.insert_bulk((0..100u64).map(|key| (key * 10, key))).unwrap();

        assert_eq!(map.lower_bound(&55).unwrap(), Some((60, 6)));
        assert_eq!(map.lower_bound(&60).unwrap(), Some((60, 6)));
        assert_eq!(map.upper_bound(&60).unwrap(), Some((70, 7)));
        assert_eq!(map.upper_bound(&990).unwrap(), None);
        assert_eq!(map.first().unwrap(), Some((0, 0)));
        assert_eq!(map.last().unwrap(), Some((990, 99)));

        let keys = |range: (Bound<u64>, Bound<u64>)| -> Vec<u64> {
            map.range(range).map(|entry| entry.unwrap().0).collect()
        };
        assert_eq!(keys((Bound::Included(200), Bound::Excluded(240))), vec![200, 210, 220, 230]);
        assert_eq!(keys((Bound::Excluded(200), Bound::Included(240))), vec![210, 220, 230, 240]);
        assert_eq!(keys((Bound::Included(975), Bound::Unbounded)), vec![980, 990]);
        assert!(keys((Bound::Included(2000), Bound::Unbounded)).is_empty());
    }

    #[rstest]
    fn test_erase_range(storage: Arc<StorageSubsystem>) {
        let mut map = small_map(&storage);
        map.insert_bulk((0..1000u64).map(|key| (key, key))).unwrap();

        assert_eq!(map.erase_range(100..=599).unwrap(), 500);
        assert_eq!(map.erase_range(100..600).unwrap(), 0);
        assert_eq!(map.len(), 500);
        assert_eq!(map.lower_bound(&100).unwrap(), Some((600, 600)));
        map.tree.get_mut().check().unwrap();

        assert_eq!(map.erase_range(..).unwrap(), 500);
        assert!(map.is_empty());
        map.tree.get_mut().check().unwrap();
    }

    #[rstest]
    fn test_bulk_insert_key_range(storage: Arc<StorageSubsystem>) {
        let mut map: ExtMap<u64, u64> = ExtMapBuilder::new()
            .with_storage(storage.clone())
            .with_block_size(PAGE_SIZE)
            .build()
            .unwrap();
        let (lower, upper) = (1_000_000u64, 1_003_000u64);

        assert_eq!(map.insert_bulk((lower..upper).map(|key| (key, 2 * key))).unwrap(), 3000);
        for key in lower..upper {
            assert_eq!(map.find(&key).unwrap(), Some(2 * key));
        }
        assert_eq!(map.find(&upper).unwrap(), None);
    }

    #[test]
    fn test_insert_out_of_space_leaves_map_intact() {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 3 * PAGE_SIZE as u64)).unwrap();
        let mut map = small_map(&storage);

        let (failed, err) = (0u64..)
            .find_map(|key| map.insert(key, key).err().map(|err| (key, err)))
            .unwrap();
        assert!(matches!(err, Error::NoSpace { disk: 0, .. }), "{}", err);

        assert_eq!(map.len(), failed);
        assert_eq!(map.iter().count() as u64, failed);
        assert_eq!(map.find(&failed).unwrap(), None);
        for key in 0..failed {
            assert_eq!(map.find(&key).unwrap(), Some(key));
        }
        assert_eq!(storage.allocated_bytes(), map.blocks() as u64 * PAGE_SIZE as u64);
        map.tree.get_mut().check().unwrap();

        // keys landing in a leaf with room still go in
        assert!(map.erase(&0).unwrap());
        assert!(map.insert(0, 7).unwrap());
        assert_eq!(map.find(&0).unwrap(), Some(7));
        map.tree.get_mut().check().unwrap();
    }

    #[rstest]
    fn test_blocks_freed(storage: Arc<StorageSubsystem>) {
        let mut map = small_map(&storage);
        map.insert_bulk((0..2000u64).map(|key| (key, key))).unwrap();
        assert_eq!(storage.allocated_bytes(), map.blocks() as u64 * PAGE_SIZE as u64);

        map.clear().unwrap();
        assert!(map.is_empty());
        assert_eq!(storage.allocated_bytes(), PAGE_SIZE as u64);
        assert_eq!(collect(&map), Vec::new());

        map.insert(1, 1).unwrap();
        drop(map);
        assert_eq!(storage.allocated_bytes(), 0);
    }

    #[rstest]
    fn test_scan_prefetches_leaves(storage: Arc<StorageSubsystem>) {
        let mut map = small_map(&storage);
        map.insert_bulk((0..3000u64).map(|key| (key, key))).unwrap();
        map.flush().unwrap();

        assert_eq!(collect(&map).len(), 3000);
        let (nodes, leaves) = map.cache_stats();
        assert!(leaves.prefetched > 0);
        assert!(leaves.writebacks > 0);
        assert!(nodes.hits > 0);
    }

    #[rstest]
    #[case(ExtMapBuilder::new().with_block_size(1000))]
    #[case(ExtMapBuilder::new().with_block_size(PAGE_SIZE).with_leaf_fanout(2))]
    #[case(ExtMapBuilder::new().with_block_size(PAGE_SIZE).with_leaf_cache(0))]
    fn test_bad_parameters(storage: Arc<StorageSubsystem>, #[case] builder: ExtMapBuilder) {
        let result = builder.with_storage(storage).build::<u64, u64>();
        assert!(matches!(result, Err(Error::BadParameter(_))));
    }

    /// Random operation mix checked step by step against `BTreeMap`.
    fn run_against_reference(map: &mut ExtMap<u64, u64>, seed: u64, steps: usize, key_space: u64) {
        let mut reference = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(seed);

        for step in 0..steps {
            let op = rng.gen_range(0..1000);
            let k1 = rng.gen_range(0..key_space);
            let k2 = rng.gen_range(0..key_space);

            if op < 1 {
                map.clear().unwrap();
                reference.clear();
            } else if op < 101 {
                assert_eq!(map.len(), reference.len() as u64, "step {}", step);
            } else if op < 110 {
                let (low, high) = (k1.min(k2), k1.max(k2));
                let expected = reference.range(low..=high).count() as u64;
                reference.retain(|key, _| *key < low || *key > high);
                assert_eq!(map.erase_range(low..=high).unwrap(), expected, "step {}", step);
            } else if op < 200 {
                assert_eq!(map.erase(&k1).unwrap(), reference.remove(&k1).is_some(), "step {}", step);
            } else if op < 300 {
                let found = reference.range(k1..).next().map(|(key, _)| *key);
                if let Some(key) = found {
                    reference.remove(&key);
                    assert!(map.erase(&key).unwrap());
                }
            } else if op < 400 {
                let inserted = !reference.contains_key(&k1);
                reference.entry(k1).or_insert(2 * k1);
                assert_eq!(map.insert(k1, 2 * k1).unwrap(), inserted, "step {}", step);
            } else if op < 500 {
                let (low, high) = (k1.min(k2), (k1.max(k2)).min(k1.min(k2) + 100));
                let entries: Vec<(u64, u64)> = (low..high).map(|key| (key, 2 * key)).collect();
                for (key, value) in &entries {
                    reference.entry(*key).or_insert(*value);
                }
                map.insert_bulk(entries).unwrap();
            } else if op < 600 {
                let expected = reference.range(k1..).next().map(|(k, v)| (*k, *v));
                assert_eq!(map.lower_bound(&k1).unwrap(), expected, "step {}", step);
            } else if op < 800 {
                let expected = reference
                    .range((Bound::Excluded(k1), Bound::Unbounded))
                    .next()
                    .map(|(k, v)| (*k, *v));
                assert_eq!(map.upper_bound(&k1).unwrap(), expected, "step {}", step);
            } else if op < 900 {
                assert_eq!(map.find(&k1).unwrap(), reference.get(&k1).copied(), "step {}", step);
            } else {
                let expected: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
                assert_eq!(collect(map), expected, "step {}", step);
            }
        }

        map.tree.get_mut().check().unwrap();
        assert_eq!(collect(map), reference.into_iter().collect::<Vec<_>>());
    }

    #[rstest]
    fn test_random_operations(storage: Arc<StorageSubsystem>) {
        let mut map = small_map(&storage);
        run_against_reference(&mut map, 42, 10_000, 10_000);
        drop(map);
        assert_eq!(storage.allocated_bytes(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn map_matches_reference(seed in any::<u64>(), key_space in 10u64..2000) {
            let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
            let mut map = small_map(&storage);
            run_against_reference(&mut map, seed, 1500, key_space);
        }
    }
}

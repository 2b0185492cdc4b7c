//! On-disk layout of B+ tree nodes.
//!
//! Every node occupies one block:
//!
//! ```text
//! 0..4    magic
//! 4       kind (1 = leaf, 2 = inner)
//! 5       leaf has a successor
//! 8..12   entry count
//! 16..32  successor leaf bid
//! 32..    leaf:  count * (key, value)
//!         inner: child 0, then count * (key, child)
//! ```

use crate::block::{Bid, Record, BID_ENCODED_SIZE};
use crate::error::{Error, Result};

const MAGIC: u32 = 0x5845_4254;
const KIND_LEAF: u8 = 1;
const KIND_INNER: u8 = 2;

pub(crate) const HEADER_SIZE: usize = 32;

/// Entries a leaf block holds.
pub(crate) fn leaf_capacity<K: Record, V: Record>(block_size: usize) -> usize {
    block_size.saturating_sub(HEADER_SIZE) / (K::SIZE + V::SIZE).max(1)
}

/// Separator keys an inner block holds.
pub(crate) fn node_capacity<K: Record>(block_size: usize) -> usize {
    block_size.saturating_sub(HEADER_SIZE + BID_ENCODED_SIZE) / (K::SIZE + BID_ENCODED_SIZE)
}

/// Block image of a decoded node.
pub(crate) trait NodeCodec: Sized {
    fn encode(&self, out: &mut [u8]);

    fn decode(bytes: &[u8], bid: Bid) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Leaf<K, V> {
    /// Sorted by key, keys unique.
    pub entries: Vec<(K, V)>,
    pub next: Option<Bid>,
}

impl<K: Record + Ord, V: Record> Leaf<K, V> {
    pub fn new() -> Self {
        Leaf {
            entries: Vec::new(),
            next: None,
        }
    }

    /// Position of the first entry not less than `key`.
    pub fn lower(&self, key: &K) -> usize {
        self.entries.partition_point(|(k, _)| k < key)
    }

    /// Position of the first entry greater than `key`.
    pub fn upper(&self, key: &K) -> usize {
        self.entries.partition_point(|(k, _)| k <= key)
    }

    pub fn find(&self, key: &K) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }
}

/// Inner node. Child `i` holds the keys `k` with `keys[i - 1] <= k < keys[i]`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Inner<K> {
    pub keys: Vec<K>,
    pub children: Vec<Bid>,
}

impl<K: Record + Ord> Inner<K> {
    pub fn child_index(&self, key: &K) -> usize {
        self.keys.partition_point(|separator| separator <= key)
    }
}

fn write_header(out: &mut [u8], kind: u8, count: usize, next: Option<Bid>) {
    out[..HEADER_SIZE].fill(0);
    out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    out[4] = kind;
    out[8..12].copy_from_slice(&(count as u32).to_le_bytes());
    if let Some(next) = next {
        out[5] = 1;
        next.encode(&mut out[16..32]);
    }
}

fn read_header(bytes: &[u8], bid: Bid, kind: u8) -> Result<(usize, Option<Bid>)> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[0..4]);
    if u32::from_le_bytes(raw) != MAGIC || bytes[4] != kind {
        return Err(Error::logic(format!("corrupt tree node at {}", bid)));
    }

    raw.copy_from_slice(&bytes[8..12]);
    let count = u32::from_le_bytes(raw) as usize;
    let next = match bytes[5] {
        0 => None,
        _ => Some(Bid::decode(&bytes[16..32])),
    };
    return Ok((count, next));
}

impl<K: Record, V: Record> NodeCodec for Leaf<K, V> {
    fn encode(&self, out: &mut [u8]) {
        write_header(out, KIND_LEAF, self.entries.len(), self.next);
        let width = K::SIZE + V::SIZE;
        for (idx, (key, value)) in self.entries.iter().enumerate() {
            let at = HEADER_SIZE + idx * width;
            key.write_to(&mut out[at..at + K::SIZE]);
            value.write_to(&mut out[at + K::SIZE..at + width]);
        }
    }

    fn decode(bytes: &[u8], bid: Bid) -> Result<Self> {
        let (count, next) = read_header(bytes, bid, KIND_LEAF)?;
        let width = K::SIZE + V::SIZE;
        if HEADER_SIZE + count * width > bytes.len() {
            return Err(Error::logic(format!("leaf at {} claims {} entries", bid, count)));
        }

        let entries = (0..count)
            .map(|idx| {
                let at = HEADER_SIZE + idx * width;
                (K::read_from(&bytes[at..]), V::read_from(&bytes[at + K::SIZE..]))
            })
            .collect();
        return Ok(Leaf { entries, next });
    }
}

impl<K: Record> NodeCodec for Inner<K> {
    fn encode(&self, out: &mut [u8]) {
        write_header(out, KIND_INNER, self.keys.len(), None);
        let mut at = HEADER_SIZE;
        if let Some(first) = self.children.first() {
            first.encode(&mut out[at..at + BID_ENCODED_SIZE]);
            at += BID_ENCODED_SIZE;
        }
        for (key, child) in self.keys.iter().zip(self.children.iter().skip(1)) {
            key.write_to(&mut out[at..at + K::SIZE]);
            at += K::SIZE;
            child.encode(&mut out[at..at + BID_ENCODED_SIZE]);
            at += BID_ENCODED_SIZE;
        }
    }

    fn decode(bytes: &[u8], bid: Bid) -> Result<Self> {
        let (count, _) = read_header(bytes, bid, KIND_INNER)?;
        if HEADER_SIZE + BID_ENCODED_SIZE + count * (K::SIZE + BID_ENCODED_SIZE) > bytes.len() {
            return Err(Error::logic(format!("inner node at {} claims {} keys", bid, count)));
        }

        let mut at = HEADER_SIZE;
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        children.push(Bid::decode(&bytes[at..]));
        at += BID_ENCODED_SIZE;
        for _ in 0..count {
            keys.push(K::read_from(&bytes[at..]));
            at += K::SIZE;
            children.push(Bid::decode(&bytes[at..]));
            at += BID_ENCODED_SIZE;
        }
        return Ok(Inner { keys, children });
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{leaf_capacity, node_capacity, Inner, Leaf, NodeCodec};
    use crate::block::{Bid, PAGE_SIZE};

    #[rstest]
    #[case(PAGE_SIZE, 254, 168)]
    #[case(4 * PAGE_SIZE, 1022, 680)]
    fn test_capacities(#[case] block_size: usize, #[case] leaves: usize, #[case] nodes: usize) {
        assert_eq!(leaf_capacity::<u64, u64>(block_size), leaves);
        assert_eq!(node_capacity::<u64>(block_size), nodes);
    }

    #[test]
    fn test_leaf_codec() {
        let leaf = Leaf {
            entries: vec![(1u64, 10u32), (5, 50), (9, 90)],
            next: Some(Bid::new(1, 8192, PAGE_SIZE)),
        };
        let mut block = vec![0xffu8; PAGE_SIZE];
        leaf.encode(&mut block);

        let decoded: Leaf<u64, u32> = Leaf::decode(&block, Bid::new(0, 0, PAGE_SIZE)).unwrap();
        assert_eq!(decoded, leaf);
        assert_eq!(decoded.lower(&5), 1);
        assert_eq!(decoded.upper(&5), 2);
        assert_eq!(decoded.find(&6), Err(2));
    }

    #[test]
    fn test_inner_codec() {
        let node = Inner {
            keys: vec![10i32, 20],
            children: vec![
                Bid::new(0, 0, PAGE_SIZE),
                Bid::new(1, 4096, PAGE_SIZE),
                Bid::new(2, 1 << 33, PAGE_SIZE),
            ],
        };
        let mut block = vec![0u8; PAGE_SIZE];
        node.encode(&mut block);

        let decoded: Inner<i32> = Inner::decode(&block, Bid::new(0, 0, PAGE_SIZE)).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.child_index(&9), 0);
        assert_eq!(decoded.child_index(&10), 1);
        assert_eq!(decoded.child_index(&25), 2);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "invariant violated"))]
    fn test_corrupt_magic() {
        let block = vec![0u8; PAGE_SIZE];
        assert!(Leaf::<u64, u64>::decode(&block, Bid::new(0, 0, PAGE_SIZE)).is_err());
    }
}

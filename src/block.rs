//! Block identifiers, fixed-width records and typed blocks.

use std::fmt;

use crate::buffer::AlignedBuffer;
use crate::error::{Error, Result};

/// Device page size. Block sizes, extent offsets and buffers are multiples of it.
pub const PAGE_SIZE: usize = 4096;

/// Encoded width of a [`Bid`] inside on-disk structures.
pub const BID_ENCODED_SIZE: usize = 16;

/// Checks that `block_size` is a power of two and at least one page.
pub fn check_block_size(block_size: usize) -> Result<()> {
    if !block_size.is_power_of_two() || block_size < PAGE_SIZE {
        return Err(Error::BadParameter(format!(
            "block size {} must be a power of two not below {}",
            block_size, PAGE_SIZE
        )));
    }
    return Ok(());
}

/// Block identifier: one block of `size` bytes at byte `offset` of disk `disk`.
///
/// Ordering exists for bookkeeping only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bid {
    pub disk: usize,
    pub offset: u64,
    pub size: usize,
}

impl Bid {
    pub fn new(disk: usize, offset: u64, size: usize) -> Self {
        Bid { disk, offset, size }
    }

    pub(crate) fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&(self.disk as u32).to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&(self.size as u32).to_le_bytes());
    }

    pub(crate) fn decode(bytes: &[u8]) -> Self {
        let mut disk = [0u8; 4];
        let mut offset = [0u8; 8];
        let mut size = [0u8; 4];
        disk.copy_from_slice(&bytes[0..4]);
        offset.copy_from_slice(&bytes[4..12]);
        size.copy_from_slice(&bytes[12..16]);

        Bid {
            disk: u32::from_le_bytes(disk) as usize,
            offset: u64::from_le_bytes(offset),
            size: u32::from_le_bytes(size) as usize,
        }
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bid(disk {}, offset {}, size {})", self.disk, self.offset, self.size)
    }
}

/// Fixed-width, trivially copyable record stored in blocks.
pub trait Record: Copy + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Writes the record into `out[..Self::SIZE]`.
    fn write_to(&self, out: &mut [u8]);

    /// Reads a record from `bytes[..Self::SIZE]`.
    fn read_from(bytes: &[u8]) -> Self;
}

macro_rules! impl_record_for_int {
    ($($ty:ty),*) => {
        $(
            impl Record for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_to(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_record_for_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl<const N: usize> Record for [u8; N] {
    const SIZE: usize = N;

    fn write_to(&self, out: &mut [u8]) {
        out[..N].copy_from_slice(self);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&bytes[..N]);
        raw
    }
}

impl<A: Record, B: Record> Record for (A, B) {
    const SIZE: usize = A::SIZE + B::SIZE;

    fn write_to(&self, out: &mut [u8]) {
        self.0.write_to(&mut out[..A::SIZE]);
        self.1.write_to(&mut out[A::SIZE..A::SIZE + B::SIZE]);
    }

    fn read_from(bytes: &[u8]) -> Self {
        (A::read_from(&bytes[..A::SIZE]), B::read_from(&bytes[A::SIZE..A::SIZE + B::SIZE]))
    }
}

/// Number of `T` records one block of `block_size` bytes holds.
pub fn records_per_block<T: Record>(block_size: usize) -> usize {
    if T::SIZE == 0 {
        0
    } else {
        block_size / T::SIZE
    }
}

/// A resident block viewed as an array of `T`.
pub struct TypedBlock<T: Record> {
    buffer: AlignedBuffer,
    capacity: usize,
    _record: std::marker::PhantomData<T>,
}

impl<T: Record> TypedBlock<T> {
    pub fn new(buffer: AlignedBuffer) -> Result<Self> {
        let capacity = records_per_block::<T>(buffer.len());
        if capacity == 0 {
            return Err(Error::BadParameter(format!(
                "record of {} bytes does not fit a {} byte block",
                T::SIZE,
                buffer.len()
            )));
        }

        return Ok(TypedBlock {
            buffer,
            capacity,
            _record: std::marker::PhantomData,
        });
    }

    /// Records per block.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, idx: usize) -> T {
        debug_assert!(idx < self.capacity);
        T::read_from(&self.buffer[idx * T::SIZE..])
    }

    pub fn set(&mut self, idx: usize, record: &T) {
        debug_assert!(idx < self.capacity);
        record.write_to(&mut self.buffer[idx * T::SIZE..(idx + 1) * T::SIZE]);
    }

    /// Copies `records` to the front of the block.
    pub fn fill_from(&mut self, records: &[T]) {
        for (idx, record) in records.iter().enumerate().take(self.capacity) {
            self.set(idx, record);
        }
    }

    /// Reads the first `count` records.
    pub fn to_vec(&self, count: usize) -> Vec<T> {
        (0..count.min(self.capacity)).map(|idx| self.get(idx)).collect()
    }

    pub fn into_buffer(self) -> AlignedBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{check_block_size, Bid, Record, TypedBlock, BID_ENCODED_SIZE, PAGE_SIZE};
    use crate::buffer::AlignedBuffer;

    #[rstest]
    #[case(PAGE_SIZE, true)]
    #[case(2 * 1024 * 1024, true)]
    #[case(3 * PAGE_SIZE, false)]
    #[case(512, false)]
    fn test_check_block_size(#[case] block_size: usize, #[case] valid: bool) {
        assert_eq!(check_block_size(block_size).is_ok(), valid);
    }

    #[test]
    fn test_bid_codec() {
        let bid = Bid::new(3, 1 << 40, 2 * 1024 * 1024);
        let mut raw = [0u8; BID_ENCODED_SIZE];
        bid.encode(&mut raw);
        assert_eq!(Bid::decode(&raw), bid);
    }

    #[test]
    fn test_pair_record_layout() {
        let mut raw = [0u8; 12];
        (7u32, -1i64).write_to(&mut raw);
        assert_eq!(&raw[..4], &7u32.to_le_bytes());
        assert_eq!(<(u32, i64)>::read_from(&raw), (7, -1));
    }

    #[test]
    fn test_typed_block() {
        let mut block: TypedBlock<u64> = TypedBlock::new(AlignedBuffer::new(PAGE_SIZE).unwrap()).unwrap();
        assert_eq!(block.capacity(), PAGE_SIZE / 8);

        block.fill_from(&[5, 4, 3]);
        block.set(511, &u64::MAX);
        assert_eq!(block.to_vec(3), vec![5, 4, 3]);
        assert_eq!(block.get(511), u64::MAX);
    }
}

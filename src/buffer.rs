//! Page-aligned block memory.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::block::PAGE_SIZE;
use crate::error::{Error, Result};

/// Heap buffer aligned to [`PAGE_SIZE`], suitable as the target of direct I/O.
///
/// Buffers move between the caller and the disk workers by value: a request owns its buffer
/// while in flight and hands it back once terminal.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer uniquely owns its allocation; shared access only yields `&[u8]`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates a zeroed buffer of `len` bytes. `len` must be a non-zero multiple of the page size.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(Error::BadParameter(format!(
                "buffer length {} is not a positive multiple of {}",
                len, PAGE_SIZE
            )));
        }
        let layout = Self::layout(len)?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        return Ok(AlignedBuffer { ptr, len });
    }

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, PAGE_SIZE).map_err(|err| Error::BadParameter(err.to_string()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zeroes the whole buffer.
    pub fn clear(&mut self) {
        self.fill(0);
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr points to `len` initialized bytes owned by self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr points to `len` initialized bytes uniquely owned by self.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: the layout was validated in `new` with the same length and alignment.
        unsafe {
            alloc::dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.len, PAGE_SIZE),
            )
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::AlignedBuffer;
    use crate::block::PAGE_SIZE;

    #[rstest]
    #[case(PAGE_SIZE)]
    #[case(4 * PAGE_SIZE)]
    fn test_aligned_buffer(#[case] len: usize) {
        let mut buffer = AlignedBuffer::new(len).unwrap();
        assert_eq!(buffer.len(), len);
        assert_eq!(buffer.as_ptr() as usize % PAGE_SIZE, 0);
        assert!(buffer.iter().all(|b| *b == 0));

        buffer[len - 1] = 7;
        assert_eq!(buffer[len - 1], 7);
        buffer.clear();
        assert_eq!(buffer[len - 1], 0);
    }

    #[rstest]
    #[case(0)]
    #[case(100)]
    #[case(PAGE_SIZE + 1)]
    fn test_aligned_buffer_rejects_bad_length(#[case] len: usize) {
        assert!(AlignedBuffer::new(len).is_err());
    }
}

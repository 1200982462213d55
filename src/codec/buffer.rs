//! Page-aligned data buffers for command data transfers.
//!
//! The kernel passthrough path maps user pages directly for DMA, so data
//! buffers are allocated on a 4 KiB boundary with a fixed capacity.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Alignment of every [`DataBuffer`] allocation.
pub const DATA_BUFFER_ALIGNMENT: usize = 4096;

/// Fixed-capacity, zero-initialized, 4 KiB aligned byte buffer.
pub struct DataBuffer {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: DataBuffer owns its memory exclusively and access is controlled via borrowing
unsafe impl Send for DataBuffer {}
unsafe impl Sync for DataBuffer {}

impl DataBuffer {
    /// Allocate a zeroed buffer of exactly `size` bytes.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "data buffer size must be greater than 0".into(),
            ));
        }

        let layout = Layout::from_size_align(size, DATA_BUFFER_ALIGNMENT)
            .map_err(|e| Error::InvalidArgument(format!("invalid buffer layout: {}", e)))?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| Self { ptr, size, layout })
            .ok_or_else(|| Error::Internal(format!("allocation of {} bytes failed", size)))
    }

    /// Allocate a buffer rounded up to a multiple of `block_size`.
    pub fn for_blocks(min_size: usize, block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "block size {} must be a power of 2",
                block_size
            )));
        }

        let rounded = (min_size + block_size - 1) & !(block_size - 1);
        Self::new(rounded)
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut buf = Self::new(data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Address handed to the kernel as the data pointer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes and zero-initialized at allocation
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes and we hold a unique borrow
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Copy of the contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for DataBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer")
            .field("len", &self.size)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl Deref for DataBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for DataBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for DataBuffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DataBuffer {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_aligned_and_zeroed() {
        let buf = DataBuffer::new(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_ptr() as usize % DATA_BUFFER_ALIGNMENT, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(DataBuffer::new(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_for_blocks_rounds_up() {
        let buf = DataBuffer::for_blocks(1000, 512).unwrap();
        assert_eq!(buf.len(), 1024);
        assert!(DataBuffer::for_blocks(1000, 500).is_err());
    }

    #[test]
    fn test_write_then_clear() {
        let mut buf = DataBuffer::from_slice(&[1, 2, 3, 4]).unwrap();
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
        buf[0] = 9;
        assert_eq!(buf.to_vec(), vec![9, 2, 3, 4]);
        buf.clear();
        assert!(buf.iter().all(|&b| b == 0));
    }
}

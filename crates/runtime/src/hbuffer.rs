//! Buffer cells
//!
//! Raw byte buffers visible to the host API. Fixed buffers keep their size
//! for life; dynamic buffers can be resized through the host allocator.
//! Buffer contents are zeroed on allocation and on the grown region of a
//! resize.

use crate::heaphdr::{HTYPE_BUFFER, HeapHdr};

pub struct HBuffer {
    pub hdr: HeapHdr,
    size: usize,
    dynamic: bool,
    data: *mut u8,
}

impl HBuffer {
    /// Wrap an allocated data block of `size` bytes (null iff size 0).
    /// Ownership of the block moves to the cell; the heap frees it when
    /// the cell dies.
    pub(crate) fn new(data: *mut u8, size: usize, dynamic: bool) -> Self {
        HBuffer {
            hdr: HeapHdr::new(HTYPE_BUFFER),
            size,
            dynamic,
            data,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        if self.size == 0 {
            &[]
        } else {
            // Safety: data/size per constructor contract.
            unsafe { std::slice::from_raw_parts(self.data, self.size) }
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.size == 0 {
            &mut []
        } else {
            // Safety: data/size per constructor contract; cell is uniquely
            // borrowed.
            unsafe { std::slice::from_raw_parts_mut(self.data, self.size) }
        }
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data
    }

    /// Install a new data block after a resize. Only valid for dynamic
    /// buffers; the previous block must already be owned by the caller.
    pub(crate) fn set_data(&mut self, data: *mut u8, size: usize) {
        debug_assert!(self.dynamic);
        self.data = data;
        self.size = size;
    }

    /// Take the data block out for freeing; the cell must be dropped
    /// right after.
    pub(crate) fn take_data(&mut self) -> *mut u8 {
        self.size = 0;
        std::mem::replace(&mut self.data, std::ptr::null_mut())
    }
}

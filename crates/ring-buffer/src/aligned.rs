//! Page aligned heap memory, suitable as a direct I/O buffer.

use crate::BufferError;
use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Alignment of every [`PageBuffer`]
pub const PAGE_SIZE: usize = 4096;

/// Zero initialised, page aligned byte buffer
pub struct PageBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl PageBuffer {
    /// Allocates `len` zeroed bytes on a page boundary.
    pub fn zeroed(len: usize) -> Result<Self, BufferError> {
        let layout = Self::layout(len)?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(BufferError::Allocation(len))?;
        Ok(Self { ptr, len })
    }

    fn layout(len: usize) -> Result<Layout, BufferError> {
        Layout::from_size_align(len.max(1), PAGE_SIZE).map_err(|_| BufferError::Allocation(len))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised bytes while self lives
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: allocated in zeroed() with this same layout
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer").field("len", &self.len).finish()
    }
}

// SAFETY: PageBuffer uniquely owns its allocation, like Vec<u8>
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

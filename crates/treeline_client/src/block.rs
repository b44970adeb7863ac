//! One native allocation holding a descriptor array followed by its element storage.

use crate::error::{ClientError, ClientResult};
use std::alloc::{self, Layout};
use std::mem;
use std::ptr::{self, NonNull};
use treeline_engine::BufferDesc;

/// A descriptor array and the storage its descriptors point at, allocated as one block.
///
/// Descriptors come first, then each element's bytes in order. Elements of
/// size zero get a null address. Every non-null descriptor address points
/// into this block; callers that repoint a slot elsewhere must not clone the
/// block while the slot is repointed.
pub(crate) struct DescBlock {
    base: NonNull<u8>,
    layout: Option<Layout>,
    count: usize,
}

// SAFETY: the block exclusively owns its allocation.
unsafe impl Send for DescBlock {}

impl DescBlock {
    /// Allocates zeroed descriptors with the given element capacities.
    pub fn new(sizes: &[u32]) -> ClientResult<Self> {
        let count = sizes.len();
        let desc_bytes = mem::size_of::<BufferDesc>()
            .checked_mul(count)
            .ok_or_else(|| ClientError::invalid_argument("descriptor block too large"))?;
        let data_bytes = sizes
            .iter()
            .try_fold(0usize, |acc, &s| acc.checked_add(s as usize))
            .ok_or_else(|| ClientError::invalid_argument("descriptor block too large"))?;
        let total = desc_bytes
            .checked_add(data_bytes)
            .ok_or_else(|| ClientError::invalid_argument("descriptor block too large"))?;

        if total == 0 {
            return Ok(Self {
                base: NonNull::<BufferDesc>::dangling().cast(),
                layout: None,
                count: 0,
            });
        }

        let layout = Layout::from_size_align(total, mem::align_of::<BufferDesc>())
            .map_err(|e| ClientError::invalid_argument(e.to_string()))?;
        // SAFETY: `total` is non-zero.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };

        let block = Self {
            base,
            layout: Some(layout),
            count,
        };
        let descs = block.base.cast::<BufferDesc>().as_ptr();
        let mut offset = desc_bytes;
        for (i, &size) in sizes.iter().enumerate() {
            let buf_addr = if size == 0 {
                ptr::null_mut()
            } else {
                // SAFETY: `offset + size <= total` by construction.
                unsafe { block.base.as_ptr().add(offset) }
            };
            // SAFETY: slot `i` lies inside the descriptor region.
            unsafe {
                descs.add(i).write(BufferDesc {
                    len_alloc: size,
                    len_used: 0,
                    buf_addr,
                });
            }
            offset += size as usize;
        }
        Ok(block)
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn descs(&self) -> &[BufferDesc] {
        // SAFETY: the first `count` slots are initialized descriptors.
        unsafe { std::slice::from_raw_parts(self.base.cast::<BufferDesc>().as_ptr(), self.count) }
    }

    pub fn descs_mut(&mut self) -> &mut [BufferDesc] {
        // SAFETY: as above, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.base.cast::<BufferDesc>().as_ptr(), self.count) }
    }

    fn contains(&self, addr: *mut u8) -> bool {
        let Some(layout) = self.layout else {
            return false;
        };
        let start = self.base.as_ptr() as usize;
        (start..start + layout.size()).contains(&(addr as usize))
    }
}

impl Clone for DescBlock {
    fn clone(&self) -> Self {
        let Some(layout) = self.layout else {
            return Self {
                base: self.base,
                layout: None,
                count: 0,
            };
        };
        // SAFETY: the layout is non-zero sized; it was allocated with it.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        // SAFETY: both regions are `layout.size()` bytes and distinct.
        unsafe { ptr::copy_nonoverlapping(self.base.as_ptr(), base.as_ptr(), layout.size()) };

        let mut copy = Self {
            base,
            layout: Some(layout),
            count: self.count,
        };
        let old = self.base.as_ptr() as usize;
        for desc in copy.descs_mut() {
            debug_assert!(desc.buf_addr.is_null() || self.contains(desc.buf_addr));
            if !desc.buf_addr.is_null() {
                let offset = desc.buf_addr as usize - old;
                // SAFETY: `offset` lies within the copied block.
                desc.buf_addr = unsafe { base.as_ptr().add(offset) };
            }
        }
        copy
    }
}

impl Drop for DescBlock {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `new` or `clone` with this layout.
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(desc: &mut BufferDesc, bytes: &[u8]) {
        assert!(bytes.len() <= desc.len_alloc as usize);
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), desc.buf_addr, bytes.len()) };
        desc.len_used = bytes.len() as u32;
    }

    fn read(desc: &BufferDesc) -> Vec<u8> {
        if desc.len_used == 0 {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(desc.buf_addr, desc.len_used as usize) }.to_vec()
    }

    #[test]
    fn layout_places_elements_after_descriptors() {
        let block = DescBlock::new(&[3, 0, 5]).unwrap();
        let descs = block.descs();
        assert_eq!(block.len(), 3);
        assert_eq!(descs[0].len_alloc, 3);
        assert!(descs[1].buf_addr.is_null());
        let gap = descs[2].buf_addr as usize - descs[0].buf_addr as usize;
        assert_eq!(gap, 3);
        assert!(block.contains(descs[2].buf_addr));
    }

    #[test]
    fn empty_block_has_no_allocation() {
        let block = DescBlock::new(&[]).unwrap();
        assert!(block.descs().is_empty());
        let copy = block.clone();
        assert_eq!(copy.len(), 0);
    }

    #[test]
    fn clone_rebases_pointers() {
        let mut block = DescBlock::new(&[4, 4]).unwrap();
        write(&mut block.descs_mut()[0], b"ab");
        write(&mut block.descs_mut()[1], b"wxyz");

        let mut copy = block.clone();
        assert!(copy.contains(copy.descs()[0].buf_addr));
        assert!(!block.contains(copy.descs()[1].buf_addr));
        assert_eq!(read(&copy.descs()[1]), b"wxyz");

        write(&mut copy.descs_mut()[0], b"zz");
        assert_eq!(read(&block.descs()[0]), b"ab");
    }
}

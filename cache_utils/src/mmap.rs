use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::errno::Errno;
use nix::sys::mman;

use crate::PAGE_LEN;

/* from linux kernel headers.
#define HUGETLB_FLAG_ENCODE_SHIFT       26
#define HUGETLB_FLAG_ENCODE_MASK        0x3f

#define HUGETLB_FLAG_ENCODE_64KB        (16 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_512KB       (19 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_1MB         (20 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_2MB         (21 << HUGETLB_FLAG_ENCODE_SHIFT)
*/

/// An anonymous private mapping, unmapped on drop.
#[derive(Debug)]
pub struct MMappedMemory {
    pointer: NonNull<u8>,
    size: usize,
}

// The mapping is plain memory owned by this value; sharing it is as safe as sharing a &[u8].
unsafe impl Send for MMappedMemory {}
unsafe impl Sync for MMappedMemory {}

impl MMappedMemory {
    /// Map `size` bytes of anonymous memory.
    ///
    /// `huge` requests hugetlbfs backing, `populate` asks the kernel to fault every page in.
    pub fn new(size: usize, huge: bool, populate: bool) -> Result<MMappedMemory, nix::Error> {
        let length = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
        let mut flags = mman::MapFlags::MAP_PRIVATE;
        if huge {
            flags |= mman::MapFlags::MAP_HUGETLB;
        }
        if populate {
            flags |= mman::MapFlags::MAP_POPULATE;
        }
        let p = unsafe {
            mman::mmap_anonymous(
                None,
                length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                flags,
            )
        }?;
        Ok(MMappedMemory {
            pointer: p.cast(),
            size,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.pointer.as_ptr()
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }

    /// Write one byte in every page so that each of them is backed by a frame.
    pub fn touch_pages(&mut self, value: u8) {
        for page in self.slice_mut().chunks_mut(PAGE_LEN) {
            page[0] = value;
        }
    }
}

impl Drop for MMappedMemory {
    fn drop(&mut self) {
        let p: NonNull<c_void> = self.pointer.cast();
        if let Err(e) = unsafe { mman::munmap(p, self.size) } {
            log::error!("munmap of {:p} ({} bytes) failed: {}", self.pointer, self.size, e);
        }
    }
}

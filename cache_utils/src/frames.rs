use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use thiserror::Error;

use crate::PAGE_SHIFT;

const PAGEMAP_ENTRY_LEN: u64 = 8;
const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to read the page map: {0}")]
    Io(#[from] std::io::Error),
    #[error("page at {0:#x} is not present in memory")]
    NotPresent(usize),
    #[error("frame number of {0:#x} is hidden (reading it requires CAP_SYS_ADMIN)")]
    Hidden(usize),
}

/// Translate a virtual address into the number of the frame backing it.
///
/// Implementations must be usable from several threads at once.
pub trait FrameTranslator: Send + Sync {
    fn frame_number(&self, addr: *const u8) -> Result<u64, FrameError>;
}

/// Frame numbers read from `/proc/self/pagemap`.
#[derive(Debug)]
pub struct Pagemap {
    file: File,
}

impl Pagemap {
    pub fn open() -> Result<Pagemap, FrameError> {
        Self::open_path("/proc/self/pagemap")
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Pagemap, FrameError> {
        Ok(Pagemap {
            file: File::open(path)?,
        })
    }
}

pub fn decode_pagemap_entry(addr: usize, entry: u64) -> Result<u64, FrameError> {
    if entry & PAGEMAP_PRESENT == 0 {
        return Err(FrameError::NotPresent(addr));
    }
    match entry & PAGEMAP_PFN_MASK {
        0 => Err(FrameError::Hidden(addr)),
        pfn => Ok(pfn),
    }
}

impl FrameTranslator for Pagemap {
    fn frame_number(&self, addr: *const u8) -> Result<u64, FrameError> {
        let addr = addr as usize;
        let mut entry = [0u8; PAGEMAP_ENTRY_LEN as usize];
        self.file
            .read_exact_at(&mut entry, (addr >> PAGE_SHIFT) as u64 * PAGEMAP_ENTRY_LEN)?;
        decode_pagemap_entry(addr, u64::from_ne_bytes(entry))
    }
}

/// Use the virtual page number as frame number.
///
/// Inside a naturally aligned huge page the low bits of both numbers agree, so this is exact
/// for power of two color counts up to the huge page size. Needs no privilege.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualFrames;

impl FrameTranslator for VirtualFrames {
    fn frame_number(&self, addr: *const u8) -> Result<u64, FrameError> {
        Ok((addr as usize >> PAGE_SHIFT) as u64)
    }
}

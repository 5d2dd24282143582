use cache_utils::mmap::MMappedMemory;
use log::{debug, info};
use nix::errno::Errno;

use crate::config::PoolConfig;
use crate::PrimeError;

/// Source of the pool's blocks.
pub trait BlockAllocator {
    /// Allocate block number `block`, at least `bytes` long and page aligned.
    fn allocate(&self, block: usize, bytes: usize) -> Result<MMappedMemory, nix::Error>;
}

/// Anonymous private mappings, optionally backed by huge pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapAllocator {
    pub hugetlb: bool,
    pub populate: bool,
}

impl BlockAllocator for MmapAllocator {
    fn allocate(&self, _block: usize, bytes: usize) -> Result<MMappedMemory, nix::Error> {
        let mut memory = MMappedMemory::new(bytes, self.hugetlb, self.populate)?;
        // Write to every page to ensure that the OS actually backs it.
        memory.touch_pages(0x01);
        Ok(memory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageHandle {
    block: u32,
    page: u32,
}

impl PageHandle {
    pub fn block(&self) -> usize {
        self.block as usize
    }

    pub fn page(&self) -> usize {
        self.page as usize
    }
}

#[derive(Debug)]
pub struct MemoryPool {
    blocks: Vec<MMappedMemory>,
    pages_per_block: usize,
    page_size: usize,
}

impl MemoryPool {
    /// Allocate every block, or none: blocks obtained before a failure are released.
    pub fn allocate<A: BlockAllocator + ?Sized>(
        config: &PoolConfig,
        page_size: usize,
        allocator: &A,
    ) -> Result<MemoryPool, PrimeError> {
        let pages_per_block = config.pages_per_block();
        let bytes = pages_per_block * page_size;
        let mut blocks = Vec::with_capacity(config.block_count);
        for block in 0..config.block_count {
            let memory = allocator
                .allocate(block, bytes)
                .and_then(|m| {
                    if m.len() < bytes || !cache_utils::is_page_aligned(m.as_ptr() as usize) {
                        Err(Errno::EINVAL)
                    } else {
                        Ok(m)
                    }
                })
                .map_err(|source| PrimeError::Allocation {
                    block,
                    bytes,
                    source,
                })?;
            debug!("block {} at {:p}, {} pages", block, memory.as_ptr(), pages_per_block);
            blocks.push(memory);
        }
        info!(
            "allocated {} blocks of {} pages ({} KiB)",
            blocks.len(),
            pages_per_block,
            blocks.len() * bytes >> 10
        );
        Ok(MemoryPool {
            blocks,
            pages_per_block,
            page_size,
        })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn pages_per_block(&self) -> usize {
        self.pages_per_block
    }

    pub fn page_count(&self) -> usize {
        self.blocks.len() * self.pages_per_block
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Every page of the pool, block by block, in address order within a block.
    pub fn pages(&self) -> impl Iterator<Item = PageHandle> + '_ {
        let pages_per_block = self.pages_per_block as u32;
        (0..self.blocks.len() as u32)
            .flat_map(move |block| (0..pages_per_block).map(move |page| PageHandle { block, page }))
    }

    pub fn page_ptr(&self, handle: PageHandle) -> *const u8 {
        self.line_ptr(handle, 0)
    }

    /// Address `offset` bytes into the page named by `handle`.
    pub fn line_ptr(&self, handle: PageHandle, offset: usize) -> *const u8 {
        assert!(handle.page() < self.pages_per_block && offset < self.page_size);
        let block = &self.blocks[handle.block()];
        // In bounds: the block spans pages_per_block whole pages.
        unsafe { block.as_ptr().add(handle.page() * self.page_size + offset) }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        info!("releasing {} blocks", self.blocks.len());
    }
}

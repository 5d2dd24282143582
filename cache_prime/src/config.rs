use cache_utils::PAGE_LEN;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::PrimeError;

pub const CACHE_SET_NR: usize = 30720;
pub const CACHE_WAY_NR: usize = 8;
pub const CACHE_LINE_SIZE: usize = 64;
pub const CACHE_SIZE: usize = CACHE_LINE_SIZE * CACHE_WAY_NR * CACHE_SET_NR;

pub const PAGE_COLOR: usize = CACHE_SET_NR * CACHE_LINE_SIZE / PAGE_LEN;
pub const BLOCK_NR: usize = 6;
pub const BLOCK_ORDER: u32 = 10;

pub const SCAN_NR: u32 = 2000;
pub const DEFAULT_DURATION_SECS: u64 = 10;
pub const TSC_KHZ: u64 = 2900048;
pub const WORKER_NR: usize = 4;

const_assert_eq!(CACHE_SET_NR, CACHE_SIZE / (CACHE_WAY_NR * CACHE_LINE_SIZE));
const_assert_eq!(PAGE_COLOR * PAGE_LEN, CACHE_SET_NR * CACHE_LINE_SIZE);
const_assert_eq!(PAGE_COLOR, 480);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    set_count: usize,
    ways: usize,
    line_size: usize,
    page_size: usize,
}

impl CacheGeometry {
    pub const DEFAULT: CacheGeometry = CacheGeometry {
        set_count: CACHE_SET_NR,
        ways: CACHE_WAY_NR,
        line_size: CACHE_LINE_SIZE,
        page_size: PAGE_LEN,
    };

    pub fn new(
        set_count: usize,
        ways: usize,
        line_size: usize,
        page_size: usize,
    ) -> Result<CacheGeometry, PrimeError> {
        if set_count == 0 || ways == 0 || line_size == 0 || page_size == 0 {
            return Err(PrimeError::Config(
                "cache geometry values must be non zero".to_string(),
            ));
        }
        if page_size % line_size != 0 {
            return Err(PrimeError::Config(format!(
                "page size {} is not a multiple of the line size {}",
                page_size, line_size
            )));
        }
        if (set_count * line_size) % page_size != 0 {
            return Err(PrimeError::Config(format!(
                "{} sets of {} byte lines do not span a whole number of {} byte pages",
                set_count, line_size, page_size
            )));
        }
        Ok(CacheGeometry {
            set_count,
            ways,
            line_size,
            page_size,
        })
    }

    /// Derive the set count from the total capacity, which must divide evenly.
    pub fn from_capacity(
        cache_size: usize,
        ways: usize,
        line_size: usize,
        page_size: usize,
    ) -> Result<CacheGeometry, PrimeError> {
        let way_bytes = ways * line_size;
        if way_bytes == 0 || cache_size % way_bytes != 0 {
            return Err(PrimeError::Config(format!(
                "cache size {} is not a multiple of {} ways of {} bytes",
                cache_size, ways, line_size
            )));
        }
        Self::new(cache_size / way_bytes, ways, line_size, page_size)
    }

    pub fn set_count(&self) -> usize {
        self.set_count
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cache_size(&self) -> usize {
        self.set_count * self.ways * self.line_size
    }

    pub fn lines_per_page(&self) -> usize {
        self.page_size / self.line_size
    }

    /// Number of page colors, i.e. of disjoint bands of `lines_per_page` sets.
    pub fn page_colors(&self) -> usize {
        self.set_count * self.line_size / self.page_size
    }

    /// Color of the pages holding cache set `set`, and the line of the page that maps to it.
    pub fn locate_set(&self, set: usize) -> (usize, usize) {
        let lines = self.lines_per_page();
        (set / lines, set % lines)
    }
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub block_count: usize,
    /// Each block holds `2^order` contiguous pages.
    pub order: u32,
}

impl PoolConfig {
    pub const DEFAULT: PoolConfig = PoolConfig {
        block_count: BLOCK_NR,
        order: BLOCK_ORDER,
    };

    pub fn pages_per_block(&self) -> usize {
        1 << self.order
    }

    pub fn total_pages(&self) -> usize {
        self.block_count * self.pages_per_block()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTiming {
    /// Full partition scans between two reads of the coarse clock.
    pub batch_iterations: u32,
    /// Timestamp counter frequency, only used to report cycle counts as time.
    pub tsc_khz: Option<u64>,
}

impl ScanTiming {
    pub const DEFAULT: ScanTiming = ScanTiming {
        batch_iterations: SCAN_NR,
        tsc_khz: Some(TSC_KHZ),
    };
}

impl Default for ScanTiming {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeConfig {
    pub geometry: CacheGeometry,
    pub pool: PoolConfig,
    pub timing: ScanTiming,
    pub workers: usize,
    pub default_duration_secs: u64,
}

impl PrimeConfig {
    pub const DEFAULT: PrimeConfig = PrimeConfig {
        geometry: CacheGeometry::DEFAULT,
        pool: PoolConfig::DEFAULT,
        timing: ScanTiming::DEFAULT,
        workers: WORKER_NR,
        default_duration_secs: DEFAULT_DURATION_SECS,
    };

    pub fn check(&self) -> Result<(), PrimeError> {
        // Catch geometries built by hand or deserialized.
        let g = &self.geometry;
        CacheGeometry::new(g.set_count, g.ways, g.line_size, g.page_size)?;
        if g.page_size != PAGE_LEN {
            return Err(PrimeError::Config(format!(
                "page size {} does not match the host page size {}",
                g.page_size, PAGE_LEN
            )));
        }
        if self.workers == 0 || self.workers > g.set_count {
            return Err(PrimeError::Config(format!(
                "{} workers cannot share {} sets",
                self.workers, g.set_count
            )));
        }
        if self.timing.batch_iterations == 0 {
            return Err(PrimeError::Config(
                "scan batches must contain at least one iteration".to_string(),
            ));
        }
        if self.pool.block_count == 0 || self.pool.order >= usize::BITS / 2 {
            return Err(PrimeError::Config(format!(
                "unusable pool of {} blocks of order {}",
                self.pool.block_count, self.pool.order
            )));
        }
        let needed = g.page_colors() * g.ways;
        if self.pool.total_pages() < needed {
            return Err(PrimeError::Config(format!(
                "a pool of {} pages can never fill {} colors of {} ways",
                self.pool.total_pages(),
                g.page_colors(),
                g.ways
            )));
        }
        Ok(())
    }
}

impl Default for PrimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

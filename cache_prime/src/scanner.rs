use core::marker::PhantomData;
use core::ops::Range;
use std::fmt;

use cache_utils::{maccess, rdtsc_fence};
use coarsetime::{Duration, Instant};
use log::{debug, trace};

use crate::config::ScanTiming;
use crate::eviction_set::ValidatedSet;
use crate::pool::MemoryPool;

/// The sets scanned by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPartition {
    worker: usize,
    sets: Range<usize>,
}

impl ScanPartition {
    /// Share of `worker` among `workers` of `0..set_count`, `None` for an unknown worker.
    pub fn new(worker: usize, workers: usize, set_count: usize) -> Option<ScanPartition> {
        if worker >= workers {
            return None;
        }
        let start = worker * set_count / workers;
        let end = (worker + 1) * set_count / workers;
        Some(ScanPartition {
            worker,
            sets: start..end,
        })
    }

    pub fn all(workers: usize, set_count: usize) -> impl Iterator<Item = ScanPartition> {
        (0..workers).filter_map(move |w| ScanPartition::new(w, workers, set_count))
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn sets(&self) -> Range<usize> {
        self.sets.clone()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanState {
    Idle = 0,
    Validating = 1,
    Scanning = 2,
    Failed = 3,
}

impl ScanState {
    pub fn from_u8(v: u8) -> ScanState {
        match v {
            0 => ScanState::Idle,
            1 => ScanState::Validating,
            2 => ScanState::Scanning,
            3 => ScanState::Failed,
            _ => unreachable!("scan state {}", v),
        }
    }
}

/// A raw timestamp counter value. Never interpreted by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimingSample(pub u64);

impl TimingSample {
    pub fn now() -> TimingSample {
        TimingSample(unsafe { rdtsc_fence() })
    }

    pub fn cycles_since(&self, earlier: TimingSample) -> TimingSample {
        TimingSample(self.0.wrapping_sub(earlier.0))
    }

    pub fn as_duration(&self, tsc_khz: u64) -> std::time::Duration {
        std::time::Duration::from_micros(self.0.saturating_mul(1000) / tsc_khz.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub partition: ScanPartition,
    pub batches: u64,
    pub cycles: TimingSample,
    pub elapsed: std::time::Duration,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} scanned sets {:?} {} batches in {:?} ({} cycles)",
            self.partition.worker,
            self.partition.sets,
            self.batches,
            self.elapsed,
            self.cycles.0
        )
    }
}

pub struct TimedScanner<'a> {
    // page base of every way of every color the partition touches, color major
    bases: Vec<*const u8>,
    first_color: usize,
    ways: usize,
    lines_per_page: usize,
    line_size: usize,
    partition: ScanPartition,
    timing: ScanTiming,
    _pool: PhantomData<&'a MemoryPool>,
}

impl<'a> TimedScanner<'a> {
    pub fn new(
        set: ValidatedSet<'a>,
        partition: ScanPartition,
        timing: ScanTiming,
    ) -> TimedScanner<'a> {
        let pool = set.pool();
        let set = set.eviction_set();
        let geometry = set.geometry();
        let lines_per_page = geometry.lines_per_page();
        let colors = if partition.is_empty() {
            0..0
        } else {
            let sets = partition.sets();
            sets.start / lines_per_page..(sets.end - 1) / lines_per_page + 1
        };
        let bases = colors
            .clone()
            .flat_map(|color| set.color_pages(color).iter())
            .map(|page| pool.page_ptr(*page))
            .collect();
        TimedScanner {
            bases,
            first_color: colors.start,
            ways: geometry.ways(),
            lines_per_page,
            line_size: geometry.line_size(),
            partition,
            timing,
            _pool: PhantomData,
        }
    }

    /// Number of page bases kept, one per way of each color spanned by the partition.
    pub fn base_count(&self) -> usize {
        self.bases.len()
    }

    pub fn line_count(&self) -> usize {
        self.partition.len() * self.ways
    }

    /// Every scanned address, in set order.
    pub fn lines(&self) -> impl Iterator<Item = *const u8> + '_ {
        self.partition.sets().flat_map(move |set| {
            let row = (set / self.lines_per_page - self.first_color) * self.ways;
            let offset = (set % self.lines_per_page) * self.line_size;
            self.bases[row..row + self.ways]
                .iter()
                // the offset stays inside the page
                .map(move |base| unsafe { base.add(offset) })
        })
    }

    /// Load every line once.
    #[inline(never)]
    pub fn scan_once(&self) {
        for line in self.lines() {
            // lines come from a pool that outlives 'a, and are 8 byte aligned
            unsafe { maccess(line as *const u64) };
        }
    }

    // Busy waits. The coarse clock is read once per batch, so the duration
    // may be exceeded by up to one batch.
    pub fn run(&self, duration: Duration) -> ScanSummary {
        trace!("worker {}: {:?}", self.partition.worker, ScanState::Scanning);
        let start = Instant::now();
        let tsc_start = TimingSample::now();
        let mut batches = 0u64;
        while start.elapsed() < duration {
            for _ in 0..self.timing.batch_iterations {
                self.scan_once();
            }
            batches += 1;
        }
        let cycles = TimingSample::now().cycles_since(tsc_start);
        let elapsed: std::time::Duration = start.elapsed().into();
        if let Some(khz) = self.timing.tsc_khz {
            debug!(
                "worker {}: {} cycles, about {:?} at {} kHz",
                self.partition.worker,
                cycles.0,
                cycles.as_duration(khz),
                khz
            );
        }
        trace!("worker {}: {:?}", self.partition.worker, ScanState::Idle);
        ScanSummary {
            partition: self.partition.clone(),
            batches,
            cycles,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ColorClassifier;
    use crate::config::{CacheGeometry, PoolConfig};
    use crate::eviction_set::EvictionSet;
    use crate::pool::MmapAllocator;
    use cache_utils::frames::VirtualFrames;
    use cache_utils::PAGE_LEN;
    use pretty_assertions::assert_eq;

    #[test]
    fn partitions_tile_the_sets() {
        for (workers, sets) in [(4, 30720), (3, 1024), (7, 100), (1, 64)] {
            let parts: Vec<_> = ScanPartition::all(workers, sets).collect();
            assert_eq!(parts.len(), workers);
            assert_eq!(parts[0].sets().start, 0);
            assert_eq!(parts[workers - 1].sets().end, sets);
            for pair in parts.windows(2) {
                assert_eq!(pair[0].sets().end, pair[1].sets().start);
            }
        }
        assert_eq!(ScanPartition::new(1, 4, 30720).unwrap().sets(), 7680..15360);
        assert!(ScanPartition::new(4, 4, 30720).is_none());
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ScanState::Idle,
            ScanState::Validating,
            ScanState::Scanning,
            ScanState::Failed,
        ] {
            assert_eq!(ScanState::from_u8(state as u8), state);
        }
    }

    #[test]
    #[should_panic]
    fn unknown_state_is_a_bug() {
        ScanState::from_u8(4);
    }

    #[test]
    fn keeps_one_base_per_way_and_color() {
        // 64 lines per page: sets 512..1024 span colors 8..16
        let g = CacheGeometry::new(1024, 4, 64, PAGE_LEN).unwrap();
        let c = ColorClassifier::new(&g);
        let config = PoolConfig {
            block_count: 2,
            order: 5,
        };
        let pool = MemoryPool::allocate(&config, PAGE_LEN, &MmapAllocator::default()).unwrap();
        let set = EvictionSet::build(&g, &c, &pool, &VirtualFrames).unwrap();
        let timing = ScanTiming {
            batch_iterations: 1,
            tsc_khz: None,
        };

        let validated = set.validate(&c, &pool, &VirtualFrames).unwrap();
        let half = ScanPartition::new(1, 2, 1024).unwrap();
        let scanner = TimedScanner::new(validated, half, timing);
        assert_eq!(scanner.base_count(), 8 * 4);
        assert_eq!(scanner.line_count(), 512 * 4);

        // a partition that starts and ends mid-page
        let partition = ScanPartition::new(1, 3, 1024).unwrap();
        assert_eq!(partition.sets(), 341..682);
        let expected: Vec<_> = partition
            .sets()
            .flat_map(|s| set.set_lines(&pool, s))
            .collect();
        let validated = set.validate(&c, &pool, &VirtualFrames).unwrap();
        let scanner = TimedScanner::new(validated, partition, timing);
        assert_eq!(scanner.base_count(), (10 - 5 + 1) * 4);
        assert_eq!(scanner.lines().collect::<Vec<_>>(), expected);
        scanner.scan_once();
    }

    #[test]
    fn tsc_conversion() {
        assert_eq!(
            TimingSample(2_000_000).as_duration(1_000_000),
            std::time::Duration::from_millis(2)
        );
        assert_eq!(TimingSample(5).cycles_since(TimingSample(7)).0, u64::MAX - 1);
    }

    #[test]
    fn scanner_covers_partition_and_stops() {
        let g = CacheGeometry::new(1024, 4, 64, PAGE_LEN).unwrap();
        let c = ColorClassifier::new(&g);
        let config = PoolConfig {
            block_count: 2,
            order: 5,
        };
        let pool = MemoryPool::allocate(&config, PAGE_LEN, &MmapAllocator::default()).unwrap();
        let set = EvictionSet::build(&g, &c, &pool, &VirtualFrames).unwrap();
        let validated = set.validate(&c, &pool, &VirtualFrames).unwrap();
        let partition = ScanPartition::new(1, 2, g.set_count()).unwrap();
        let timing = ScanTiming {
            batch_iterations: 4,
            tsc_khz: None,
        };
        let expected: Vec<_> = partition
            .sets()
            .flat_map(|s| set.set_lines(&pool, s))
            .collect();
        let scanner = TimedScanner::new(validated, partition.clone(), timing);
        assert_eq!(scanner.line_count(), 512 * 4);
        assert_eq!(scanner.lines().collect::<Vec<_>>(), expected);

        let wall = std::time::Instant::now();
        let summary = scanner.run(Duration::from_millis(200));
        assert!(wall.elapsed() >= std::time::Duration::from_millis(180));
        assert_eq!(summary.partition, partition);
        assert!(summary.batches > 0);
        assert!(summary.cycles.0 > 0);
    }
}

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cache_prime::{
    BlockAllocator, CacheGeometry, ControlSurface, MmapAllocator, PoolConfig, PrimeConfig,
    PrimeError, ScanState, ScanTiming,
};
use cache_utils::frames::{FrameError, FrameTranslator, VirtualFrames};
use cache_utils::mmap::MMappedMemory;
use cache_utils::PAGE_LEN;
use pretty_assertions::assert_eq;
use rstest::rstest;

// One scheduler tick at HZ=100, plus slack for the coarse clock.
const TICK: Duration = Duration::from_millis(20);

fn small_config(workers: usize) -> PrimeConfig {
    PrimeConfig {
        geometry: CacheGeometry::new(2048, 4, 64, PAGE_LEN).unwrap(),
        pool: PoolConfig {
            block_count: 4,
            order: 6,
        },
        timing: ScanTiming {
            batch_iterations: 16,
            tsc_khz: None,
        },
        workers,
        default_duration_secs: 1,
    }
}

fn initialized<T: FrameTranslator>(config: PrimeConfig, translator: T) -> ControlSurface<T> {
    let surface = ControlSurface::new(config);
    surface
        .initialize(&MmapAllocator::default(), translator)
        .unwrap();
    surface
}

/// Virtual frame numbers, with an optional override for one page.
#[derive(Clone, Default)]
struct Relocating {
    moved: Arc<Mutex<Option<(usize, u64)>>>,
}

impl FrameTranslator for Relocating {
    fn frame_number(&self, addr: *const u8) -> Result<u64, FrameError> {
        let page = addr as usize & !(PAGE_LEN - 1);
        match *self.moved.lock().unwrap() {
            Some((p, frame)) if p == page => Ok(frame),
            _ => VirtualFrames.frame_number(addr),
        }
    }
}

struct NoMemory;

impl BlockAllocator for NoMemory {
    fn allocate(&self, _block: usize, _bytes: usize) -> Result<MMappedMemory, nix::Error> {
        Err(nix::Error::ENOMEM)
    }
}

#[test]
fn full_size_cache() {
    let config = PrimeConfig {
        timing: ScanTiming {
            batch_iterations: 1,
            tsc_khz: Some(2900048),
        },
        ..PrimeConfig::DEFAULT
    };
    let surface = initialized(config, VirtualFrames);

    surface
        .with_context(|context| {
            let set = context.eviction_set();
            assert_eq!(set.colors(), 480);
            for s in 0..30720 {
                assert_eq!(set.set_len(s), 8);
            }
            assert!(context.validate());
        })
        .unwrap();

    let start = Instant::now();
    let summary = surface.prime(1, 0).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed + TICK >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(summary.partition.sets(), 0..7680);
    assert!(summary.batches > 0);

    surface.teardown().unwrap();
    assert!(matches!(surface.prime(1, 0), Err(PrimeError::NotInitialized)));
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(5)]
fn prime_lasts_at_least_the_duration(#[case] seconds: u64) {
    let surface = initialized(small_config(2), VirtualFrames);
    let start = Instant::now();
    surface.prime(seconds as i64, 1).unwrap();
    assert!(start.elapsed() + TICK >= Duration::from_secs(seconds));
    surface.teardown().unwrap();
}

#[rstest]
#[case(-1)]
#[case(4)]
#[case(i64::MAX)]
fn out_of_range_worker_is_rejected_immediately(#[case] worker: i64) {
    let surface = initialized(small_config(4), VirtualFrames);
    let start = Instant::now();
    let result = surface.prime(5, worker);
    assert!(start.elapsed() < Duration::from_millis(100));
    match result {
        Err(PrimeError::InvalidWorkerId { worker: w, workers }) => {
            assert_eq!((w, workers), (worker, 4));
        }
        other => panic!("unexpected {:?}", other),
    }
    for w in 0..4 {
        assert_eq!(
            surface.with_context(|c| c.worker_state(w)),
            Some(Some(ScanState::Idle))
        );
    }
}

#[test]
fn concurrent_workers_share_a_read_only_set() {
    let surface = initialized(small_config(2), VirtualFrames);
    let before = surface.with_context(|c| c.eviction_set().clone()).unwrap();

    let summaries: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|w| {
                let surface = &surface;
                s.spawn(move || surface.prime(1, w).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(summaries[0].partition.sets(), 0..1024);
    assert_eq!(summaries[1].partition.sets(), 1024..2048);
    let after = surface.with_context(|c| c.eviction_set().clone()).unwrap();
    assert_eq!(before, after);
    assert!(surface.with_context(|c| c.validate()).unwrap());
}

#[test]
fn teardown_waits_for_running_scan() {
    let surface = initialized(small_config(2), VirtualFrames);

    let summary = thread::scope(|s| {
        let start = Instant::now();
        let worker = s.spawn(|| surface.prime(2, 0));
        while surface.with_context(|c| c.worker_state(0)) != Some(Some(ScanState::Scanning)) {
            assert!(start.elapsed() < Duration::from_secs(1), "scan never started");
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(100));
        surface.teardown().unwrap();
        // the write lock is only granted once the scan has released its read lock
        assert!(start.elapsed() >= Duration::from_secs(2) - TICK);
        worker.join().unwrap()
    });

    assert_eq!(summary.unwrap().partition.sets(), 0..1024);
    assert!(!surface.is_initialized());
}

#[test]
fn relocated_page_fails_prime_without_scanning() {
    let translator = Relocating::default();
    let surface = initialized(small_config(2), translator.clone());

    let page = surface
        .with_context(|c| c.pool().page_ptr(c.eviction_set().color_pages(5)[2]) as usize)
        .unwrap();
    let frame = VirtualFrames.frame_number(page as *const u8).unwrap();
    *translator.moved.lock().unwrap() = Some((page, frame + 3));

    let start = Instant::now();
    assert!(matches!(surface.prime(2, 0), Err(PrimeError::Validation)));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(
        surface.with_context(|c| c.worker_state(0)),
        Some(Some(ScanState::Failed))
    );
    // the module stays installed
    assert!(surface.is_initialized());

    *translator.moved.lock().unwrap() = None;
    surface.prime(1, 0).unwrap();
    assert_eq!(
        surface.with_context(|c| c.worker_state(0)),
        Some(Some(ScanState::Idle))
    );
}

#[test]
fn allocation_failure_leaves_nothing_installed() {
    let surface: ControlSurface<VirtualFrames> = ControlSurface::new(small_config(2));
    match surface.initialize(&NoMemory, VirtualFrames) {
        Err(PrimeError::Allocation { block, source, .. }) => {
            assert_eq!(block, 0);
            assert_eq!(source, nix::Error::ENOMEM);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!surface.is_initialized());
    assert!(matches!(surface.prime(1, 0), Err(PrimeError::NotInitialized)));
}

#[test]
fn classification_is_a_function_of_the_frame() {
    let surface = initialized(small_config(2), VirtualFrames);
    surface
        .with_context(|c| {
            let pool = c.pool();
            let first: Vec<usize> = pool
                .pages()
                .map(|p| c.classifier().classify(c.translator(), pool.page_ptr(p)).unwrap())
                .collect();
            let second: Vec<usize> = pool
                .pages()
                .map(|p| c.classifier().classify(c.translator(), pool.page_ptr(p)).unwrap())
                .collect();
            assert_eq!(first.len(), pool.page_count());
            assert_eq!(first, second);
        })
        .unwrap();
}

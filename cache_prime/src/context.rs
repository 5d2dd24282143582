use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};

use cache_utils::affinity::{nth_available_cpu, restore_affinity, set_affinity};
use cache_utils::frames::FrameTranslator;
use coarsetime::Duration;
use log::{debug, error, info, warn};

use crate::classifier::ColorClassifier;
use crate::config::PrimeConfig;
use crate::eviction_set::EvictionSet;
use crate::pool::{BlockAllocator, MemoryPool};
use crate::scanner::{ScanPartition, ScanState, ScanSummary, TimedScanner};
use crate::PrimeError;

/// The pool, the eviction set built on it, and everything needed to check and scan it.
///
/// The eviction set is read only once built, so `prime` only needs `&self` and may run on
/// several threads at once. `teardown` consumes the context, hence no scan can outlive it.
#[derive(Debug)]
pub struct PrimeContext<T: FrameTranslator> {
    config: PrimeConfig,
    classifier: ColorClassifier,
    eviction_set: EvictionSet,
    pool: MemoryPool,
    translator: T,
    states: Vec<AtomicU8>,
}

impl<T: FrameTranslator> PrimeContext<T> {
    pub fn initialize<A: BlockAllocator + ?Sized>(
        config: PrimeConfig,
        allocator: &A,
        translator: T,
    ) -> Result<PrimeContext<T>, PrimeError> {
        config.check()?;
        let geometry = config.geometry;
        info!(
            "initializing: {} sets x {} ways x {} bytes, {} colors, {} workers",
            geometry.set_count(),
            geometry.ways(),
            geometry.line_size(),
            geometry.page_colors(),
            config.workers
        );
        let classifier = ColorClassifier::new(&geometry);
        let pool = MemoryPool::allocate(&config.pool, geometry.page_size(), allocator)?;
        let eviction_set = EvictionSet::build(&geometry, &classifier, &pool, &translator)?;
        eviction_set.validate(&classifier, &pool, &translator)?;
        Ok(PrimeContext {
            config,
            classifier,
            eviction_set,
            pool,
            translator,
            states: (0..config.workers).map(|_| AtomicU8::new(ScanState::Idle as u8)).collect(),
        })
    }

    pub fn config(&self) -> &PrimeConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ColorClassifier {
        &self.classifier
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn eviction_set(&self) -> &EvictionSet {
        &self.eviction_set
    }

    pub fn translator(&self) -> &T {
        &self.translator
    }

    pub fn partition(&self, worker: usize) -> Option<ScanPartition> {
        ScanPartition::new(
            worker,
            self.config.workers,
            self.config.geometry.set_count(),
        )
    }

    pub fn worker_state(&self, worker: usize) -> Option<ScanState> {
        self.states
            .get(worker)
            .map(|s| ScanState::from_u8(s.load(Ordering::Acquire)))
    }

    pub fn validate(&self) -> bool {
        self.eviction_set
            .check(&self.classifier, &self.pool, &self.translator)
    }

    /// Pin the calling thread on the processor of `worker`, validate, then scan its partition
    /// for `duration_secs` seconds. The previous affinity is restored before returning.
    pub fn prime(&self, duration_secs: u64, worker: usize) -> Result<ScanSummary, PrimeError> {
        if duration_secs == 0 {
            return Err(PrimeError::InvalidDuration(0));
        }
        let partition = self
            .partition(worker)
            .ok_or(PrimeError::InvalidWorkerId {
                worker: worker as i64,
                workers: self.config.workers,
            })?;
        let cpu = nth_available_cpu(worker).map_err(PrimeError::Affinity)?;
        let old = set_affinity(cpu).map_err(PrimeError::Affinity)?;
        debug!(
            "worker {} pinned on cpu {}, sets {:?}",
            worker,
            cpu,
            partition.sets()
        );
        let result = self.validate_and_scan(partition, duration_secs);
        if let Err(e) = restore_affinity(&old) {
            warn!("worker {}: failed to restore affinity: {}", worker, e);
        }
        result
    }

    fn validate_and_scan(
        &self,
        partition: ScanPartition,
        duration_secs: u64,
    ) -> Result<ScanSummary, PrimeError> {
        let worker = partition.worker();
        self.set_state(worker, ScanState::Validating);
        let validated = match self
            .eviction_set
            .validate(&self.classifier, &self.pool, &self.translator)
        {
            Ok(validated) => validated,
            Err(e) => {
                self.set_state(worker, ScanState::Failed);
                error!("worker {}: cache initialization error: {}", worker, e);
                return Err(e);
            }
        };
        self.set_state(worker, ScanState::Scanning);
        let scanner = TimedScanner::new(validated, partition, self.config.timing);
        let summary = scanner.run(Duration::from_secs(duration_secs));
        self.set_state(worker, ScanState::Idle);
        debug!("{}", summary);
        Ok(summary)
    }

    fn set_state(&self, worker: usize, state: ScanState) {
        if let Some(s) = self.states.get(worker) {
            s.store(state as u8, Ordering::Release);
        }
    }

    pub fn teardown(self) {
        info!("tearing down");
        drop(self);
    }
}

/// The entry points handed to callers: `initialize`, `prime`, `teardown`.
///
/// `prime` holds a read lock for the whole scan; `teardown` takes the write lock, so it waits
/// for every scan in flight before the pool is released.
#[derive(Debug)]
pub struct ControlSurface<T: FrameTranslator> {
    config: PrimeConfig,
    context: RwLock<Option<PrimeContext<T>>>,
}

impl<T: FrameTranslator> ControlSurface<T> {
    pub fn new(config: PrimeConfig) -> ControlSurface<T> {
        ControlSurface {
            config,
            context: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &PrimeConfig {
        &self.config
    }

    pub fn initialize<A: BlockAllocator + ?Sized>(
        &self,
        allocator: &A,
        translator: T,
    ) -> Result<(), PrimeError> {
        let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
        if context.is_some() {
            return Err(PrimeError::AlreadyInitialized);
        }
        *context = Some(PrimeContext::initialize(self.config, allocator, translator)?);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `f` on the live context, if any.
    pub fn with_context<R>(&self, f: impl FnOnce(&PrimeContext<T>) -> R) -> Option<R> {
        let context = self.context.read().unwrap_or_else(PoisonError::into_inner);
        context.as_ref().map(f)
    }

    pub fn prime(&self, duration_secs: i64, worker_id: i64) -> Result<ScanSummary, PrimeError> {
        let workers = self.config.workers;
        let worker = usize::try_from(worker_id)
            .ok()
            .filter(|w| *w < workers)
            .ok_or(PrimeError::InvalidWorkerId {
                worker: worker_id,
                workers,
            })?;
        let duration = u64::try_from(duration_secs)
            .ok()
            .filter(|d| *d > 0)
            .ok_or(PrimeError::InvalidDuration(duration_secs))?;
        let context = self.context.read().unwrap_or_else(PoisonError::into_inner);
        match &*context {
            Some(context) => context.prime(duration, worker),
            None => Err(PrimeError::NotInitialized),
        }
    }

    pub fn teardown(&self) -> Result<(), PrimeError> {
        let mut context = self.context.write().unwrap_or_else(PoisonError::into_inner);
        match context.take() {
            Some(context) => {
                context.teardown();
                Ok(())
            }
            None => Err(PrimeError::NotInitialized),
        }
    }
}

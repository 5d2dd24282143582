#![deny(unsafe_op_in_unsafe_fn)]

pub mod classifier;
pub mod config;
pub mod context;
mod error;
pub mod eviction_set;
pub mod pool;
pub mod scanner;

pub use classifier::ColorClassifier;
pub use config::{CacheGeometry, PoolConfig, PrimeConfig, ScanTiming};
pub use context::{ControlSurface, PrimeContext};
pub use error::PrimeError;
pub use eviction_set::{EvictionSet, ValidatedSet};
pub use pool::{BlockAllocator, MemoryPool, MmapAllocator, PageHandle};
pub use scanner::{ScanPartition, ScanState, ScanSummary, TimedScanner, TimingSample};

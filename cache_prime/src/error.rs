use cache_utils::frames::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrimeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to allocate memory block {block} ({bytes} bytes): {source}")]
    Allocation {
        block: usize,
        bytes: usize,
        source: nix::Error,
    },
    #[error("frame translation failed: {0}")]
    Translation(#[from] FrameError),
    #[error("cache color {color} only received {filled} of {ways} pages, the pool is too small")]
    UnderfilledSet {
        color: usize,
        filled: usize,
        ways: usize,
    },
    #[error("eviction set no longer maps onto its cache sets")]
    Validation,
    #[error("worker id {worker} is out of range (0..{workers})")]
    InvalidWorkerId { worker: i64, workers: usize },
    #[error("duration must be a positive number of seconds, got {0}")]
    InvalidDuration(i64),
    #[error("failed to set processor affinity: {0}")]
    Affinity(nix::Error),
    #[error("cache prime is not initialized")]
    NotInitialized,
    #[error("cache prime is already initialized")]
    AlreadyInitialized,
}

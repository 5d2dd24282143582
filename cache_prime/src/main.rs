use std::process;
use std::thread;

use cache_prime::{ControlSurface, MmapAllocator, PrimeConfig, PrimeError};
use cache_utils::frames::{FrameTranslator, Pagemap, VirtualFrames};
use clap::{ArgAction, Parser};
use log::{error, info, Level};

/// Keep every set and way of the last level cache filled with our own lines.
#[derive(Parser, Debug)]
#[command(name = "cache_prime", version)]
struct Args {
    /// Seconds to prime for (defaults to the configured duration)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Worker to run, may be repeated; all workers run by default
    #[arg(short, long = "worker")]
    workers: Vec<usize>,

    /// Back the pool with huge pages
    #[arg(long)]
    hugepages: bool,

    /// Classify pages by virtual page number instead of reading /proc/self/pagemap
    #[arg(long)]
    virtual_frames: bool,

    /// Print the configuration as JSON and exit
    #[arg(long)]
    show_config: bool,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn run<T: FrameTranslator>(
    args: &Args,
    config: PrimeConfig,
    translator: T,
) -> Result<(), PrimeError> {
    let surface = ControlSurface::new(config);
    let allocator = MmapAllocator {
        hugetlb: args.hugepages,
        populate: true,
    };
    surface.initialize(&allocator, translator)?;

    let duration = args.duration.unwrap_or(config.default_duration_secs);
    let duration = i64::try_from(duration).unwrap_or(i64::MAX);
    let workers: Vec<usize> = if args.workers.is_empty() {
        (0..config.workers).collect()
    } else {
        args.workers.clone()
    };

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter()
            .map(|&worker| {
                let surface = &surface;
                let worker_id = i64::try_from(worker).unwrap_or(i64::MAX);
                s.spawn(move || (worker, surface.prime(duration, worker_id)))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    let mut failure = None;
    for result in results {
        match result {
            Ok((_, Ok(summary))) => info!("{}", summary),
            Ok((worker, Err(e))) => {
                error!("worker {}: {}", worker, e);
                failure = Some(e);
            }
            Err(_) => error!("a worker thread panicked"),
        }
    }
    surface.teardown()?;
    failure.map_or(Ok(()), Err)
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::Warn,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    simple_logger::SimpleLogger::new()
        .with_level(level.to_level_filter())
        .init()
        .unwrap();

    let config = PrimeConfig::DEFAULT;
    if args.show_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("cannot serialize configuration: {}", e),
        }
        return;
    }

    let result = if args.virtual_frames {
        run(&args, config, VirtualFrames)
    } else {
        match Pagemap::open() {
            Ok(pagemap) => run(&args, config, pagemap),
            Err(e) => Err(PrimeError::Translation(e)),
        }
    };
    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

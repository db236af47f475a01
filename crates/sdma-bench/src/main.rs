#![forbid(unsafe_code)]

//! Drive an SDMA queue against the software engine from several threads and
//! report submission throughput.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use sdma_blit::{
    AddressSpace, BlitConfig, HostRegion, MemoryAllocator, MemoryKind, MemorySignal, SdmaBlit,
    SdmaGeneration, SdmaV2, SdmaV4, SdmaV5, SystemAllocator,
};
use sdma_sim::SimulatedSdma;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Generation {
    V2,
    V4,
    V5,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Each copy waits on its own fence.
    Blocking,
    /// Copies complete through a per-thread signal; threads wait once at the end.
    Async,
}

#[derive(Debug, Parser)]
#[command(about = "Multi-threaded SDMA submission benchmark on the simulated engine")]
struct Args {
    #[arg(long, value_enum, default_value_t = Generation::V5)]
    generation: Generation,

    /// Command ring size in bytes (power of two, at least 4096).
    #[arg(long, default_value_t = 64 * 1024)]
    ring_size: u64,

    #[arg(long, default_value_t = 4)]
    threads: u32,

    /// Bytes per copy (dword multiple).
    #[arg(long, default_value_t = 4096)]
    copy_size: u64,

    /// Copies per thread.
    #[arg(long, default_value_t = 1000)]
    iterations: u32,

    #[arg(long, value_enum, default_value_t = Mode::Blocking)]
    mode: Mode,

    /// Stamp start/end timestamps into async completion signals.
    #[arg(long)]
    profile: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.threads == 0 || args.copy_size == 0 || args.copy_size % 4 != 0 {
        bail!("--threads must be non-zero and --copy-size a non-zero multiple of 4");
    }
    match args.generation {
        Generation::V2 => run::<SdmaV2>(&args),
        Generation::V4 => run::<SdmaV4>(&args),
        Generation::V5 => run::<SdmaV5>(&args),
    }
}

fn run<G: SdmaGeneration>(args: &Args) -> Result<()> {
    let config = BlitConfig {
        ring_size: args.ring_size,
        profiling: args.profile,
        ..BlitConfig::from_env().context("reading SDMA environment overrides")?
    };

    let space = Arc::new(AddressSpace::new());
    let alloc = Arc::new(SystemAllocator::new(space.clone()));
    let sim = Arc::new(SimulatedSdma::<G>::new(space));
    let blit = SdmaBlit::<G>::initialize(config, alloc.clone(), sim.clone())
        .context("initializing SDMA queue")?;

    let span = args.copy_size * u64::from(args.threads);
    let src = alloc.allocate(span, MemoryKind::Plain)?;
    let dst = alloc.allocate(span, MemoryKind::Plain)?;

    let started = Instant::now();
    std::thread::scope(|s| -> Result<()> {
        let workers: Vec<_> = (0..args.threads)
            .map(|t| {
                let offset = u64::from(t) * args.copy_size;
                let (blit, alloc, src, dst) = (&blit, &alloc, &src, &dst);
                s.spawn(move || worker(args, blit, alloc, src, dst, offset))
            })
            .collect();
        for handle in workers {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("submission thread panicked"),
            }
        }
        Ok(())
    })?;
    let elapsed = started.elapsed();

    let copies = u64::from(args.threads) * u64::from(args.iterations);
    let bytes = copies * args.copy_size;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let stats = sim.stats(blit.queue().queue_id).unwrap_or_default();
    tracing::info!(
        generation = G::NAME,
        mode = ?args.mode,
        threads = args.threads,
        copies,
        elapsed_ms = elapsed.as_millis() as u64,
        copies_per_sec = (copies as f64 / secs) as u64,
        mib_per_sec = bytes as f64 / secs / (1024.0 * 1024.0),
        ring_bytes = blit.ring().committed_index(),
        doorbells = stats.doorbells,
        pending_bytes = blit.pending_bytes(),
        "benchmark finished"
    );
    println!(
        "{}: {copies} copies of {} bytes in {:.3}s ({:.1} MiB/s)",
        G::NAME,
        args.copy_size,
        secs,
        bytes as f64 / secs / (1024.0 * 1024.0)
    );

    blit.destroy().context("tearing down SDMA queue")?;
    Ok(())
}

fn worker<G: SdmaGeneration>(
    args: &Args,
    blit: &SdmaBlit<G>,
    alloc: &Arc<SystemAllocator>,
    src: &HostRegion,
    dst: &HostRegion,
    offset: u64,
) -> Result<()> {
    let (src, dst) = (src.device_addr() + offset, dst.device_addr() + offset);
    match args.mode {
        Mode::Blocking => {
            for _ in 0..args.iterations {
                blit.submit_copy_blocking(dst, src, args.copy_size)?;
            }
        }
        Mode::Async => {
            let allocator: Arc<dyn MemoryAllocator> = alloc.clone();
            let done = MemorySignal::new(allocator, i64::from(args.iterations))?;
            for _ in 0..args.iterations {
                blit.submit_copy_async(dst, src, args.copy_size, &[], &done)?;
            }
            done.wait_eq(0);
            if args.profile {
                tracing::debug!(
                    start = done.start_timestamp(),
                    end = done.end_timestamp(),
                    "last profiled copy"
                );
            }
        }
    }
    Ok(())
}

//! Randomised clone/fault/reclaim workload for exercising a shared context.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use cowvm::logging::init_logging;
use cowvm::{
    CloneMode, CounterMetrics, CreateOptions, EvictionPolicy, HeapAllocator, Reclaimer,
    SnapCompressor, VmContext, VmError, VmObject, VmOptions, PAGE_SIZE,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "cowvm-stress",
    version,
    about = "Drives random copy-on-write workloads against one context"
)]
struct Cli {
    #[arg(long, default_value_t = 4, help = "Worker threads, each with its own root object")]
    threads: usize,

    #[arg(long, default_value_t = 10_000, help = "Operations per worker")]
    iterations: u64,

    #[arg(long, default_value_t = 64, help = "Size of each root object in pages")]
    pages: u64,

    #[arg(long, default_value_t = 8, help = "Maximum live clones per worker")]
    max_clones: usize,

    #[arg(long, default_value_t = 0x5eed, help = "Base RNG seed")]
    seed: u64,

    #[arg(long, help = "Cap on resident pages across the context")]
    page_limit: Option<u64>,

    #[arg(long, value_enum, default_value_t = ModeArg::Modified, help = "Clone mode for new clones")]
    mode: ModeArg,

    #[arg(long, value_name = "FILE", help = "TOML file with engine options")]
    config: Option<PathBuf>,

    #[arg(long, env = "COWVM_LOG", default_value = "warn", help = "Tracing filter")]
    log: String,

    #[arg(long, help = "Verify every hierarchy after the run")]
    verify: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    OnWrite,
    Modified,
    Full,
}

impl From<ModeArg> for CloneMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::OnWrite => CloneMode::OnWrite,
            ModeArg::Modified => CloneMode::Modified,
            ModeArg::Full => CloneMode::Full,
        }
    }
}

#[derive(Default, Serialize)]
struct WorkerReport {
    writes: u64,
    reads: u64,
    clones: u64,
    drops: u64,
    reclaimed: u64,
    out_of_memory: u64,
    mismatches: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: &WorkerReport) {
        self.writes += other.writes;
        self.reads += other.reads;
        self.clones += other.clones;
        self.drops += other.drops;
        self.reclaimed += other.reclaimed;
        self.out_of_memory += other.out_of_memory;
        self.mismatches += other.mismatches;
    }
}

#[derive(Serialize)]
struct Summary {
    elapsed_ms: u128,
    workers: WorkerReport,
    metrics: cowvm::MetricsSnapshot,
    resident_pages: usize,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("cowvm-stress: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log);
    let options = match &cli.config {
        Some(path) => VmOptions::load(path)?,
        None => VmOptions::default(),
    };
    let allocator = match cli.page_limit {
        Some(limit) => HeapAllocator::with_limit(limit),
        None => HeapAllocator::new(),
    };
    let metrics = Arc::new(CounterMetrics::default());
    let ctx = VmContext::builder()
        .allocator(Arc::new(allocator))
        .compressor(Arc::new(SnapCompressor::new()))
        .metrics(metrics.clone())
        .options(options)
        .build();

    let started = Instant::now();
    let workers: Vec<_> = (0..cli.threads)
        .map(|index| {
            let ctx = ctx.clone();
            let seed = cli.seed.wrapping_add(index as u64);
            let (iterations, pages, max_clones) = (cli.iterations, cli.pages, cli.max_clones);
            let (mode, verify) = (CloneMode::from(cli.mode), cli.verify);
            thread::spawn(move || {
                let mut worker = Worker::new(ctx, seed, pages, max_clones, mode)?;
                worker.run(iterations)?;
                if verify {
                    worker.verify()?;
                }
                Ok::<_, VmError>(worker.report)
            })
        })
        .collect();

    let mut report = WorkerReport::default();
    for worker in workers {
        let result = worker
            .join()
            .map_err(|_| "worker thread panicked".to_string())?;
        report.merge(&result?);
    }
    let summary = Summary {
        elapsed_ms: started.elapsed().as_millis(),
        workers: report,
        metrics: metrics.snapshot(),
        resident_pages: ctx.queues().len(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.workers.mismatches > 0 {
        return Err(format!("{} reads saw unexpected content", summary.workers.mismatches).into());
    }
    Ok(())
}

/// One root object plus a bounded set of clones. `expected` mirrors the first
/// byte of every page of every live object.
struct Worker {
    ctx: Arc<VmContext>,
    rng: ChaCha8Rng,
    mode: CloneMode,
    max_clones: usize,
    objects: Vec<(VmObject, Vec<u8>)>,
    report: WorkerReport,
}

impl Worker {
    fn new(
        ctx: Arc<VmContext>,
        seed: u64,
        pages: u64,
        max_clones: usize,
        mode: CloneMode,
    ) -> Result<Self, VmError> {
        let root = VmObject::create(&ctx, pages * PAGE_SIZE, CreateOptions::new())?;
        Ok(Self {
            ctx,
            rng: ChaCha8Rng::seed_from_u64(seed),
            mode,
            max_clones,
            objects: vec![(root, vec![0; pages as usize])],
            report: WorkerReport::default(),
        })
    }

    fn run(&mut self, iterations: u64) -> Result<(), VmError> {
        for _ in 0..iterations {
            match self.rng.gen_range(0..100) {
                0..=39 => self.write()?,
                40..=74 => self.read()?,
                75..=84 => self.clone_one()?,
                85..=94 => self.drop_one(),
                _ => self.reclaim(),
            }
        }
        Ok(())
    }

    fn pick(&mut self) -> usize {
        self.rng.gen_range(0..self.objects.len())
    }

    fn write(&mut self) -> Result<(), VmError> {
        let index = self.pick();
        let (object, expected) = &mut self.objects[index];
        let page = self.rng.gen_range(0..expected.len());
        let value = self.rng.gen_range(1..=u8::MAX);
        match object.write(page as u64 * PAGE_SIZE, &[value]) {
            Ok(()) => {
                expected[page] = value;
                self.report.writes += 1;
                Ok(())
            }
            Err(VmError::OutOfMemory) => {
                self.report.out_of_memory += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn read(&mut self) -> Result<(), VmError> {
        let index = self.pick();
        let (object, expected) = &self.objects[index];
        let page = self.rng.gen_range(0..expected.len());
        let mut buf = [0u8; 1];
        object.read(page as u64 * PAGE_SIZE, &mut buf)?;
        self.report.reads += 1;
        if buf[0] != expected[page] {
            tracing::error!(
                object = %object.id(),
                page,
                got = buf[0],
                want = expected[page],
                "stress.read.mismatch"
            );
            self.report.mismatches += 1;
        }
        Ok(())
    }

    fn clone_one(&mut self) -> Result<(), VmError> {
        if self.objects.len() > self.max_clones {
            return Ok(());
        }
        let index = self.pick();
        let (source, expected) = &self.objects[index];
        let start = self.rng.gen_range(0..expected.len());
        let len = self.rng.gen_range(1..=expected.len() - start);
        let clone = source.clone(start as u64 * PAGE_SIZE, len as u64 * PAGE_SIZE, self.mode)?;
        let snapshot = expected[start..start + len].to_vec();
        self.objects.push((clone, snapshot));
        self.report.clones += 1;
        Ok(())
    }

    fn drop_one(&mut self) {
        if self.objects.len() <= 1 {
            return;
        }
        let index = self.rng.gen_range(1..self.objects.len());
        self.objects.swap_remove(index);
        self.report.drops += 1;
    }

    fn reclaim(&mut self) {
        let target = self.rng.gen_range(1..=8);
        let stats = Reclaimer::new(self.ctx.clone()).reclaim(target, EvictionPolicy::FollowHints);
        self.report.reclaimed += stats.reclaimed();
    }

    fn verify(&self) -> Result<(), VmError> {
        for (object, _) in &self.objects {
            object.verify_hierarchy()?;
        }
        Ok(())
    }
}

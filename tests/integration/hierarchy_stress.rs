#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use cowvm::{
    CloneMode, CreateOptions, EvictionPolicy, Reclaimer, Result, SnapCompressor, VmContext,
    VmObject, PAGE_SIZE,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

const PAGES: u64 = 16;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn read_u32(object: &VmObject, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    object.read(offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn seeded_root(ctx: &Arc<VmContext>) -> Result<VmObject> {
    let root = VmObject::create(ctx, PAGES * PAGE_SIZE, CreateOptions::new())?;
    for page in 0..PAGES {
        root.write(page * PAGE_SIZE, &(page as u32 + 100).to_le_bytes())?;
    }
    Ok(root)
}

#[test]
fn concurrent_clones_of_one_object() -> Result<()> {
    init_tracing();
    let ctx = VmContext::builder()
        .compressor(Arc::new(SnapCompressor::new()))
        .build();
    let root = Arc::new(seeded_root(&ctx)?);
    let stop = Arc::new(AtomicBool::new(false));

    let reclaimer = {
        let ctx = ctx.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let reclaimer = Reclaimer::new(ctx);
            while !stop.load(Ordering::Acquire) {
                reclaimer.reclaim(4, EvictionPolicy::FollowHints);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let workers: Vec<_> = (0..4u64)
        .map(|seed| {
            let root = root.clone();
            thread::spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                for _ in 0..200 {
                    let start = rng.gen_range(0..PAGES);
                    let len = rng.gen_range(1..=PAGES - start);
                    let clone = VmObject::clone(&root, start * PAGE_SIZE, len * PAGE_SIZE, CloneMode::Modified)?;
                    let page = rng.gen_range(0..len);
                    assert_eq!(read_u32(&clone, page * PAGE_SIZE)?, (start + page) as u32 + 100);
                    clone.write(page * PAGE_SIZE, &u32::MAX.to_le_bytes())?;
                    assert_eq!(read_u32(&clone, page * PAGE_SIZE)?, u32::MAX);
                    if rng.gen_bool(0.3) {
                        let nested = clone.clone(0, len * PAGE_SIZE, CloneMode::Modified)?;
                        assert_eq!(read_u32(&nested, page * PAGE_SIZE)?, u32::MAX);
                    }
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker thread")?;
    }
    stop.store(true, Ordering::Release);
    reclaimer.join().expect("reclaimer thread");

    root.verify_hierarchy()?;
    for page in 0..PAGES {
        assert_eq!(read_u32(&root, page * PAGE_SIZE)?, page as u32 + 100);
    }
    assert_eq!(root.attributed_pages(), PAGES as f64);
    Ok(())
}

#[test]
fn writers_and_cloner_never_lose_updates() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let root = Arc::new(VmObject::create(&ctx, 4 * PAGE_SIZE, CreateOptions::new())?);
    let rounds = 300u32;

    let writers: Vec<_> = (0..4u64)
        .map(|page| {
            let root = root.clone();
            thread::spawn(move || -> Result<()> {
                for value in 1..=rounds {
                    root.write(page * PAGE_SIZE, &value.to_le_bytes())?;
                }
                Ok(())
            })
        })
        .collect();

    let cloner = {
        let root = root.clone();
        thread::spawn(move || -> Result<()> {
            let mut last = [0u32; 4];
            for _ in 0..100 {
                let snapshot = VmObject::clone(&root, 0, 4 * PAGE_SIZE, CloneMode::Modified)?;
                for (page, seen) in last.iter_mut().enumerate() {
                    let value = read_u32(&snapshot, page as u64 * PAGE_SIZE)?;
                    assert!(value >= *seen, "snapshot went backwards");
                    *seen = value;
                }
                snapshot.verify_hierarchy()?;
            }
            Ok(())
        })
    };

    for writer in writers {
        writer.join().expect("writer thread")?;
    }
    cloner.join().expect("cloner thread")?;
    for page in 0..4 {
        assert_eq!(read_u32(&root, page * PAGE_SIZE)?, rounds);
    }
    root.verify_hierarchy()?;
    Ok(())
}

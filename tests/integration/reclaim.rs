#![allow(missing_docs)]

use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::{Duration, Instant};

use cowvm::{
    CloneMode, CompressResult, CompressedRef, CounterMetrics, CreateOptions, DirtyState,
    EvictionHint, EvictionPolicy, Intent, PageCompressor, PageSource, PageSourceProperties,
    QueueKind, ReclaimOutcome, Reclaimer, Result, SnapCompressor, TestPager, VmContext, VmError,
    VmObject, VmOptions, PAGE_SIZE,
};
use tracing_subscriber::EnvFilter;

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

fn compressing_context() -> (Arc<VmContext>, Arc<CounterMetrics>) {
    let metrics = Arc::new(CounterMetrics::default());
    let ctx = VmContext::builder()
        .compressor(Arc::new(SnapCompressor::new()))
        .metrics(metrics.clone())
        .build();
    (ctx, metrics)
}

fn pager_root(ctx: &Arc<VmContext>, pages: u64, properties: PageSourceProperties) -> Result<VmObject> {
    let object = VmObject::create_from_source(
        ctx,
        pages * PAGE_SIZE,
        PageSource::new(TestPager::new(properties)),
        CreateOptions::new(),
    )?;
    object.supply_pages(0, &vec![0x5C; (pages * PAGE_SIZE) as usize])?;
    Ok(object)
}

fn pattern(seed: u8) -> Vec<u8> {
    (0..64u8).map(|i| i.wrapping_mul(seed)).collect()
}

/// Holds every compression until the test lets it through.
struct GatedCompressor {
    codec: SnapCompressor,
    entered: Barrier,
    release: Barrier,
}

impl GatedCompressor {
    fn new() -> Self {
        Self {
            codec: SnapCompressor::new(),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl PageCompressor for GatedCompressor {
    fn compress(&self, src: &[u8]) -> CompressResult {
        self.entered.wait();
        self.release.wait();
        self.codec.compress(src)
    }

    fn decompress(&self, handle: CompressedRef, dest: &mut [u8]) -> Result<()> {
        self.codec.decompress(handle, dest)
    }

    fn free(&self, handle: CompressedRef) {
        self.codec.free(handle);
    }
}

#[test]
fn clean_pager_pages_are_evicted_and_refetched() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let object = pager_root(&ctx, 1, PageSourceProperties::untracked())?;
    let reclaimer = Reclaimer::new(ctx.clone());

    assert_eq!(
        reclaimer.reclaim_page(&object, 0, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Evicted
    );
    assert!(ctx.queues().is_empty());
    assert!(matches!(
        object.require_page(0, Intent::Read),
        Err(VmError::WouldBlock(_))
    ));
    assert!(matches!(
        reclaimer.reclaim_page(&object, PAGE_SIZE, EvictionPolicy::FollowHints),
        Err(VmError::OutOfRange)
    ));
    Ok(())
}

#[test]
fn declines_follow_page_state() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let reclaimer = Reclaimer::new(ctx.clone());

    let dirty = pager_root(&ctx, 1, PageSourceProperties::tracking())?;
    dirty.write(0, &[1])?;
    assert_eq!(
        reclaimer.reclaim_page(&dirty, 0, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Declined("dirty")
    );
    assert_eq!(ctx.queues().count(QueueKind::PagerBackedDirty), 1);

    let hinted = pager_root(&ctx, 1, PageSourceProperties::untracked())?;
    hinted.hint_range(0, PAGE_SIZE, EvictionHint::AlwaysNeed)?;
    assert_eq!(
        reclaimer.reclaim_page(&hinted, 0, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Declined("always_need")
    );
    assert_eq!(
        reclaimer.reclaim_page(&hinted, 0, EvictionPolicy::IgnoreAlwaysNeed)?,
        ReclaimOutcome::Evicted
    );

    let pinned = pager_root(&ctx, 1, PageSourceProperties::untracked())?;
    pinned.pin(0, PAGE_SIZE)?;
    assert_eq!(
        reclaimer.reclaim_page(&pinned, 0, EvictionPolicy::IgnoreAlwaysNeed)?,
        ReclaimOutcome::Declined("pinned")
    );
    assert_eq!(ctx.queues().count(QueueKind::Wired), 1);
    pinned.unpin(0, PAGE_SIZE)?;
    assert!(matches!(pinned.unpin(0, PAGE_SIZE), Err(VmError::NotFound)));

    let urgent = pager_root(&ctx, 1, PageSourceProperties::untracked())?;
    urgent.set_high_priority(true);
    assert_eq!(
        reclaimer.reclaim_page(&urgent, 0, EvictionPolicy::IgnoreAlwaysNeed)?,
        ReclaimOutcome::Declined("high_priority")
    );
    urgent.set_high_priority(false);
    assert_eq!(
        reclaimer.reclaim_page(&urgent, 0, EvictionPolicy::IgnoreAlwaysNeed)?,
        ReclaimOutcome::Evicted
    );
    Ok(())
}

#[test]
fn written_pages_of_untracked_sources_stay_resident() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let object = pager_root(&ctx, 2, PageSourceProperties::untracked())?;
    object.write(0, &[0x77])?;
    let reclaimer = Reclaimer::new(ctx.clone());

    assert_eq!(
        reclaimer.reclaim_page(&object, 0, EvictionPolicy::IgnoreAlwaysNeed)?,
        ReclaimOutcome::Declined("dirty")
    );
    assert_eq!(ctx.queues().count(QueueKind::PagerBackedDirty), 1);
    let stats = reclaimer.reclaim(2, EvictionPolicy::IgnoreAlwaysNeed);
    assert_eq!(stats.evicted, 1);

    let mut buf = [0u8; 1];
    object.read(0, &mut buf)?;
    assert_eq!(buf[0], 0x77);
    assert_eq!(object.dirty_state(0)?, Some(DirtyState::Untracked));
    assert!(object.enumerate_dirty_ranges(0, 2 * PAGE_SIZE)?.is_empty());
    Ok(())
}

#[test]
fn fault_during_compression_takes_the_page_back() -> Result<()> {
    init_tracing();
    let gate = Arc::new(GatedCompressor::new());
    let ctx = VmContext::builder().compressor(gate.clone()).build();
    let object = Arc::new(VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new())?);
    object.write(0, &pattern(9))?;

    let worker = {
        let ctx = ctx.clone();
        let object = object.clone();
        thread::spawn(move || {
            Reclaimer::new(ctx).reclaim_page(&object, 0, EvictionPolicy::FollowHints)
        })
    };
    gate.entered.wait();
    assert_eq!(ctx.compressions_in_flight(), 1);

    let mut buf = vec![0u8; 64];
    object.read(0, &mut buf)?;
    assert_eq!(buf, pattern(9));
    assert_eq!(ctx.compressions_in_flight(), 0);

    gate.release.wait();
    let outcome = worker.join().expect("reclaim thread panicked")?;
    assert_eq!(outcome, ReclaimOutcome::Stale);
    assert_eq!(gate.codec.stored(), 0);
    assert_eq!(ctx.compressions_in_flight(), 0);
    assert_eq!(ctx.queues().count(QueueKind::Anonymous), 1);
    object.verify_hierarchy()?;
    Ok(())
}

#[test]
fn anonymous_pages_round_trip_through_compression() -> Result<()> {
    init_tracing();
    let (ctx, metrics) = compressing_context();
    let object = VmObject::create(&ctx, 2 * PAGE_SIZE, CreateOptions::new())?;
    object.write(0, &pattern(3))?;
    object.write(PAGE_SIZE, &[0])?;
    let reclaimer = Reclaimer::new(ctx.clone());

    assert_eq!(
        reclaimer.reclaim_page(&object, 0, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Compressed
    );
    assert_eq!(
        reclaimer.reclaim_page(&object, PAGE_SIZE, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Compressed
    );
    assert!(ctx.queues().is_empty());
    assert_eq!(metrics.snapshot().compressions, 2);

    let mut buf = vec![0u8; 64];
    object.read(0, &mut buf)?;
    assert_eq!(buf, pattern(3));
    object.read(PAGE_SIZE, &mut buf)?;
    assert!(buf.iter().all(|b| *b == 0));
    assert_eq!(ctx.queues().count(QueueKind::Anonymous), 1);
    Ok(())
}

#[test]
fn shared_pages_keep_their_share_count_when_compressed() -> Result<()> {
    init_tracing();
    let (ctx, _metrics) = compressing_context();
    let parent = VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new())?;
    parent.write(0, &pattern(5))?;
    let child = parent.clone(0, PAGE_SIZE, CloneMode::Modified)?;

    let stats = Reclaimer::new(ctx.clone()).reclaim(1, EvictionPolicy::FollowHints);
    assert_eq!(stats.compressed, 1);
    parent.verify_hierarchy()?;

    child.write(0, &[0xEE])?;
    let mut buf = vec![0u8; 64];
    parent.read(0, &mut buf)?;
    assert_eq!(buf, pattern(5));
    child.read(0, &mut buf[..1])?;
    assert_eq!(buf[0], 0xEE);
    parent.verify_hierarchy()?;
    Ok(())
}

#[test]
fn compression_can_be_disabled() -> Result<()> {
    init_tracing();
    let ctx = VmContext::builder()
        .compressor(Arc::new(SnapCompressor::new()))
        .options(VmOptions::default().compression_enabled(false))
        .build();
    let object = VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new())?;
    object.write(0, &[1])?;
    assert_eq!(
        Reclaimer::new(ctx.clone()).reclaim_page(&object, 0, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Declined("no_compressor")
    );
    Ok(())
}

#[test]
fn incompressible_pages_move_to_the_failed_queue() -> Result<()> {
    init_tracing();
    let ctx = VmContext::builder()
        .compressor(Arc::new(SnapCompressor::with_threshold(8)))
        .build();
    let object = VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new())?;
    object.write(0, &pattern(7))?;
    assert_eq!(
        Reclaimer::new(ctx.clone()).reclaim_page(&object, 0, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Declined("compression_failed")
    );
    assert_eq!(ctx.queues().count(QueueKind::FailedReclaim), 1);
    let mut buf = vec![0u8; 64];
    object.read(0, &mut buf)?;
    assert_eq!(buf, pattern(7));
    Ok(())
}

#[test]
fn discardable_objects_lose_everything_at_once() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let object = VmObject::create(&ctx, 2 * PAGE_SIZE, CreateOptions::new().discardable())?;
    object.write(0, &[1])?;
    object.write(PAGE_SIZE, &[2])?;
    let reclaimer = Reclaimer::new(ctx.clone());

    let state = object.lock_discardable()?;
    assert!(!state.was_discarded);
    assert_eq!(
        reclaimer.reclaim_page(&object, 0, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Declined("locked")
    );
    object.unlock_discardable()?;
    assert!(matches!(object.unlock_discardable(), Err(VmError::NotFound)));

    assert_eq!(
        reclaimer.reclaim_page(&object, PAGE_SIZE, EvictionPolicy::FollowHints)?,
        ReclaimOutcome::Discarded { pages: 2 }
    );
    assert!(ctx.queues().is_empty());
    let mut buf = [0u8; 1];
    assert!(matches!(object.read(0, &mut buf), Err(VmError::NotFound)));
    assert!(matches!(object.try_lock_discardable(), Err(VmError::NotFound)));

    let state = object.lock_discardable()?;
    assert!(state.was_discarded);
    object.read(0, &mut buf)?;
    assert_eq!(buf[0], 0);
    object.unlock_discardable()?;

    let plain = VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new())?;
    assert!(matches!(plain.lock_discardable(), Err(VmError::BadState(_))));
    Ok(())
}

#[test]
fn reclaim_pass_prefers_dont_need_pages() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let object = pager_root(&ctx, 4, PageSourceProperties::untracked())?;
    object.hint_range(3 * PAGE_SIZE, PAGE_SIZE, EvictionHint::DontNeed)?;

    let stats = Reclaimer::new(ctx.clone()).reclaim(1, EvictionPolicy::FollowHints);
    assert_eq!(stats.evicted, 1);
    assert!(matches!(
        object.require_page(3 * PAGE_SIZE, Intent::Read),
        Err(VmError::WouldBlock(_))
    ));
    assert!(matches!(
        object.require_page(0, Intent::Read),
        Ok(cowvm::ResolvedPage::Page { .. })
    ));
    Ok(())
}

#[test]
fn reclaim_pass_stops_after_one_sweep() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let object = pager_root(&ctx, 3, PageSourceProperties::untracked())?;
    object.hint_range(0, 3 * PAGE_SIZE, EvictionHint::AlwaysNeed)?;

    let stats = Reclaimer::new(ctx.clone()).reclaim(10, EvictionPolicy::FollowHints);
    assert_eq!(stats.scanned, 3);
    assert_eq!(stats.declined, 3);
    assert_eq!(stats.reclaimed(), 0);
    assert_eq!(ctx.queues().len(), 3);
    Ok(())
}

#[test]
fn background_reclaimer_drains_queues() -> Result<()> {
    init_tracing();
    let (ctx, metrics) = compressing_context();
    let object = VmObject::create(&ctx, 8 * PAGE_SIZE, CreateOptions::new())?;
    for page in 0..8u8 {
        object.write(u64::from(page) * PAGE_SIZE, &pattern(page + 1))?;
    }

    let handle = Reclaimer::new(ctx.clone()).spawn(Duration::from_secs(60), 8);
    handle.trigger()?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ctx.queues().is_empty() {
        assert!(Instant::now() < deadline, "reclaimer made no progress");
        thread::sleep(Duration::from_millis(5));
    }
    handle.shutdown()?;
    assert_eq!(metrics.snapshot().compressions, 8);

    let mut buf = vec![0u8; 64];
    object.read(5 * PAGE_SIZE, &mut buf)?;
    assert_eq!(buf, pattern(6));
    Ok(())
}

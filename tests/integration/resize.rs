#![allow(missing_docs)]

use std::sync::{Arc, Once};

use cowvm::{
    CloneMode, CreateOptions, DirtyState, EvictionPolicy, MappingObserver, NodeId, PageSource,
    PageSourceProperties, ReclaimOutcome, Reclaimer, Result, TestPager, UnmapOp, VmContext,
    VmError, VmObject, PAGE_SIZE,
};
use parking_lot::Mutex;
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

#[derive(Default)]
struct RecordingObserver {
    calls: Mutex<Vec<(NodeId, u64, u64, UnmapOp)>>,
}

impl MappingObserver for RecordingObserver {
    fn unmap(&self, node: NodeId, offset: u64, len: u64, op: UnmapOp) {
        self.calls.lock().push((node, offset, len, op));
    }
}

fn byte_at(object: &VmObject, offset: u64) -> Result<u8> {
    let mut buf = [0u8; 1];
    object.read(offset, &mut buf)?;
    Ok(buf[0])
}

#[test]
fn shrink_then_grow_reads_zero() -> Result<()> {
    init_tracing();
    let observer = Arc::new(RecordingObserver::default());
    let ctx = VmContext::builder().observer(observer.clone()).build();
    let object = VmObject::create(&ctx, 2 * PAGE_SIZE, CreateOptions::new().resizable())?;
    object.write(0, &[1])?;
    object.write(PAGE_SIZE, &[2])?;

    object.resize(PAGE_SIZE)?;
    assert_eq!(object.size(), PAGE_SIZE);
    assert!(matches!(byte_at(&object, PAGE_SIZE), Err(VmError::OutOfRange)));
    assert!(observer
        .calls
        .lock()
        .contains(&(object.id(), PAGE_SIZE, PAGE_SIZE, UnmapOp::Remove)));

    object.resize(2 * PAGE_SIZE)?;
    assert_eq!(byte_at(&object, 0)?, 1);
    assert_eq!(byte_at(&object, PAGE_SIZE)?, 0);
    assert_eq!(ctx.queues().len(), 1);
    Ok(())
}

#[test]
fn resize_argument_checks() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let fixed = VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new())?;
    assert!(matches!(
        fixed.resize(2 * PAGE_SIZE),
        Err(VmError::BadState(_))
    ));
    let resizable = VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new().resizable())?;
    assert!(matches!(
        resizable.resize(PAGE_SIZE + 1),
        Err(VmError::InvalidArgs(_))
    ));
    resizable.pin(0, PAGE_SIZE)?;
    assert!(matches!(resizable.resize(0), Err(VmError::BadState(_))));
    resizable.unpin(0, PAGE_SIZE)?;
    resizable.resize(0)?;
    Ok(())
}

#[test]
fn shrunk_clone_does_not_see_parent_again() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let parent = VmObject::create(&ctx, 2 * PAGE_SIZE, CreateOptions::new().resizable())?;
    parent.write(PAGE_SIZE, &[5])?;
    let child = parent.clone(0, 2 * PAGE_SIZE, CloneMode::Modified)?;
    assert_eq!(byte_at(&child, PAGE_SIZE)?, 5);

    child.resize(PAGE_SIZE)?;
    child.resize(2 * PAGE_SIZE)?;
    assert_eq!(byte_at(&child, PAGE_SIZE)?, 0);
    assert_eq!(byte_at(&parent, PAGE_SIZE)?, 5);
    parent.verify_hierarchy()?;

    child.write(PAGE_SIZE, &[6])?;
    assert_eq!(byte_at(&parent, PAGE_SIZE)?, 5);
    Ok(())
}

#[test]
fn pager_root_shrink_clamps_children() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let pager = TestPager::new(PageSourceProperties::untracked());
    let root = VmObject::create_from_source(
        &ctx,
        4 * PAGE_SIZE,
        PageSource::new(pager),
        CreateOptions::new().resizable(),
    )?;
    root.supply_pages(0, &vec![0x21; 4 * PAGE_SIZE as usize])?;
    let child = root.clone(0, 4 * PAGE_SIZE, CloneMode::OnWrite)?;
    assert_eq!(byte_at(&child, 3 * PAGE_SIZE)?, 0x21);

    root.resize(2 * PAGE_SIZE)?;
    assert_eq!(byte_at(&child, 0)?, 0x21);
    assert_eq!(byte_at(&child, 3 * PAGE_SIZE)?, 0);
    assert_eq!(ctx.queues().len(), 2);
    root.verify_hierarchy()?;

    root.resize(4 * PAGE_SIZE)?;
    assert_eq!(byte_at(&child, 3 * PAGE_SIZE)?, 0);
    Ok(())
}

#[test]
fn grown_untracked_root_reads_zero_without_the_source() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let pager = TestPager::new(PageSourceProperties::untracked());
    let root = VmObject::create_from_source(
        &ctx,
        2 * PAGE_SIZE,
        PageSource::new(pager.clone()),
        CreateOptions::new().resizable(),
    )?;
    root.supply_pages(0, &vec![0x55; 2 * PAGE_SIZE as usize])?;

    root.resize(PAGE_SIZE)?;
    root.resize(3 * PAGE_SIZE)?;
    assert_eq!(byte_at(&root, 0)?, 0x55);
    assert_eq!(byte_at(&root, PAGE_SIZE)?, 0);
    assert_eq!(byte_at(&root, 2 * PAGE_SIZE)?, 0);
    assert!(pager.requests().is_empty());

    root.write(2 * PAGE_SIZE, &[8])?;
    assert_eq!(root.dirty_state(2 * PAGE_SIZE)?, Some(DirtyState::Untracked));
    assert_eq!(root.dirty_state(PAGE_SIZE)?, Some(DirtyState::Untracked));
    assert_eq!(
        Reclaimer::new(ctx.clone()).reclaim_page(
            &root,
            2 * PAGE_SIZE,
            EvictionPolicy::IgnoreAlwaysNeed
        )?,
        ReclaimOutcome::Declined("dirty")
    );
    assert_eq!(byte_at(&root, 2 * PAGE_SIZE)?, 8);
    assert!(pager.requests().is_empty());
    root.verify_hierarchy()?;
    Ok(())
}

#[test]
fn zero_range_on_roots_and_clones() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let parent = VmObject::create(&ctx, 3 * PAGE_SIZE, CreateOptions::new())?;
    for page in 0..3u8 {
        parent.write(u64::from(page) * PAGE_SIZE, &[page + 1])?;
    }
    let child = parent.clone(0, 3 * PAGE_SIZE, CloneMode::Modified)?;

    child.zero_range(0, PAGE_SIZE)?;
    assert_eq!(byte_at(&child, 0)?, 0);
    assert_eq!(byte_at(&child, PAGE_SIZE)?, 2);
    assert_eq!(byte_at(&parent, 0)?, 1);
    parent.verify_hierarchy()?;

    child.zero_range(PAGE_SIZE, 2 * PAGE_SIZE)?;
    assert_eq!(byte_at(&child, 2 * PAGE_SIZE)?, 0);
    assert_eq!(byte_at(&parent, 2 * PAGE_SIZE)?, 3);
    parent.verify_hierarchy()?;

    parent.zero_range(PAGE_SIZE, PAGE_SIZE)?;
    assert_eq!(byte_at(&parent, PAGE_SIZE)?, 0);
    assert!(matches!(
        parent.zero_range(0, 4 * PAGE_SIZE),
        Err(VmError::OutOfRange)
    ));
    assert!(matches!(
        parent.zero_range(1, PAGE_SIZE),
        Err(VmError::InvalidArgs(_))
    ));
    Ok(())
}

#[test]
fn zero_range_on_pager_roots() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let untracked = VmObject::create_from_source(
        &ctx,
        2 * PAGE_SIZE,
        PageSource::new(TestPager::new(PageSourceProperties::untracked())),
        CreateOptions::new(),
    )?;
    untracked.supply_pages(0, &vec![0x44; 2 * PAGE_SIZE as usize])?;
    untracked.zero_range(0, PAGE_SIZE)?;
    assert_eq!(byte_at(&untracked, 0)?, 0);
    assert_eq!(byte_at(&untracked, PAGE_SIZE)?, 0x44);

    let tracked = VmObject::create_from_source(
        &ctx,
        PAGE_SIZE,
        PageSource::new(TestPager::new(PageSourceProperties::tracking())),
        CreateOptions::new(),
    )?;
    tracked.zero_range(0, PAGE_SIZE)?;
    assert_eq!(byte_at(&tracked, 0)?, 0);
    let ranges = tracked.enumerate_dirty_ranges(0, PAGE_SIZE)?;
    assert_eq!(ranges.len(), 1);
    assert!(ranges[0].is_zero);

    let trapping = VmObject::create_from_source(
        &ctx,
        PAGE_SIZE,
        PageSource::new(TestPager::new(PageSourceProperties::trapping())),
        CreateOptions::new(),
    )?;
    assert!(matches!(
        trapping.zero_range(0, PAGE_SIZE),
        Err(VmError::BadState(_))
    ));
    Ok(())
}

#[test]
fn commit_and_decommit() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let object = VmObject::create(&ctx, 4 * PAGE_SIZE, CreateOptions::new())?;
    object.commit_range(0, 4 * PAGE_SIZE)?;
    assert_eq!(ctx.queues().len(), 4);
    object.decommit_range(PAGE_SIZE, 2 * PAGE_SIZE)?;
    assert_eq!(ctx.queues().len(), 2);

    let clone = object.clone(0, PAGE_SIZE, CloneMode::Modified)?;
    assert!(matches!(
        clone.decommit_range(0, PAGE_SIZE),
        Err(VmError::BadState(_))
    ));
    clone.commit_range(0, PAGE_SIZE)?;
    assert_eq!(ctx.queues().len(), 3);
    Ok(())
}

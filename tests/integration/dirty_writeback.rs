#![allow(missing_docs)]

use std::sync::{Arc, Once};

use cowvm::{
    CreateOptions, DirtyRange, DirtyState, Intent, PageSource, PageSourceProperties, RequestKind,
    Result, TestPager, VmContext, VmError, VmObject, PAGE_SIZE,
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

fn supplied_root(
    ctx: &Arc<VmContext>,
    pages: u64,
    properties: PageSourceProperties,
    options: CreateOptions,
) -> Result<(Arc<TestPager>, VmObject)> {
    let pager = TestPager::new(properties);
    let object = VmObject::create_from_source(
        ctx,
        pages * PAGE_SIZE,
        PageSource::new(pager.clone()),
        options,
    )?;
    object.supply_pages(0, &vec![0x33; (pages * PAGE_SIZE) as usize])?;
    Ok((pager, object))
}

fn range(offset: u64, len: u64, is_zero: bool) -> DirtyRange {
    DirtyRange {
        offset,
        len,
        is_zero,
    }
}

#[test]
fn partial_writeback_leaves_remainder_dirty() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (pager, object) = supplied_root(
        &ctx,
        4,
        PageSourceProperties::trapping(),
        CreateOptions::new(),
    )?;
    assert_eq!(object.dirty_state(0)?, Some(DirtyState::Clean));

    let err = object.mark_dirty(0, 4 * PAGE_SIZE).unwrap_err();
    let request = err.request().cloned().expect("dirty request");
    assert_eq!(request.kind(), RequestKind::Dirty);
    assert_eq!((request.offset(), request.len()), (0, 4 * PAGE_SIZE));
    assert_eq!(object.dirty_state(0)?, Some(DirtyState::Clean));

    object.dirty_pages(0, 4 * PAGE_SIZE)?;
    object.mark_dirty(0, 4 * PAGE_SIZE)?;
    assert!(object.source().expect("pager").outstanding().is_empty());
    assert_eq!(
        object.enumerate_dirty_ranges(0, 4 * PAGE_SIZE)?,
        vec![range(0, 4 * PAGE_SIZE, false)]
    );

    object.writeback_begin(0, 4 * PAGE_SIZE)?;
    assert_eq!(object.dirty_state(PAGE_SIZE)?, Some(DirtyState::AwaitingClean));
    object.writeback_end(0, 2 * PAGE_SIZE)?;

    assert_eq!(object.dirty_state(0)?, Some(DirtyState::Clean));
    assert_eq!(object.dirty_state(PAGE_SIZE)?, Some(DirtyState::Clean));
    let remainder = object.dirty_state(2 * PAGE_SIZE)?.expect("resident");
    assert!(remainder.is_dirty());
    assert_eq!(
        object.enumerate_dirty_ranges(0, 4 * PAGE_SIZE)?,
        vec![range(2 * PAGE_SIZE, 2 * PAGE_SIZE, false)]
    );
    let dirty_requests = pager
        .requests()
        .iter()
        .filter(|r| r.kind() == RequestKind::Dirty)
        .count();
    assert_eq!(dirty_requests, 1);
    Ok(())
}

#[test]
fn trapped_write_faults_wait_for_acknowledgement() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = supplied_root(
        &ctx,
        1,
        PageSourceProperties::trapping(),
        CreateOptions::new(),
    )?;

    let err = object.write(0, &[1]).unwrap_err();
    assert!(matches!(
        err.request().map(|r| r.kind()),
        Some(RequestKind::Dirty)
    ));
    let mut buf = [0u8; 1];
    object.read(0, &mut buf)?;
    assert_eq!(buf[0], 0x33);

    object.dirty_pages(0, PAGE_SIZE)?;
    object.write(0, &[1])?;
    object.read(0, &mut buf)?;
    assert_eq!(buf[0], 1);
    assert_eq!(object.dirty_state(0)?, Some(DirtyState::Dirty));
    Ok(())
}

#[test]
fn redirtied_pages_survive_writeback_end() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = supplied_root(
        &ctx,
        2,
        PageSourceProperties::tracking(),
        CreateOptions::new(),
    )?;

    object.write(0, &[1])?;
    object.write(PAGE_SIZE, &[2])?;
    object.writeback_begin(0, 2 * PAGE_SIZE)?;
    object.write(PAGE_SIZE, &[3])?;
    object.writeback_end(0, 2 * PAGE_SIZE)?;

    assert_eq!(object.dirty_state(0)?, Some(DirtyState::Clean));
    assert_eq!(object.dirty_state(PAGE_SIZE)?, Some(DirtyState::Dirty));
    assert_eq!(
        object.enumerate_dirty_ranges(0, 2 * PAGE_SIZE)?,
        vec![range(PAGE_SIZE, PAGE_SIZE, false)]
    );
    Ok(())
}

#[test]
fn zero_intervals_clean_only_the_acknowledged_prefix() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = supplied_root(
        &ctx,
        2,
        PageSourceProperties::tracking(),
        CreateOptions::new().resizable(),
    )?;
    object.resize(4 * PAGE_SIZE)?;
    assert_eq!(object.dirty_state(3 * PAGE_SIZE)?, Some(DirtyState::Dirty));
    assert_eq!(
        object.enumerate_dirty_ranges(0, 4 * PAGE_SIZE)?,
        vec![range(2 * PAGE_SIZE, 2 * PAGE_SIZE, true)]
    );

    object.writeback_begin(2 * PAGE_SIZE, 2 * PAGE_SIZE)?;
    object.writeback_end(2 * PAGE_SIZE, PAGE_SIZE)?;

    assert_eq!(object.dirty_state(2 * PAGE_SIZE)?, None);
    assert_eq!(
        object.dirty_state(3 * PAGE_SIZE)?,
        Some(DirtyState::AwaitingClean)
    );
    assert_eq!(
        object.enumerate_dirty_ranges(0, 4 * PAGE_SIZE)?,
        vec![range(3 * PAGE_SIZE, PAGE_SIZE, true)]
    );

    let mut buf = [0xFFu8; 1];
    object.read(3 * PAGE_SIZE, &mut buf)?;
    assert_eq!(buf[0], 0);
    assert!(matches!(
        object.require_page(2 * PAGE_SIZE, Intent::Read),
        Err(VmError::WouldBlock(_))
    ));
    Ok(())
}

#[test]
fn writes_into_zero_intervals_commit_dirty_pages() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = supplied_root(
        &ctx,
        1,
        PageSourceProperties::tracking(),
        CreateOptions::new().resizable(),
    )?;
    object.resize(3 * PAGE_SIZE)?;
    object.write(2 * PAGE_SIZE, &[7])?;
    assert_eq!(object.dirty_state(2 * PAGE_SIZE)?, Some(DirtyState::Dirty));
    assert_eq!(
        object.enumerate_dirty_ranges(0, 3 * PAGE_SIZE)?,
        vec![
            range(PAGE_SIZE, PAGE_SIZE, true),
            range(2 * PAGE_SIZE, PAGE_SIZE, false),
        ]
    );
    Ok(())
}

#[test]
fn awaiting_clean_zero_content_traps_on_every_write_path() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = supplied_root(
        &ctx,
        1,
        PageSourceProperties::trapping(),
        CreateOptions::new().resizable(),
    )?;
    object.resize(3 * PAGE_SIZE)?;
    object.writeback_begin(PAGE_SIZE, 2 * PAGE_SIZE)?;

    let err = object.write(PAGE_SIZE, &[5]).unwrap_err();
    let request = err.request().cloned().expect("dirty request");
    assert_eq!(request.kind(), RequestKind::Dirty);
    assert_eq!(request.offset(), PAGE_SIZE);
    let err = object.mark_dirty(PAGE_SIZE, PAGE_SIZE).unwrap_err();
    assert_eq!(err.request().map(|r| r.kind()), Some(RequestKind::Dirty));
    assert_eq!(
        object.dirty_state(PAGE_SIZE)?,
        Some(DirtyState::AwaitingClean)
    );

    object.dirty_pages(PAGE_SIZE, PAGE_SIZE)?;
    object.write(PAGE_SIZE, &[5])?;
    assert_eq!(object.dirty_state(PAGE_SIZE)?, Some(DirtyState::Dirty));
    assert_eq!(
        object.dirty_state(2 * PAGE_SIZE)?,
        Some(DirtyState::AwaitingClean)
    );
    let mut buf = [0u8; 1];
    object.read(PAGE_SIZE, &mut buf)?;
    assert_eq!(buf[0], 5);
    Ok(())
}

#[test]
fn mark_dirty_asks_for_missing_content_first() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let pager = TestPager::new(PageSourceProperties::tracking());
    let object = VmObject::create_from_source(
        &ctx,
        2 * PAGE_SIZE,
        PageSource::new(pager),
        CreateOptions::new(),
    )?;

    let err = object.mark_dirty(0, 2 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.request().map(|r| r.kind()), Some(RequestKind::Read));
    assert!(matches!(
        object.dirty_pages(0, PAGE_SIZE),
        Err(VmError::NotFound)
    ));

    object.supply_pages(0, &vec![0u8; 2 * PAGE_SIZE as usize])?;
    object.mark_dirty(0, 2 * PAGE_SIZE)?;
    assert_eq!(object.dirty_state(PAGE_SIZE)?, Some(DirtyState::Dirty));
    Ok(())
}

#[test]
fn untracked_and_anonymous_objects() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, untracked) = supplied_root(
        &ctx,
        1,
        PageSourceProperties::untracked(),
        CreateOptions::new(),
    )?;
    untracked.mark_dirty(0, PAGE_SIZE)?;
    untracked.write(0, &[1])?;
    assert_eq!(untracked.dirty_state(0)?, Some(DirtyState::Untracked));
    assert!(untracked.enumerate_dirty_ranges(0, PAGE_SIZE)?.is_empty());

    let anonymous = VmObject::create(&ctx, PAGE_SIZE, CreateOptions::new())?;
    assert!(matches!(
        anonymous.writeback_begin(0, PAGE_SIZE),
        Err(VmError::BadState(_))
    ));
    assert!(matches!(
        anonymous.supply_pages(0, &[0u8; PAGE_SIZE as usize]),
        Err(VmError::BadState(_))
    ));
    Ok(())
}

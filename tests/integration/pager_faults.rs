#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use cowvm::{
    CounterMetrics, CreateOptions, HeapAllocator, Intent, PageSource, PageSourceProperties,
    QueueKind, RequestKind, ResolvedPage, Result, TestPager, VmContext, VmError, VmObject,
    VmOptions, PAGE_SIZE,
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

fn pager_object(
    ctx: &Arc<VmContext>,
    pages: u64,
    properties: PageSourceProperties,
) -> Result<(Arc<TestPager>, VmObject)> {
    let pager = TestPager::new(properties);
    let object = VmObject::create_from_source(
        ctx,
        pages * PAGE_SIZE,
        PageSource::new(pager.clone()),
        CreateOptions::new(),
    )?;
    Ok((pager, object))
}

fn filled(pages: u64, byte: u8) -> Vec<u8> {
    vec![byte; (pages * PAGE_SIZE) as usize]
}

#[test]
fn absent_page_blocks_until_supplied() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (pager, object) = pager_object(&ctx, 1, PageSourceProperties::untracked())?;

    let err = object.require_page(0, Intent::Read).unwrap_err();
    let request = err.request().cloned().expect("would block");
    assert!(err.is_retryable());
    assert_eq!(request.kind(), RequestKind::Read);
    assert_eq!(request.offset(), 0);
    assert_eq!(pager.take_requests(), vec![request.clone()]);

    object.supply_pages(0, &filled(1, 0x5A))?;
    let source = object.source().expect("pager-backed");
    source.wait(&request, Duration::from_millis(10))?;

    let mut buf = [0u8; 8];
    object.read(0, &mut buf)?;
    assert_eq!(buf, [0x5A; 8]);
    assert!(matches!(
        object.require_page(0, Intent::Read)?,
        ResolvedPage::Page { .. }
    ));
    Ok(())
}

#[test]
fn repeated_faults_join_the_outstanding_request() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (pager, object) = pager_object(&ctx, 4, PageSourceProperties::untracked())?;
    let first = object.require_page(0, Intent::Read).unwrap_err();
    let second = object.require_page(PAGE_SIZE, Intent::Read).unwrap_err();
    assert_eq!(first.request(), second.request());
    assert_eq!(pager.requests().len(), 1);
    Ok(())
}

#[test]
fn read_ahead_is_bounded_by_options_and_content() -> Result<()> {
    init_tracing();
    let ctx = VmContext::builder()
        .options(VmOptions::default().read_ahead_pages(4))
        .build();
    let (pager, object) = pager_object(&ctx, 8, PageSourceProperties::untracked())?;

    let err = object.require_page(0, Intent::Read).unwrap_err();
    assert_eq!(err.request().map(|r| r.len()), Some(4 * PAGE_SIZE));

    object.supply_pages(0, &filled(4, 1))?;
    object.supply_pages(6 * PAGE_SIZE, &filled(1, 2))?;
    pager.take_requests();
    let err = object.require_page(4 * PAGE_SIZE, Intent::Read).unwrap_err();
    let request = err.request().expect("would block");
    assert_eq!(request.offset(), 4 * PAGE_SIZE);
    assert_eq!(request.len(), 2 * PAGE_SIZE);

    let err = object.require_page(7 * PAGE_SIZE, Intent::Read).unwrap_err();
    assert_eq!(err.request().map(|r| r.len()), Some(PAGE_SIZE));
    Ok(())
}

#[test]
fn supply_skips_resident_pages() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = pager_object(&ctx, 2, PageSourceProperties::untracked())?;
    object.supply_pages(0, &filled(1, 1))?;
    object.write(0, &[9])?;
    object.supply_pages(0, &filled(2, 3))?;

    let mut buf = [0u8; 1];
    object.read(0, &mut buf)?;
    assert_eq!(buf[0], 9);
    object.read(PAGE_SIZE, &mut buf)?;
    assert_eq!(buf[0], 3);

    assert!(matches!(
        object.supply_pages(PAGE_SIZE, &filled(2, 0)),
        Err(VmError::OutOfRange)
    ));
    assert!(matches!(
        object.supply_pages(0, &[0u8; 10]),
        Err(VmError::InvalidArgs(_))
    ));
    Ok(())
}

#[test]
fn waiting_thread_wakes_on_supply() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (pager, object) = pager_object(&ctx, 1, PageSourceProperties::untracked())?;
    let object = Arc::new(object);

    let responder = {
        let object = object.clone();
        thread::spawn(move || -> Result<()> {
            loop {
                if !pager.take_requests().is_empty() {
                    return object.supply_pages(0, &filled(1, 0x77));
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let mut buf = [0u8; 1];
    loop {
        match object.read(0, &mut buf) {
            Ok(()) => break,
            Err(VmError::WouldBlock(request)) => {
                let source = object.source().expect("pager-backed");
                match source.wait(&request, Duration::from_secs(5)) {
                    Ok(()) | Err(VmError::WouldBlock(_)) => continue,
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
    assert_eq!(buf[0], 0x77);
    responder.join().expect("responder thread")?;
    Ok(())
}

#[test]
fn failed_and_detached_sources_surface_errors() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = pager_object(&ctx, 2, PageSourceProperties::untracked())?;
    let source = object.source().expect("pager-backed");

    let err = object.require_page(0, Intent::Read).unwrap_err();
    let request = err.request().cloned().expect("would block");
    source.on_pages_failed(0, PAGE_SIZE, "media error");
    assert!(matches!(
        source.wait(&request, Duration::from_millis(10)),
        Err(VmError::Io(_))
    ));

    source.detach();
    assert!(matches!(
        object.require_page(0, Intent::Read),
        Err(VmError::BadState(_))
    ));
    assert!(matches!(
        VmObject::create_from_source(&ctx, PAGE_SIZE, source, CreateOptions::new()),
        Err(VmError::BadState(_))
    ));
    Ok(())
}

#[test]
fn loaned_pages_are_replaced_before_writes() -> Result<()> {
    init_tracing();
    let allocator = Arc::new(HeapAllocator::new().with_loaned_pages(4));
    let metrics = Arc::new(CounterMetrics::default());
    let ctx = VmContext::builder()
        .allocator(allocator.clone())
        .metrics(metrics.clone())
        .options(VmOptions::default().supply_loaned(true))
        .build();
    let (_pager, object) = pager_object(&ctx, 1, PageSourceProperties::untracked())?;

    object.supply_pages(0, &filled(1, 0x10))?;
    assert_eq!(allocator.loaned_outstanding(), 1);
    let ResolvedPage::Page { id: loaned, .. } = object.require_page(0, Intent::Read)? else {
        panic!("expected a resident page");
    };

    object.write(1, &[0x20])?;
    assert_eq!(allocator.loaned_outstanding(), 0);
    let ResolvedPage::Page { id: owned, writable, .. } = object.require_page(0, Intent::Write)? else {
        panic!("expected a resident page");
    };
    assert_ne!(loaned, owned);
    assert!(writable);

    let mut buf = [0u8; 2];
    object.read(0, &mut buf)?;
    assert_eq!(buf, [0x10, 0x20]);
    assert_eq!(metrics.snapshot().read_requests, 0);
    Ok(())
}

#[test]
fn allocator_exhaustion_is_retryable() -> Result<()> {
    init_tracing();
    let ctx = VmContext::builder()
        .allocator(Arc::new(HeapAllocator::with_limit(1)))
        .build();
    let object = VmObject::create(&ctx, 2 * PAGE_SIZE, CreateOptions::new())?;
    object.write(0, &[1])?;
    let err = object.write(PAGE_SIZE, &[2]).unwrap_err();
    assert!(matches!(err, VmError::OutOfMemory));
    assert!(err.is_retryable());

    object.decommit_range(0, PAGE_SIZE)?;
    object.write(PAGE_SIZE, &[2])?;
    let mut buf = [0u8; 1];
    object.read(0, &mut buf)?;
    assert_eq!(buf[0], 0);
    Ok(())
}

#[test]
fn failed_pin_releases_earlier_pins() -> Result<()> {
    init_tracing();
    let ctx = VmContext::new();
    let (_pager, object) = pager_object(&ctx, 2, PageSourceProperties::untracked())?;
    object.supply_pages(0, &filled(1, 0x11))?;

    let err = object.pin(0, 2 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.request().map(|r| r.offset()), Some(PAGE_SIZE));
    assert_eq!(ctx.queues().count(QueueKind::Wired), 0);
    assert!(matches!(object.unpin(0, PAGE_SIZE), Err(VmError::NotFound)));

    object.supply_pages(PAGE_SIZE, &filled(1, 0x12))?;
    object.pin(0, 2 * PAGE_SIZE)?;
    assert_eq!(ctx.queues().count(QueueKind::Wired), 2);
    object.unpin(0, 2 * PAGE_SIZE)?;
    Ok(())
}

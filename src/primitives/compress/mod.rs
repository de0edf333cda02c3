//! Page compression collaborators.
//!
//! [`PageCompressor`] is the external codec. [`Compression`] is the core-side
//! wrapper that owns pages while they are being compressed: the page is parked
//! under a temporary [`CompressedRef`] so the slot that held it can be
//! unlocked for the duration of the codec call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::primitives::alloc::Page;
use crate::types::{Result, VmError, PAGE_SIZE_BYTES};

const TEMP_BIT: u64 = 1 << 63;

/// Handle to a compressed page, or to a page that is being compressed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CompressedRef(u64);

impl CompressedRef {
    /// Wraps a codec-assigned handle. The top bit is reserved.
    pub fn new(raw: u64) -> Self {
        debug_assert_eq!(raw & TEMP_BIT, 0);
        Self(raw & !TEMP_BIT)
    }

    fn temporary(raw: u64) -> Self {
        Self(raw | TEMP_BIT)
    }

    /// Raw handle value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// True for placeholders created by [`Compression::start`].
    pub fn is_temporary(self) -> bool {
        self.0 & TEMP_BIT != 0
    }
}

/// Outcome of compressing one page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompressResult {
    /// Stored under the returned handle.
    Compressed(CompressedRef),
    /// The page was entirely zero; nothing was stored.
    Zero,
    /// The page could not be compressed.
    Fail,
}

/// External page codec.
pub trait PageCompressor: Send + Sync {
    /// Compresses one page.
    fn compress(&self, src: &[u8]) -> CompressResult;

    /// Restores a page into `dest`. The handle stays valid until freed.
    fn decompress(&self, handle: CompressedRef, dest: &mut [u8]) -> Result<()>;

    /// Releases the storage behind a handle.
    fn free(&self, handle: CompressedRef);
}

struct Stored {
    crc: u32,
    bytes: Vec<u8>,
}

/// [`PageCompressor`] backed by the `snap` codec with a CRC32 integrity check.
///
/// Pages that do not shrink below `max_compressed_len` bytes fail.
pub struct SnapCompressor {
    next: AtomicU64,
    max_compressed_len: usize,
    store: Mutex<FxHashMap<u64, Stored>>,
}

impl Default for SnapCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapCompressor {
    /// Accepts pages that compress to at most three quarters of a page.
    pub fn new() -> Self {
        Self::with_threshold(PAGE_SIZE_BYTES * 3 / 4)
    }

    /// Accepts pages that compress to at most `max_compressed_len` bytes.
    pub fn with_threshold(max_compressed_len: usize) -> Self {
        Self {
            next: AtomicU64::new(1),
            max_compressed_len,
            store: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of pages currently stored.
    pub fn stored(&self) -> usize {
        self.store.lock().len()
    }

    /// Compressed bytes currently stored.
    pub fn stored_bytes(&self) -> usize {
        self.store.lock().values().map(|s| s.bytes.len()).sum()
    }
}

impl PageCompressor for SnapCompressor {
    fn compress(&self, src: &[u8]) -> CompressResult {
        if src.iter().all(|b| *b == 0) {
            return CompressResult::Zero;
        }
        let bytes = match snap::raw::Encoder::new().compress_vec(src) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "compress.snap.encode_failed");
                return CompressResult::Fail;
            }
        };
        if bytes.len() > self.max_compressed_len {
            return CompressResult::Fail;
        }
        let crc = crc32fast::hash(src);
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.store.lock().insert(id, Stored { crc, bytes });
        CompressResult::Compressed(CompressedRef::new(id))
    }

    fn decompress(&self, handle: CompressedRef, dest: &mut [u8]) -> Result<()> {
        let store = self.store.lock();
        let stored = store
            .get(&handle.raw())
            .ok_or_else(|| VmError::Io(format!("unknown compressed handle {}", handle.raw())))?;
        let written = snap::raw::Decoder::new()
            .decompress(&stored.bytes, dest)
            .map_err(|err| VmError::Io(err.to_string()))?;
        if written != dest.len() || crc32fast::hash(dest) != stored.crc {
            return Err(VmError::Io(format!(
                "compressed page {} failed integrity check",
                handle.raw()
            )));
        }
        Ok(())
    }

    fn free(&self, handle: CompressedRef) {
        self.store.lock().remove(&handle.raw());
    }
}

/// Core-side compression state: the codec plus pages parked mid-compression.
pub struct Compression {
    compressor: Arc<dyn PageCompressor>,
    next_temp: AtomicU64,
    in_flight: Mutex<FxHashMap<u64, Page>>,
}

impl Compression {
    /// Wraps a codec.
    pub fn new(compressor: Arc<dyn PageCompressor>) -> Self {
        Self {
            compressor,
            next_temp: AtomicU64::new(1),
            in_flight: Mutex::new(FxHashMap::default()),
        }
    }

    /// Parks `page` and returns the placeholder to store in its slot.
    pub fn start(&self, page: Page) -> CompressedRef {
        let temp = CompressedRef::temporary(self.next_temp.fetch_add(1, Ordering::Relaxed));
        self.in_flight.lock().insert(temp.raw(), page);
        temp
    }

    /// Compresses a parked page. Runs on a private copy, so the page may be
    /// taken back concurrently.
    pub fn compress(&self, temp: CompressedRef) -> CompressResult {
        let mut buf = vec![0u8; PAGE_SIZE_BYTES];
        {
            let in_flight = self.in_flight.lock();
            match in_flight.get(&temp.raw()) {
                Some(page) => buf.copy_from_slice(page.data()),
                None => return CompressResult::Fail,
            }
        }
        self.compressor.compress(&buf)
    }

    /// Removes a parked page.
    pub fn take_page(&self, temp: CompressedRef) -> Option<Page> {
        self.in_flight.lock().remove(&temp.raw())
    }

    /// Restores a permanent handle into `dest`.
    pub fn decompress(&self, handle: CompressedRef, dest: &mut [u8]) -> Result<()> {
        debug_assert!(!handle.is_temporary());
        self.compressor.decompress(handle, dest)
    }

    /// Releases a permanent handle.
    pub fn free(&self, handle: CompressedRef) {
        debug_assert!(!handle.is_temporary());
        self.compressor.free(handle);
    }

    /// Pages currently parked.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

//! Allocation tracker: every byte a stack owns goes through here.
//!
//! The tracker hands out zero-initialized [`RawRegion`]s, grows and shrinks
//! them in place of the caller, and optionally writes one JSONL record per
//! allocate / reallocate / free into an [`AllocationLog`].
//!
//! The log is an explicit object with its own lifecycle: opened lazily on the
//! first record, closed by [`AllocationLog::shutdown`]. Writes are serialized
//! with a `parking_lot::Mutex` so one log can be shared by many trackers.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::StackError;
use crate::layout::REGION_ALIGN;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, SharedBuffer};

/// One owned, zero-initialized, 8-byte aligned heap block.
///
/// Dropping a region releases it and settles the live counters of the
/// tracker that allocated it; [`AllocationTracker::free`] additionally logs
/// the release and counts it as a free.
pub struct RawRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    counters: Arc<TrackerCounters>,
}

// SAFETY: a region is uniquely owned heap memory with no thread affinity.
unsafe impl Send for RawRegion {}

impl RawRegion {
    /// Base address of the block.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Size of the block in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() bytes, every byte was
        // initialized (alloc_zeroed, or zero-filled after growth), and the
        // borrow of self prevents concurrent mutation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; the exclusive borrow of self makes this the only
        // live view of the block.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Zero `range`, clamped to the block.
    pub fn zero(&mut self, range: std::ops::Range<usize>) {
        let len = self.len();
        let start = range.start.min(len);
        let end = range.end.min(len);
        if start < end {
            self.as_mut_slice()[start..end].fill(0);
        }
    }
}

impl Drop for RawRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was produced by alloc_zeroed/realloc with self.layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        self.counters.live_regions.fetch_sub(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_sub(self.layout.size(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for RawRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

/// Where an [`AllocationLog`] writes once it opens.
#[derive(Debug, Clone)]
pub enum LogTarget {
    File(PathBuf),
    Buffer(SharedBuffer),
}

#[derive(Default)]
struct LogState {
    emitter: Option<LogEmitter>,
    closed: bool,
    open_failed: bool,
}

/// Append-only JSONL record of memory operations and stack lifecycle events.
pub struct AllocationLog {
    target: LogTarget,
    run_id: String,
    state: Mutex<LogState>,
    write_failures: AtomicU64,
}

impl AllocationLog {
    /// Log to `path`; the file is created on the first record.
    #[must_use]
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self::new(LogTarget::File(path.into()))
    }

    /// Log into a shared in-memory buffer.
    #[must_use]
    pub fn to_buffer(buffer: SharedBuffer) -> Self {
        Self::new(LogTarget::Buffer(buffer))
    }

    #[must_use]
    pub fn new(target: LogTarget) -> Self {
        Self {
            target,
            run_id: format!("pid{}", std::process::id()),
            state: Mutex::new(LogState::default()),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Path of a file-backed log.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            LogTarget::File(path) => Some(path),
            LogTarget::Buffer(_) => None,
        }
    }

    /// True once the first record opened the sink and before shutdown.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().emitter.is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Records that could not be written.
    #[must_use]
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Append one record, opening the sink first if needed.
    ///
    /// Records after [`shutdown`](Self::shutdown) are dropped. A logging
    /// failure never fails the memory operation being logged.
    pub fn record(&self, entry: LogEntry) {
        let mut state = self.state.lock();
        if state.closed || state.open_failed {
            return;
        }
        if state.emitter.is_none() {
            match self.open_emitter() {
                Ok(mut emitter) => {
                    let opened = emitter
                        .emit_entry(LogEntry::new(String::new(), LogLevel::Info, "log_open"));
                    if opened.is_err() {
                        self.write_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    state.emitter = Some(emitter);
                }
                Err(err) => {
                    eprintln!("sentinel-membrane: cannot open allocation log: {err}");
                    state.open_failed = true;
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
        if let Some(emitter) = state.emitter.as_mut() {
            let written = emitter.emit_entry(entry).and_then(|()| emitter.flush());
            if written.is_err() {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Write the closing record, flush, and close the sink.
    ///
    /// Idempotent; a log that never opened is simply marked closed.
    pub fn shutdown(&self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        let Some(mut emitter) = state.emitter.take() else {
            return Ok(());
        };
        emitter.emit_entry(LogEntry::new(String::new(), LogLevel::Info, "log_close"))?;
        emitter.flush()
    }

    fn open_emitter(&self) -> std::io::Result<LogEmitter> {
        match &self.target {
            LogTarget::File(path) => LogEmitter::to_file(path, "alloc", &self.run_id),
            LogTarget::Buffer(buffer) => Ok(LogEmitter::to_buffer(
                buffer.clone(),
                "alloc",
                &self.run_id,
            )),
        }
    }
}

impl std::fmt::Debug for AllocationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationLog")
            .field("target", &self.target)
            .field("write_failures", &self.write_failures())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct TrackerCounters {
    allocations: AtomicU64,
    reallocations: AtomicU64,
    frees: AtomicU64,
    failures: AtomicU64,
    live_regions: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// Point-in-time view of a tracker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerSnapshot {
    pub allocations: u64,
    pub reallocations: u64,
    pub frees: u64,
    pub failures: u64,
    pub live_regions: usize,
    pub live_bytes: usize,
}

/// Wraps allocate / reallocate / free with counters and optional logging.
///
/// Clones share counters and log.
#[derive(Debug, Clone, Default)]
pub struct AllocationTracker {
    log: Option<Arc<AllocationLog>>,
    counters: Arc<TrackerCounters>,
}

impl AllocationTracker {
    /// Tracker without a log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker writing into `log`.
    #[must_use]
    pub fn with_log(log: Arc<AllocationLog>) -> Self {
        Self {
            log: Some(log),
            counters: Arc::default(),
        }
    }

    #[must_use]
    pub fn log(&self) -> Option<&Arc<AllocationLog>> {
        self.log.as_ref()
    }

    /// Forward a non-memory event to the attached log, if any.
    pub fn record(&self, entry: LogEntry) {
        if let Some(log) = &self.log {
            log.record(entry);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        let c = &self.counters;
        TrackerSnapshot {
            allocations: c.allocations.load(Ordering::Relaxed),
            reallocations: c.reallocations.load(Ordering::Relaxed),
            frees: c.frees.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            live_regions: c.live_regions.load(Ordering::Relaxed),
            live_bytes: c.live_bytes.load(Ordering::Relaxed),
        }
    }

    /// Allocate `bytes` zeroed bytes.
    pub fn allocate(&self, bytes: usize, stack_id: Option<u64>) -> Result<RawRegion, StackError> {
        let layout = region_layout(bytes)?;
        // SAFETY: region_layout rejects zero sizes.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw);

        let mut entry = LogEntry::new(String::new(), LogLevel::Debug, "allocate")
            .with_address(raw as usize)
            .with_bytes(bytes);
        if let Some(id) = stack_id {
            entry = entry.with_stack(id);
        }
        self.record(entry);

        let Some(ptr) = ptr else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(StackError::Memory { bytes });
        };
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters.live_regions.fetch_add(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(RawRegion {
            ptr,
            layout,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Resize `region` to `new_bytes`, preserving the common prefix.
    ///
    /// Growth is zero-filled. On failure the region is left untouched.
    pub fn reallocate(
        &self,
        region: &mut RawRegion,
        new_bytes: usize,
        stack_id: Option<u64>,
    ) -> Result<(), StackError> {
        let new_layout = region_layout(new_bytes)?;
        let old_addr = region.addr();
        let old_bytes = region.len();

        // SAFETY: region.ptr came from this allocator with region.layout, the
        // new size is non-zero and fits isize (checked by region_layout).
        let raw = unsafe { std::alloc::realloc(region.ptr.as_ptr(), region.layout, new_bytes) };

        let mut entry = LogEntry::new(String::new(), LogLevel::Debug, "reallocate")
            .with_old_address(old_addr)
            .with_old_bytes(old_bytes)
            .with_address(raw as usize)
            .with_bytes(new_bytes);
        if let Some(id) = stack_id {
            entry = entry.with_stack(id);
        }
        self.record(entry);

        let Some(ptr) = NonNull::new(raw) else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(StackError::Memory { bytes: new_bytes });
        };
        region.ptr = ptr;
        region.layout = new_layout;
        if new_bytes > old_bytes {
            // SAFETY: [old_bytes, new_bytes) lies inside the new block and
            // realloc leaves it uninitialized.
            unsafe { std::ptr::write_bytes(ptr.as_ptr().add(old_bytes), 0, new_bytes - old_bytes) };
        }

        self.counters.reallocations.fetch_add(1, Ordering::Relaxed);
        region.counters.live_bytes.fetch_sub(old_bytes, Ordering::Relaxed);
        region.counters.live_bytes.fetch_add(new_bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Release `region`.
    pub fn free(&self, region: RawRegion, stack_id: Option<u64>) {
        let mut entry = LogEntry::new(String::new(), LogLevel::Debug, "free")
            .with_address(region.addr())
            .with_bytes(region.len());
        if let Some(id) = stack_id {
            entry = entry.with_stack(id);
        }
        self.record(entry);

        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        drop(region);
    }
}

fn region_layout(bytes: usize) -> Result<Layout, StackError> {
    if bytes == 0 {
        return Err(StackError::Memory { bytes });
    }
    Layout::from_size_align(bytes, REGION_ALIGN).map_err(|_| StackError::CapacityOverflow)
}

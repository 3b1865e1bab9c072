//! Stack engine.
//!
//! A [`GuardedStack`] owns one heap-pinned header, one data region obtained
//! from an [`AllocationTracker`], the guards selected by its [`Protection`]
//! and, unless disabled, a [`DiagnosticsReporter`].
//!
//! Every operation goes through one guarded path:
//!
//! ```text
//! verify -> body -> seal -> verify
//! ```
//!
//! A failure anywhere on that path (other than an empty pop) writes exactly
//! one dump record, logs it, tears the stack down and returns the error.
//! Every later call on the handle returns [`StackError::Null`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::canary::session_token;
use crate::config::{self, Protection};
use crate::dump::{CallSite, DiagnosticsConfig, DiagnosticsReporter, DumpView};
use crate::error::{StackError, Violation};
use crate::guard::{GuardSet, StackHeader, VerifyStrategy};
use crate::layout::RegionLayout;
use crate::metrics::{StackMetrics, global_metrics};
use crate::structured_log::{LogEntry, LogLevel};
use crate::tracker::{AllocationTracker, RawRegion};

static NEXT_STACK_ID: AtomicU64 = AtomicU64::new(1);

/// Configures and constructs a [`GuardedStack`].
///
/// Diagnostics are mandatory: either pass a full [`DiagnosticsConfig`] or opt
/// out explicitly with [`without_diagnostics`](Self::without_diagnostics).
#[derive(Debug)]
pub struct StackBuilder {
    capacity: usize,
    element_size: usize,
    protection: Protection,
    diagnostics: Option<DiagnosticsConfig>,
    diagnostics_disabled: bool,
    tracker: AllocationTracker,
    canary_seed: Option<u64>,
}

impl StackBuilder {
    /// Stack of `capacity` initial slots of `element_size` bytes each.
    #[must_use]
    pub fn new(capacity: usize, element_size: usize) -> Self {
        Self {
            capacity,
            element_size,
            protection: config::protection(),
            diagnostics: None,
            diagnostics_disabled: false,
            tracker: AllocationTracker::new(),
            canary_seed: None,
        }
    }

    /// Override the process default protection level.
    #[must_use]
    pub fn protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    #[must_use]
    pub fn diagnostics(mut self, config: DiagnosticsConfig) -> Self {
        self.diagnostics = Some(config);
        self.diagnostics_disabled = false;
        self
    }

    /// Build without a dump sink. Failures are still detected and logged.
    #[must_use]
    pub fn without_diagnostics(mut self) -> Self {
        self.diagnostics = None;
        self.diagnostics_disabled = true;
        self
    }

    /// Route every allocation through `tracker`.
    #[must_use]
    pub fn tracker(mut self, tracker: AllocationTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Pin the canary session token, for reproducible dumps.
    #[must_use]
    pub fn canary_seed(mut self, seed: u64) -> Self {
        self.canary_seed = Some(seed);
        self
    }

    /// Allocate, seal and self-verify a new stack.
    ///
    /// Nothing is left behind on failure: a partially built stack is torn
    /// down before the error is returned.
    #[track_caller]
    pub fn build(self) -> Result<GuardedStack, StackError> {
        let site = CallSite::here("init");
        let guards = GuardSet::new(self.protection, self.canary_seed.unwrap_or_else(session_token));

        let checked = RegionLayout::new(self.capacity, self.element_size, guards.has_canaries())
            .and_then(|layout| {
                let diagnostics = match (self.diagnostics, self.diagnostics_disabled) {
                    (Some(config), _) => {
                        config.validate()?;
                        Some(config)
                    }
                    (None, true) => None,
                    (None, false) => return Err(StackError::MissingDiagnostics("diagnostics")),
                };
                Ok((layout, diagnostics))
            });
        let (layout, diagnostics) = match checked {
            Ok(parts) => parts,
            Err(err) => {
                self.tracker.record(
                    LogEntry::new(String::new(), LogLevel::Warn, "input_rejected")
                        .with_op(site.op)
                        .with_error(err.code_name())
                        .with_call_site(site.to_string()),
                );
                return Err(err);
            }
        };

        let id = NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed);
        let tracker = self.tracker;
        let region = tracker.allocate(layout.total_size(), Some(id))?;
        let reporter = match diagnostics.map(DiagnosticsReporter::open).transpose() {
            Ok(reporter) => reporter,
            Err(err) => {
                tracker.free(region, Some(id));
                return Err(err);
            }
        };

        let header = StackHeader::new(self.capacity, self.element_size, region.addr() + layout.data_offset());
        let mut state = Box::new(StackState {
            header,
            region,
            layout,
            guards,
            reporter,
            tracker,
            id,
        });
        state.seal();

        let mut stack = GuardedStack {
            id,
            state: Some(state),
        };
        if let Err(violation) = stack.check() {
            return Err(stack.fail(site, violation.into()));
        }

        StackMetrics::inc(&global_metrics().constructions);
        if let Some(state) = stack.state.as_deref() {
            let entry = state.event(LogLevel::Info, "stack_created", site).map(|entry| {
                entry
                    .with_address(state.region.addr())
                    .with_bytes(state.region.len())
                    .with_details(serde_json::json!({
                        "protection": self.protection,
                        "element_size": state.header.element_size,
                        "init_capacity": state.header.init_capacity,
                    }))
            });
            state.emit(entry);
        }
        Ok(stack)
    }
}

/// Everything one live stack owns.
pub(crate) struct StackState {
    pub(crate) header: StackHeader,
    pub(crate) region: RawRegion,
    pub(crate) layout: RegionLayout,
    pub(crate) guards: GuardSet,
    pub(crate) reporter: Option<DiagnosticsReporter>,
    tracker: AllocationTracker,
    id: u64,
}

impl StackState {
    fn seal(&mut self) {
        self.guards.seal(&mut self.header, &mut self.region, &self.layout);
    }

    /// Structural checks, then canaries, then checksums.
    fn verify(&self) -> Result<(), Violation> {
        StackMetrics::inc(&global_metrics().verifications);
        let header = &self.header;
        if header.data_addr == 0 {
            return Err(Violation::NullData);
        }
        if header.data_addr != self.region.addr() + self.layout.data_offset() {
            return Err(Violation::InvalidData);
        }
        if header.size > header.capacity {
            return Err(Violation::IncorrectSize);
        }
        if header.capacity < header.init_capacity {
            return Err(Violation::InvalidCapacity);
        }
        if header.capacity != self.layout.capacity() || header.element_size != self.layout.element_size() {
            return Err(Violation::InvalidData);
        }
        if self.reporter.as_ref().is_some_and(|r| !r.is_open()) {
            return Err(Violation::SinkClosed);
        }
        self.guards.verify(header, &self.region, &self.layout)
    }

    fn view(&self) -> DumpView<'_> {
        DumpView {
            stack_addr: std::ptr::from_ref(&self.header) as usize,
            header: &self.header,
            region: &self.region,
            layout: &self.layout,
            canaries: self.guards.has_canaries(),
            hashes: self.guards.has_hashes(),
        }
    }

    /// Write one record; `Ok(false)` when diagnostics are disabled.
    fn dump(&mut self, reason: &str, site: CallSite) -> std::io::Result<bool> {
        let Some(mut reporter) = self.reporter.take() else {
            return Ok(false);
        };
        let written = reporter.write_record(&self.view(), reason, site);
        self.reporter = Some(reporter);
        written.map(|()| true)
    }

    /// Build an engine event, or `None` when no log is attached.
    fn event(&self, level: LogLevel, event: &str, site: CallSite) -> Option<LogEntry> {
        self.tracker.log()?;
        Some(
            LogEntry::new(String::new(), level, event)
                .with_stack(self.id)
                .with_op(site.op)
                .with_shape(self.header.size, self.header.capacity)
                .with_call_site(site.to_string()),
        )
    }

    fn emit(&self, entry: Option<LogEntry>) {
        if let Some(entry) = entry {
            self.tracker.record(entry);
        }
    }

    /// Reallocate the region for `new_capacity` slots.
    ///
    /// Bytes past the old data end are zeroed so new slots start poisoned and
    /// stale sentinels never survive inside the data region.
    fn resize(&mut self, new_capacity: usize, site: CallSite) -> Result<(), StackError> {
        let new_layout = self.layout.with_capacity(new_capacity)?;
        let old_layout = self.layout;
        let old_addr = self.region.addr();
        let old_capacity = self.header.capacity;

        self.tracker
            .reallocate(&mut self.region, new_layout.total_size(), Some(self.id))?;
        self.region
            .zero(old_layout.data_end().min(new_layout.data_end())..new_layout.total_size());

        self.layout = new_layout;
        self.header.capacity = new_capacity;
        self.header.data_addr = self.region.addr() + new_layout.data_offset();
        self.header.generation = self.header.generation.wrapping_add(1);

        let metrics = global_metrics();
        if new_capacity > old_capacity {
            StackMetrics::inc(&metrics.grows);
        } else {
            StackMetrics::inc(&metrics.shrinks);
        }
        let entry = self.event(LogLevel::Debug, "stack_resized", site).map(|entry| {
            entry
                .with_old_address(old_addr)
                .with_address(self.region.addr())
                .with_details(serde_json::json!({
                    "old_capacity": old_capacity,
                    "new_capacity": new_capacity,
                }))
        });
        self.emit(entry);
        Ok(())
    }

    fn push(&mut self, element: &[u8], site: CallSite) -> Result<(), StackError> {
        if self.header.size == self.header.capacity {
            let doubled = self
                .header
                .capacity
                .checked_mul(2)
                .ok_or(StackError::CapacityOverflow)?;
            self.resize(doubled, site)?;
        }
        let range = self.layout.slot_range(self.header.size);
        let slot = self
            .region
            .as_mut_slice()
            .get_mut(range)
            .ok_or(StackError::Copy)?;
        slot.copy_from_slice(element);
        if slot != element {
            return Err(StackError::Copy);
        }
        self.header.size += 1;
        StackMetrics::inc(&global_metrics().pushes);
        Ok(())
    }

    fn pop(&mut self, out: &mut [u8], site: CallSite) -> Result<(), StackError> {
        if self.header.size == 0 {
            StackMetrics::inc(&global_metrics().empty_pops);
            return Err(StackError::Empty);
        }
        if let Some(target) = shrink_target(&self.header) {
            self.resize(target, site)?;
        }
        self.header.size -= 1;
        let range = self.layout.slot_range(self.header.size);
        let slot = self
            .region
            .as_mut_slice()
            .get_mut(range)
            .ok_or(StackError::Copy)?;
        out.copy_from_slice(slot);
        slot.fill(0);
        if slot.iter().any(|&b| b != 0) {
            return Err(StackError::Copy);
        }
        StackMetrics::inc(&global_metrics().pops);
        Ok(())
    }

    fn peek(&self) -> Result<Vec<u8>, StackError> {
        let Some(top) = self.header.size.checked_sub(1) else {
            return Err(StackError::Empty);
        };
        self.region
            .as_slice()
            .get(self.layout.slot_range(top))
            .map(<[u8]>::to_vec)
            .ok_or(StackError::Copy)
    }

    /// Close the sink and free the region.
    fn release(self: Box<Self>, site: CallSite) -> std::io::Result<()> {
        let entry = self.event(LogLevel::Info, "stack_destroyed", site);
        let Self {
            region,
            reporter,
            tracker,
            id,
            ..
        } = *self;
        let closed = match reporter {
            Some(mut reporter) => reporter.close(),
            None => Ok(()),
        };
        tracker.free(region, Some(id));
        if let Some(entry) = entry {
            tracker.record(entry);
        }
        closed
    }
}

/// Capacity to shrink to before popping, if any.
///
/// Shrinks when the stack is at most a quarter full and above its initial
/// capacity, to `capacity / 4 + capacity % 4` clamped to `init_capacity`.
#[must_use]
pub fn shrink_target(header: &StackHeader) -> Option<usize> {
    let capacity = header.capacity;
    if header.size.saturating_mul(4) > capacity || capacity <= header.init_capacity {
        return None;
    }
    let target = (capacity / 4 + capacity % 4).max(header.init_capacity);
    (target != capacity).then_some(target)
}

/// Self-verifying resizable stack of fixed-size opaque elements.
pub struct GuardedStack {
    id: u64,
    state: Option<Box<StackState>>,
}

impl GuardedStack {
    /// Shorthand for [`StackBuilder::new`].
    #[must_use]
    pub fn builder(capacity: usize, element_size: usize) -> StackBuilder {
        StackBuilder::new(capacity, element_size)
    }

    /// Push one element of exactly `element_size` bytes, doubling capacity
    /// when full.
    #[track_caller]
    pub fn push(&mut self, element: &[u8]) -> Result<(), StackError> {
        let site = CallSite::here("push");
        let expected = self.live()?.header.element_size;
        if element.len() != expected {
            return Err(self.reject(site, StackError::InvalidInput {
                expected,
                got: element.len(),
            }));
        }
        self.guarded(site, |state| state.push(element, site))
    }

    /// Pop the top element into `out`, which must be `element_size` bytes.
    ///
    /// An empty stack returns [`StackError::Empty`] and is left untouched.
    #[track_caller]
    pub fn pop(&mut self, out: &mut [u8]) -> Result<(), StackError> {
        let site = CallSite::here("pop");
        let expected = self.live()?.header.element_size;
        if out.len() != expected {
            return Err(self.reject(site, StackError::InvalidOutput {
                expected,
                got: out.len(),
            }));
        }
        self.guarded(site, |state| state.pop(out, site))
    }

    /// Pop the top element into a fresh buffer.
    #[track_caller]
    pub fn pop_vec(&mut self) -> Result<Vec<u8>, StackError> {
        let mut out = vec![0u8; self.live()?.header.element_size];
        self.pop(&mut out)?;
        Ok(out)
    }

    /// Copy of the top element, after a full verification.
    #[track_caller]
    pub fn peek(&mut self) -> Result<Vec<u8>, StackError> {
        let site = CallSite::here("peek");
        self.guarded(site, |state| state.peek())
    }

    /// Run every check and apply the failure policy.
    #[track_caller]
    pub fn verify(&mut self) -> Result<(), StackError> {
        let site = CallSite::here("verify");
        self.guarded(site, |_| Ok(()))
    }

    /// Write a dump record on demand, naming `reason` as its trigger.
    ///
    /// A no-op without diagnostics. A failed write tears the stack down.
    #[track_caller]
    pub fn dump(&mut self, reason: &str) -> Result<(), StackError> {
        let site = CallSite::here("dump");
        self.guarded(site, |state| match state.dump(reason, site) {
            Ok(written) => {
                if written {
                    StackMetrics::inc(&global_metrics().dumps);
                }
                Ok(())
            }
            Err(err) => {
                StackMetrics::inc(&global_metrics().dump_failures);
                Err(StackError::Dump(err))
            }
        })
    }

    /// Close the sink and release the allocation.
    ///
    /// The handle is dead afterwards; a second call returns
    /// [`StackError::Null`].
    #[track_caller]
    pub fn destroy(&mut self) -> Result<(), StackError> {
        let site = CallSite::here("destroy");
        let state = self.state.take().ok_or(StackError::Null)?;
        state.release(site).map_err(StackError::Dump)
    }

    /// Process-unique id, stable after teardown.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.state.is_some()
    }

    /// Live element count; zero once the handle is dead.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.header.size)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.header.capacity)
    }

    #[must_use]
    pub fn init_capacity(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.header.init_capacity)
    }

    #[must_use]
    pub fn element_size(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.header.element_size)
    }

    /// Header of a live stack.
    #[must_use]
    pub fn header(&self) -> Option<&StackHeader> {
        self.state.as_ref().map(|s| &s.header)
    }

    /// Dump sink path, when diagnostics are enabled.
    #[must_use]
    pub fn dump_path(&self) -> Option<&std::path::Path> {
        self.state.as_ref()?.reporter.as_ref().map(DiagnosticsReporter::path)
    }

    /// Dump records written so far.
    #[must_use]
    pub fn dump_records(&self) -> usize {
        self.state
            .as_ref()
            .and_then(|s| s.reporter.as_ref())
            .map_or(0, DiagnosticsReporter::records)
    }

    #[must_use]
    pub fn protection(&self) -> Option<&'static str> {
        self.state.as_ref().map(|s| s.guards.name())
    }

    pub(crate) fn state_mut(&mut self) -> Option<&mut StackState> {
        self.state.as_deref_mut()
    }

    fn live(&self) -> Result<&StackState, StackError> {
        self.state.as_deref().ok_or(StackError::Null)
    }

    fn check(&self) -> Result<(), Violation> {
        match self.state.as_deref() {
            Some(state) => state.verify(),
            None => Ok(()),
        }
    }

    /// Log a rejected argument; the stack is left as it was.
    fn reject(&self, site: CallSite, err: StackError) -> StackError {
        if let Some(state) = self.state.as_deref() {
            let entry = state
                .event(LogLevel::Warn, "input_rejected", site)
                .map(|entry| entry.with_error(err.code_name()));
            state.emit(entry);
        }
        err
    }

    /// verify -> body -> seal -> verify, with uniform failure handling.
    fn guarded<T>(
        &mut self,
        site: CallSite,
        body: impl FnOnce(&mut StackState) -> Result<T, StackError>,
    ) -> Result<T, StackError> {
        let Some(state) = self.state.as_deref_mut() else {
            return Err(StackError::Null);
        };
        if let Err(violation) = state.verify() {
            return Err(self.fail(site, violation.into()));
        }
        let value = match body(state) {
            Ok(value) => value,
            Err(err) if !err.consumes_stack() => return Err(err),
            Err(err) => return Err(self.fail(site, err)),
        };
        state.seal();
        if let Err(violation) = state.verify() {
            return Err(self.fail(site, violation.into()));
        }
        Ok(value)
    }

    /// Dump once, log, tear down. Returns the error to hand the caller.
    fn fail(&mut self, site: CallSite, err: StackError) -> StackError {
        let Some(mut state) = self.state.take() else {
            return err;
        };
        let metrics = global_metrics();
        let mut result = err;

        if let Some(violation) = result.violation() {
            StackMetrics::inc(&metrics.violations);
            let entry = state
                .event(LogLevel::Error, "violation_detected", site)
                .map(|entry| entry.with_error(violation.name()));
            state.emit(entry);
        }

        // A closed sink cannot take its own report, and a failed dump is not
        // retried.
        let sink_open = state.reporter.as_ref().is_some_and(DiagnosticsReporter::is_open);
        if let StackError::Dump(source) = &result {
            let entry = state.event(LogLevel::Error, "dump_failed", site).map(|entry| {
                entry
                    .with_error(result.code_name())
                    .with_details(serde_json::json!({ "io_error": source.to_string() }))
            });
            state.emit(entry);
        } else if sink_open {
            match state.dump(result.code_name(), site) {
                Ok(_) => {
                    StackMetrics::inc(&metrics.dumps);
                    let entry = state
                        .event(LogLevel::Info, "dump_written", site)
                        .map(|entry| entry.with_error(result.code_name()));
                    state.emit(entry);
                }
                Err(source) => {
                    StackMetrics::inc(&metrics.dump_failures);
                    let entry = state.event(LogLevel::Error, "dump_failed", site).map(|entry| {
                        entry
                            .with_error(result.code_name())
                            .with_details(serde_json::json!({ "io_error": source.to_string() }))
                    });
                    state.emit(entry);
                    result = StackError::DumpFailed {
                        trigger: Box::new(result),
                        source,
                    };
                }
            }
        }

        StackMetrics::inc(&metrics.teardowns);
        // The sink may already be the failing part; teardown is best effort.
        let _ = state.release(site);
        result
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let _ = state.release(CallSite::here("drop"));
        }
    }
}

impl std::fmt::Debug for GuardedStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("GuardedStack");
        s.field("id", &self.id);
        match self.state.as_deref() {
            Some(state) => s
                .field("size", &state.header.size)
                .field("capacity", &state.header.capacity)
                .field("element_size", &state.header.element_size)
                .field("protection", &state.guards.name())
                .finish(),
            None => s.field("live", &false).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::canary::Sentinel;
    use crate::dump::{ElementFormatter, Provenance, ascii, record_errors};
    use crate::structured_log::SharedBuffer;
    use crate::tracker::AllocationLog;

    fn config(dir: &tempfile::TempDir) -> DiagnosticsConfig {
        DiagnosticsConfig::new(dir.path().join("stack.dump"), crate::provenance!(stack), ascii)
    }

    fn letters(dir: &tempfile::TempDir) -> GuardedStack {
        StackBuilder::new(3, 1)
            .protection(Protection::Full)
            .diagnostics(config(dir))
            .build()
            .unwrap()
    }

    fn dump_text(dir: &tempfile::TempDir) -> String {
        std::fs::read_to_string(dir.path().join("stack.dump")).unwrap()
    }

    fn refuse(_out: &mut dyn std::io::Write, _element: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::other("formatter refused"))
    }

    /// Fails on its first call only.
    struct FailsOnce(Arc<AtomicUsize>);

    impl ElementFormatter for FailsOnce {
        fn format(&self, out: &mut dyn std::io::Write, element: &[u8]) -> std::io::Result<()> {
            if self.0.fetch_add(1, Ordering::Relaxed) == 0 {
                return Err(std::io::Error::other("transient"));
            }
            ascii(out, element)
        }
    }

    fn with_formatter(
        dir: &tempfile::TempDir,
        tracker: &AllocationTracker,
        formatter: impl ElementFormatter + 'static,
    ) -> GuardedStack {
        let config = DiagnosticsConfig::new(dir.path().join("stack.dump"), crate::provenance!(stack), formatter);
        StackBuilder::new(2, 1)
            .protection(Protection::Full)
            .diagnostics(config)
            .tracker(tracker.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn reference_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = letters(&dir);
        for b in *b"abc" {
            stack.push(&[b]).unwrap();
            assert_eq!(stack.capacity(), 3);
        }
        stack.push(b"d").unwrap();
        assert_eq!(stack.capacity(), 6);
        assert_eq!(stack.len(), 4);

        let mut popped = Vec::new();
        let mut capacities = Vec::new();
        for _ in 0..4 {
            popped.push(stack.pop_vec().unwrap()[0]);
            capacities.push(stack.capacity());
        }
        assert_eq!(popped, b"dcba");
        assert_eq!(capacities, [6, 6, 6, 3]);

        let mut out = [0u8];
        assert!(matches!(stack.pop(&mut out), Err(StackError::Empty)));
        assert!(stack.is_live());
        stack.destroy().unwrap();
        assert!(dump_text(&dir).is_empty());
    }

    #[test]
    fn empty_pop_leaves_stack_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = letters(&dir);
        let before = stack.header().cloned();
        let mut out = [7u8];
        for _ in 0..3 {
            assert!(matches!(stack.pop(&mut out), Err(StackError::Empty)));
        }
        assert_eq!(out, [7]);
        assert_eq!(stack.header().cloned(), before);
        stack.verify().unwrap();
    }

    #[test]
    fn zero_element_size_allocates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = AllocationTracker::new();
        let err = StackBuilder::new(3, 0)
            .diagnostics(config(&dir))
            .tracker(tracker.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, StackError::ZeroElementSize));
        assert_eq!(tracker.snapshot().allocations, 0);
        assert!(!dir.path().join("stack.dump").exists());
    }

    #[test]
    fn zero_capacity_and_missing_diagnostics_are_rejected() {
        assert!(matches!(
            StackBuilder::new(0, 4).without_diagnostics().build(),
            Err(StackError::ZeroCapacity)
        ));
        assert!(matches!(
            StackBuilder::new(2, 4).build(),
            Err(StackError::MissingDiagnostics("diagnostics"))
        ));
        let dir = tempfile::tempdir().unwrap();
        let anonymous = DiagnosticsConfig::new(dir.path().join("x.dump"), Provenance::new("a.rs", 1, "", "f"), ascii);
        assert!(matches!(
            StackBuilder::new(2, 4).diagnostics(anonymous).build(),
            Err(StackError::MissingDiagnostics("var_name"))
        ));
    }

    #[test]
    fn unopenable_sink_frees_the_region() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = AllocationTracker::new();
        let config = DiagnosticsConfig::new(dir.path().join("missing").join("x.dump"), crate::provenance!(stack), ascii);
        let err = StackBuilder::new(2, 2)
            .diagnostics(config)
            .tracker(tracker.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, StackError::Dump(_)));
        let snap = tracker.snapshot();
        assert_eq!(snap.allocations, 1);
        assert_eq!(snap.frees, 1);
        assert_eq!(snap.live_regions, 0);
    }

    #[test]
    fn wrong_sized_buffers_keep_the_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = StackBuilder::new(2, 4).diagnostics(config(&dir)).build().unwrap();
        assert!(matches!(
            stack.push(b"abc"),
            Err(StackError::InvalidInput { expected: 4, got: 3 })
        ));
        stack.push(b"abcd").unwrap();
        let mut small = [0u8; 2];
        assert!(matches!(
            stack.pop(&mut small),
            Err(StackError::InvalidOutput { expected: 4, got: 2 })
        ));
        assert!(stack.is_live());
        assert_eq!(stack.pop_vec().unwrap(), b"abcd");
    }

    #[test]
    fn shrink_is_clamped_to_init_capacity() {
        let header = StackHeader {
            size: 1,
            capacity: 8,
            init_capacity: 5,
            ..StackHeader::new(8, 1, 0x10)
        };
        // 8 / 4 + 8 % 4 = 2, clamped up to 5.
        assert_eq!(shrink_target(&header), Some(5));

        let header = StackHeader {
            size: 1,
            capacity: 12,
            init_capacity: 3,
            ..StackHeader::new(12, 1, 0x10)
        };
        assert_eq!(shrink_target(&header), Some(3));

        let at_floor = StackHeader {
            size: 0,
            capacity: 3,
            init_capacity: 3,
            ..StackHeader::new(3, 1, 0x10)
        };
        assert_eq!(shrink_target(&at_floor), None);

        let busy = StackHeader {
            size: 2,
            capacity: 6,
            init_capacity: 3,
            ..StackHeader::new(6, 1, 0x10)
        };
        assert_eq!(shrink_target(&busy), None);
    }

    #[test]
    fn shrink_never_goes_below_init_capacity() {
        let mut stack = StackBuilder::new(5, 2).without_diagnostics().build().unwrap();
        for i in 0..40u16 {
            stack.push(&i.to_le_bytes()).unwrap();
        }
        for i in (0..40u16).rev() {
            assert_eq!(stack.pop_vec().unwrap(), i.to_le_bytes());
            assert!(stack.capacity() >= 5);
            assert!(stack.len() <= stack.capacity());
        }
        assert_eq!(stack.capacity(), 5);
    }

    #[test]
    fn canary_overwrite_dumps_once_and_consumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = letters(&dir);
        stack.push(b"x").unwrap();
        stack
            .fault_injector()
            .unwrap()
            .overwrite_sentinel(Sentinel::DataRight, 0xDEAD);

        let err = stack.push(b"y").unwrap_err();
        assert!(matches!(err, StackError::Corrupted(Violation::DataRightCanary)));
        assert!(!stack.is_live());
        assert!(matches!(stack.push(b"z"), Err(StackError::Null)));
        assert!(matches!(stack.destroy(), Err(StackError::Null)));

        let text = dump_text(&dir);
        assert_eq!(record_errors(&text), ["STACK_UNEXPECTED_DATA_RIGHT_CANARY"]);
        assert!(text.contains("'push'"));
        assert!(text.contains(file!()));
    }

    #[test]
    fn poisoned_write_is_caught_by_data_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = letters(&dir);
        stack.push(b"x").unwrap();
        assert!(stack.fault_injector().unwrap().write_data(2, b'!'));
        let err = stack.pop_vec().unwrap_err();
        assert!(matches!(err, StackError::Corrupted(Violation::DataHash)));
        assert_eq!(record_errors(&dump_text(&dir)), ["STACK_UNEXPECTED_DATA_HASH"]);
    }

    #[test]
    fn on_demand_dump_keeps_the_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = letters(&dir);
        stack.push(b"q").unwrap();
        stack.dump("STACK_SUCCESS").unwrap();
        stack.dump("checkpoint").unwrap();
        assert!(stack.is_live());
        assert_eq!(stack.dump_records(), 2);
        let text = dump_text(&dir);
        assert_eq!(record_errors(&text), ["STACK_SUCCESS", "checkpoint"]);
        assert!(text.contains("\t    [0] = q;"));
    }

    #[test]
    fn closed_sink_is_reported_without_a_dump() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = letters(&dir);
        stack.fault_injector().unwrap().close_sink();
        let err = stack.verify().unwrap_err();
        assert!(matches!(err, StackError::Corrupted(Violation::SinkClosed)));
        assert!(dump_text(&dir).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_dump_reports_both_causes() {
        let config = DiagnosticsConfig::new("/dev/full", crate::provenance!(stack), ascii);
        let mut stack = StackBuilder::new(2, 1).diagnostics(config).build().unwrap();
        stack.fault_injector().unwrap().set_size(9);
        match stack.push(b"a").unwrap_err() {
            StackError::DumpFailed { trigger, .. } => {
                assert!(matches!(*trigger, StackError::Corrupted(Violation::IncorrectSize)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!stack.is_live());
    }

    #[test]
    fn refusing_formatter_on_violation_reports_both_causes() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = AllocationTracker::new();
        let mut stack = with_formatter(&dir, &tracker, refuse);
        stack.push(b"x").unwrap();
        stack
            .fault_injector()
            .unwrap()
            .overwrite_sentinel(Sentinel::DataLeft, 0);

        let err = stack.push(b"y").unwrap_err();
        assert_eq!(err.code_name(), "STACK_DUMP_ERROR");
        assert_eq!(err.violation(), Some(Violation::DataLeftCanary));
        match err {
            StackError::DumpFailed { trigger, source } => {
                assert!(matches!(*trigger, StackError::Corrupted(Violation::DataLeftCanary)));
                assert_eq!(source.to_string(), "formatter refused");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!stack.is_live());
        assert_eq!(tracker.snapshot().live_regions, 0);
        assert!(dump_text(&dir).is_empty());
    }

    #[test]
    fn refusing_formatter_on_demand_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = AllocationTracker::new();
        let mut stack = with_formatter(&dir, &tracker, refuse);
        stack.push(b"x").unwrap();

        assert!(matches!(stack.dump("checkpoint"), Err(StackError::Dump(_))));
        assert!(!stack.is_live());
        assert!(matches!(stack.dump("again"), Err(StackError::Null)));
        let snap = tracker.snapshot();
        assert_eq!(snap.live_regions, 0);
        assert_eq!(snap.frees, 1);
        assert!(dump_text(&dir).is_empty());
    }

    #[test]
    fn failed_on_demand_dump_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut stack = with_formatter(&dir, &AllocationTracker::new(), FailsOnce(Arc::clone(&calls)));
        stack.push(b"q").unwrap();

        assert!(matches!(stack.dump("checkpoint"), Err(StackError::Dump(_))));
        assert!(!stack.is_live());
        // The second call would have succeeded and left a record behind.
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(record_errors(&dump_text(&dir)).is_empty());
    }

    #[test]
    fn dump_failure_on_any_trigger_reaches_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = AllocationTracker::new();
        let mut stack = with_formatter(&dir, &tracker, refuse);
        stack.push(b"x").unwrap();

        let err = stack.fail(CallSite::here("push"), StackError::Memory { bytes: 64 });
        assert_eq!(err.code_name(), "STACK_DUMP_ERROR");
        assert_eq!(err.violation(), None);
        match err {
            StackError::DumpFailed { trigger, .. } => {
                assert!(matches!(*trigger, StackError::Memory { bytes: 64 }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!stack.is_live());
        assert_eq!(tracker.snapshot().live_regions, 0);
    }

    #[test]
    fn drop_releases_everything() {
        let tracker = AllocationTracker::new();
        {
            let mut stack = StackBuilder::new(2, 8).without_diagnostics().tracker(tracker.clone()).build().unwrap();
            stack.push(&1u64.to_le_bytes()).unwrap();
            stack.push(&2u64.to_le_bytes()).unwrap();
            stack.push(&3u64.to_le_bytes()).unwrap();
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.live_regions, 0);
        assert_eq!(snap.live_bytes, 0);
        assert_eq!(snap.reallocations, 1);
    }

    #[test]
    fn protection_levels_all_round_trip() {
        for protection in Protection::ALL {
            let mut stack = StackBuilder::new(2, 3)
                .protection(protection)
                .without_diagnostics()
                .build()
                .unwrap();
            for chunk in [b"one", b"two", b"six", b"ten", b"red"] {
                stack.push(chunk).unwrap();
            }
            assert_eq!(stack.peek().unwrap(), b"red");
            assert_eq!(stack.pop_vec().unwrap(), b"red");
            assert_eq!(stack.pop_vec().unwrap(), b"ten");
            assert_eq!(stack.protection(), Some(GuardSet::new(protection, 0).name()));
        }
    }

    #[test]
    fn engine_events_reach_the_allocation_log() {
        let buffer = SharedBuffer::new();
        let log = Arc::new(AllocationLog::to_buffer(buffer.clone()));
        let mut stack = StackBuilder::new(1, 1)
            .without_diagnostics()
            .tracker(AllocationTracker::with_log(Arc::clone(&log)))
            .build()
            .unwrap();
        stack.push(b"a").unwrap();
        stack.push(b"b").unwrap();
        let _ = stack.push(b"too long");
        stack.destroy().unwrap();
        log.shutdown().unwrap();

        let text = buffer.contents();
        let events: Vec<String> = text
            .lines()
            .map(|line| {
                let v: serde_json::Value = serde_json::from_str(line).unwrap();
                v["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            events,
            [
                "log_open",
                "allocate",
                "stack_created",
                "reallocate",
                "stack_resized",
                "input_rejected",
                "free",
                "stack_destroyed",
                "log_close",
            ]
        );
        let (_, errors) = crate::structured_log::validate_log_text(&text);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn pinned_seed_reproduces_canaries() {
        let build = || {
            StackBuilder::new(2, 2)
                .canary_seed(42)
                .without_diagnostics()
                .build()
                .unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(
            a.header().map(StackHeader::left_canary),
            b.header().map(StackHeader::left_canary)
        );
    }
}

//! Out-of-band corruption of a live stack.
//!
//! Every write here bypasses the guards, so the next guarded operation sees
//! the stack the way a stray pointer would have left it. Used by tests and
//! by the harness drills.

use crate::canary::{Sentinel, position_of};
use crate::layout::SENTINEL_SIZE;
use crate::stack::{GuardedStack, StackState};

/// Mutable access to a stack's raw state.
pub struct FaultInjector<'a> {
    state: &'a mut StackState,
}

impl GuardedStack {
    /// Injector for this stack, or `None` once it is torn down.
    pub fn fault_injector(&mut self) -> Option<FaultInjector<'_>> {
        self.state_mut().map(|state| FaultInjector { state })
    }
}

impl FaultInjector<'_> {
    /// Store `value` in place of a sentinel.
    ///
    /// Data sentinels only exist when canaries are enabled; returns false
    /// when there is nothing to overwrite.
    pub fn overwrite_sentinel(&mut self, site: Sentinel, value: u64) -> bool {
        match site {
            Sentinel::StructureLeft => self.state.header.left_canary = value,
            Sentinel::StructureRight => self.state.header.right_canary = value,
            Sentinel::DataLeft | Sentinel::DataRight => {
                if !self.state.layout.has_sentinels() {
                    return false;
                }
                let offset = position_of(site, &self.state.layout);
                return self.write_raw(offset, &value.to_le_bytes());
            }
        }
        true
    }

    /// Write one byte at `offset` into the data region, live or poisoned.
    pub fn write_data(&mut self, offset: usize, byte: u8) -> bool {
        if offset >= self.state.layout.data_len() {
            return false;
        }
        let at = self.state.layout.data_offset() + offset;
        self.write_raw(at, &[byte])
    }

    /// Write `bytes` starting right after the last data byte, through the
    /// padding and into the right data sentinel. Truncated at the region end.
    pub fn overrun(&mut self, bytes: &[u8]) -> usize {
        self.spill(self.state.layout.data_end(), bytes)
    }

    /// Write `bytes` ending right before the first data byte.
    pub fn underrun(&mut self, bytes: &[u8]) -> usize {
        let start = self.state.layout.data_offset().saturating_sub(bytes.len());
        let len = bytes.len().min(self.state.layout.data_offset());
        self.spill(start, &bytes[bytes.len() - len..])
    }

    pub fn set_size(&mut self, size: usize) {
        self.state.header.size = size;
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.state.header.capacity = capacity;
    }

    /// Shift the recorded data address by `delta` bytes.
    pub fn misplace_data(&mut self, delta: isize) {
        let header = &mut self.state.header;
        header.data_addr = header.data_addr.wrapping_add_signed(delta);
    }

    /// Forget the data address entirely.
    pub fn null_data(&mut self) {
        self.state.header.data_addr = 0;
    }

    /// Flip the stored structure checksum.
    pub fn flip_structure_hash(&mut self) {
        self.state.header.structure_hash ^= 1;
    }

    /// Close the dump sink behind the reporter's back.
    pub fn close_sink(&mut self) -> bool {
        match self.state.reporter.as_mut() {
            Some(reporter) => reporter.close().is_ok(),
            None => false,
        }
    }

    fn write_raw(&mut self, offset: usize, bytes: &[u8]) -> bool {
        let end = offset.saturating_add(bytes.len());
        match self.state.region.as_mut_slice().get_mut(offset..end) {
            Some(target) => {
                target.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn spill(&mut self, start: usize, bytes: &[u8]) -> usize {
        let region = self.state.region.as_mut_slice();
        let len = bytes.len().min(region.len().saturating_sub(start));
        region[start..start + len].copy_from_slice(&bytes[..len]);
        len
    }
}

/// Bytes needed to reach and fully cover the right data sentinel.
#[must_use]
pub fn overrun_reach(stack: &GuardedStack) -> usize {
    stack.header().map_or(0, |header| {
        let data_len = header.capacity() * header.element_size();
        crate::layout::alignment_padding(data_len) + SENTINEL_SIZE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protection;
    use crate::error::{StackError, Violation};
    use crate::stack::StackBuilder;

    fn stack(protection: Protection) -> GuardedStack {
        let mut stack = StackBuilder::new(3, 1)
            .protection(protection)
            .without_diagnostics()
            .build()
            .unwrap();
        stack.push(b"a").unwrap();
        stack
    }

    fn next_violation(stack: &mut GuardedStack) -> Option<Violation> {
        stack.push(b"b").err().and_then(|e| e.violation())
    }

    #[test]
    fn every_sentinel_is_reported_by_name() {
        for site in Sentinel::ALL {
            let mut s = stack(Protection::Full);
            assert!(s.fault_injector().unwrap().overwrite_sentinel(site, 0));
            assert_eq!(next_violation(&mut s), Some(site.violation()));
        }
    }

    #[test]
    fn overrun_reaches_the_right_sentinel() {
        let mut s = stack(Protection::Full);
        let reach = overrun_reach(&s);
        assert_eq!(reach, 5 + 8);
        let written = s.fault_injector().unwrap().overrun(&vec![0x41; reach]);
        assert_eq!(written, reach);
        assert_eq!(next_violation(&mut s), Some(Violation::DataRightCanary));
    }

    #[test]
    fn overrun_into_padding_only_is_invisible() {
        let mut s = stack(Protection::Full);
        s.fault_injector().unwrap().overrun(&[0x41; 5]);
        s.verify().unwrap();
    }

    #[test]
    fn underrun_hits_the_left_sentinel() {
        let mut s = stack(Protection::Full);
        assert_eq!(s.fault_injector().unwrap().underrun(&[0xFF; 2]), 2);
        assert_eq!(next_violation(&mut s), Some(Violation::DataLeftCanary));
    }

    #[test]
    fn structural_faults() {
        let mut s = stack(Protection::Off);
        s.fault_injector().unwrap().set_size(4);
        assert_eq!(next_violation(&mut s), Some(Violation::IncorrectSize));

        let mut s = stack(Protection::Off);
        s.fault_injector().unwrap().set_capacity(2);
        assert_eq!(next_violation(&mut s), Some(Violation::InvalidCapacity));

        let mut s = stack(Protection::Off);
        s.fault_injector().unwrap().set_capacity(7);
        assert_eq!(next_violation(&mut s), Some(Violation::InvalidData));

        let mut s = stack(Protection::Off);
        s.fault_injector().unwrap().misplace_data(8);
        assert_eq!(next_violation(&mut s), Some(Violation::InvalidData));

        let mut s = stack(Protection::Off);
        s.fault_injector().unwrap().null_data();
        assert_eq!(next_violation(&mut s), Some(Violation::NullData));
    }

    #[test]
    fn hash_faults() {
        let mut s = stack(Protection::HashOnly);
        s.fault_injector().unwrap().flip_structure_hash();
        assert_eq!(next_violation(&mut s), Some(Violation::StructureHash));

        let mut s = stack(Protection::Full);
        s.fault_injector().unwrap().set_size(2);
        assert_eq!(next_violation(&mut s), Some(Violation::StructureHash));

        let mut s = stack(Protection::HashOnly);
        assert!(s.fault_injector().unwrap().write_data(0, b'z'));
        assert_eq!(next_violation(&mut s), Some(Violation::DataHash));
    }

    #[test]
    fn unprotected_stack_misses_content_faults() {
        let mut s = stack(Protection::Off);
        assert!(!s.fault_injector().unwrap().overwrite_sentinel(Sentinel::DataLeft, 1));
        assert!(s.fault_injector().unwrap().write_data(2, b'!'));
        s.push(b"b").unwrap();
        assert!(!s.fault_injector().unwrap().close_sink());
    }

    #[test]
    fn dead_stack_has_no_injector() {
        let mut s = stack(Protection::Full);
        s.fault_injector().unwrap().null_data();
        assert!(matches!(
            s.verify(),
            Err(StackError::Corrupted(Violation::NullData))
        ));
        assert!(s.fault_injector().is_none());
    }
}

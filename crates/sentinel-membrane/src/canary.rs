//! Four-sentinel canary guard.
//!
//! Two sentinels bound the stack header, two bound the data region. Each
//! value is a SipHash-2-4 of the sentinel's site, its byte position and the
//! region generation, keyed by a per-stack session token. A stray write over
//! a sentinel, or a sentinel left behind by a reallocation, no longer matches
//! its derivation.

use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Violation;
use crate::guard::{StackHeader, VerifyStrategy};
use crate::layout::{RegionLayout, SENTINEL_SIZE};
use crate::tracker::RawRegion;

/// Constant mixed into every session key.
pub const CANARY_SALT: u64 = 0x0000_C0FF_EEC0_FFEE;

/// Which of the four sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    StructureLeft,
    StructureRight,
    DataLeft,
    DataRight,
}

impl Sentinel {
    /// Verification order.
    pub const ALL: [Self; 4] = [
        Self::StructureLeft,
        Self::StructureRight,
        Self::DataLeft,
        Self::DataRight,
    ];

    const fn tag(self) -> u64 {
        match self {
            Self::StructureLeft => 0x5354_5255_4354_4c00,
            Self::StructureRight => 0x5354_5255_4354_5200,
            Self::DataLeft => 0x4441_5441_4c45_4600,
            Self::DataRight => 0x4441_5441_5249_4700,
        }
    }

    /// The violation reported when this sentinel mismatches.
    #[must_use]
    pub const fn violation(self) -> Violation {
        match self {
            Self::StructureLeft => Violation::LeftCanary,
            Self::StructureRight => Violation::RightCanary,
            Self::DataLeft => Violation::DataLeftCanary,
            Self::DataRight => Violation::DataRightCanary,
        }
    }
}

/// Fresh random session token.
#[must_use]
pub fn session_token() -> u64 {
    static NONCE: AtomicU64 = AtomicU64::new(0);
    RandomState::new().hash_one(NONCE.fetch_add(1, Ordering::Relaxed))
}

/// Derives, writes and checks the four sentinels of one stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanaryGuard {
    key: u64,
}

impl CanaryGuard {
    #[must_use]
    pub const fn new(token: u64) -> Self {
        Self {
            key: token ^ CANARY_SALT,
        }
    }

    /// Expected value of `site` stored at `position` during `generation`.
    #[must_use]
    pub fn expected(&self, site: Sentinel, position: usize, generation: u64) -> u64 {
        sip_hash_2_4(self.key, site.tag() ^ position as u64, generation)
    }

    fn expected_for(&self, site: Sentinel, header: &StackHeader, layout: &RegionLayout) -> u64 {
        self.expected(site, position_of(site, layout), header.generation())
    }

    /// Value currently stored for `site`, if it can be read.
    #[must_use]
    pub fn stored(site: Sentinel, header: &StackHeader, region: &RawRegion, layout: &RegionLayout) -> Option<u64> {
        match site {
            Sentinel::StructureLeft => Some(header.left_canary),
            Sentinel::StructureRight => Some(header.right_canary),
            Sentinel::DataLeft | Sentinel::DataRight => {
                read_sentinel(region.as_slice(), position_of(site, layout))
            }
        }
    }
}

impl VerifyStrategy for CanaryGuard {
    fn name(&self) -> &'static str {
        "canary"
    }

    fn seal(&self, header: &mut StackHeader, region: &mut RawRegion, layout: &RegionLayout) {
        header.left_canary = self.expected_for(Sentinel::StructureLeft, header, layout);
        header.right_canary = self.expected_for(Sentinel::StructureRight, header, layout);
        if !layout.has_sentinels() {
            return;
        }
        for site in [Sentinel::DataLeft, Sentinel::DataRight] {
            let value = self.expected_for(site, header, layout);
            let offset = position_of(site, layout);
            if let Some(slot) = region.as_mut_slice().get_mut(offset..offset + SENTINEL_SIZE) {
                slot.copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    fn verify(&self, header: &StackHeader, region: &RawRegion, layout: &RegionLayout) -> Result<(), Violation> {
        for site in Sentinel::ALL {
            let is_data = matches!(site, Sentinel::DataLeft | Sentinel::DataRight);
            if is_data && !layout.has_sentinels() {
                continue;
            }
            let expected = self.expected_for(site, header, layout);
            if Self::stored(site, header, region, layout) != Some(expected) {
                return Err(site.violation());
            }
        }
        Ok(())
    }
}

/// Byte position of a sentinel inside its record.
#[must_use]
pub fn position_of(site: Sentinel, layout: &RegionLayout) -> usize {
    match site {
        Sentinel::StructureLeft => std::mem::offset_of!(StackHeader, left_canary),
        Sentinel::StructureRight => std::mem::offset_of!(StackHeader, right_canary),
        Sentinel::DataLeft => layout.left_sentinel_offset(),
        Sentinel::DataRight => layout.right_sentinel_offset(),
    }
}

fn read_sentinel(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset.checked_add(SENTINEL_SIZE)?)?;
    <[u8; SENTINEL_SIZE]>::try_from(raw).ok().map(u64::from_le_bytes)
}

/// SipHash-2-4 over a two-word message with a single 64-bit key.
fn sip_hash_2_4(key: u64, m0: u64, m1: u64) -> u64 {
    let k0 = key;
    let k1 = key.rotate_left(32) ^ 0x0F0E_0D0C_0B0A_0908;

    let mut v0: u64 = k0 ^ 0x736f_6d65_7073_6575;
    let mut v1: u64 = k1 ^ 0x646f_7261_6e64_6f6d;
    let mut v2: u64 = k0 ^ 0x6c79_6765_6e65_7261;
    let mut v3: u64 = k1 ^ 0x7465_6462_7974_6573;

    for m in [m0, m1] {
        v3 ^= m;
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
    }

    v2 ^= 0xFF;
    for _ in 0..4 {
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    }

    v0 ^ v1 ^ v2 ^ v3
}

#[inline(always)]
fn sip_round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
    *v0 = v0.wrapping_add(*v1);
    *v1 = v1.rotate_left(13);
    *v1 ^= *v0;
    *v0 = v0.rotate_left(32);
    *v2 = v2.wrapping_add(*v3);
    *v3 = v3.rotate_left(16);
    *v3 ^= *v2;
    *v0 = v0.wrapping_add(*v3);
    *v3 = v3.rotate_left(21);
    *v3 ^= *v0;
    *v2 = v2.wrapping_add(*v1);
    *v1 = v1.rotate_left(17);
    *v1 ^= *v2;
    *v2 = v2.rotate_left(32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AllocationTracker;

    fn sealed(capacity: usize) -> (CanaryGuard, StackHeader, RawRegion, RegionLayout) {
        let guard = CanaryGuard::new(0x1234);
        let layout = RegionLayout::new(capacity, 1, true).unwrap();
        let mut region = AllocationTracker::new().allocate(layout.total_size(), None).unwrap();
        let mut header = StackHeader::new(capacity, 1, region.addr() + layout.data_offset());
        guard.seal(&mut header, &mut region, &layout);
        (guard, header, region, layout)
    }

    #[test]
    fn sealed_stack_verifies() {
        let (guard, header, region, layout) = sealed(3);
        assert_eq!(guard.verify(&header, &region, &layout), Ok(()));
    }

    #[test]
    fn each_sentinel_reports_its_own_kind() {
        for site in Sentinel::ALL {
            let (guard, mut header, mut region, layout) = sealed(5);
            match site {
                Sentinel::StructureLeft => header.left_canary ^= 1,
                Sentinel::StructureRight => header.right_canary ^= 1,
                Sentinel::DataLeft | Sentinel::DataRight => {
                    region.as_mut_slice()[position_of(site, &layout) + 3] ^= 0xFF;
                }
            }
            assert_eq!(
                guard.verify(&header, &region, &layout),
                Err(site.violation()),
                "{site:?}"
            );
        }
    }

    #[test]
    fn generation_change_invalidates_sentinels() {
        let (guard, mut header, region, layout) = sealed(3);
        header.generation += 1;
        assert_eq!(
            guard.verify(&header, &region, &layout),
            Err(Violation::LeftCanary)
        );
    }

    #[test]
    fn sites_and_positions_derive_distinct_values() {
        let guard = CanaryGuard::new(7);
        let a = guard.expected(Sentinel::DataLeft, 0, 1);
        let b = guard.expected(Sentinel::DataRight, 0, 1);
        let c = guard.expected(Sentinel::DataRight, 16, 1);
        let d = guard.expected(Sentinel::DataRight, 16, 2);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(c, d);
        assert_ne!(
            CanaryGuard::new(7).expected(Sentinel::DataLeft, 0, 1),
            CanaryGuard::new(8).expected(Sentinel::DataLeft, 0, 1)
        );
    }

    #[test]
    fn session_tokens_differ() {
        assert_ne!(session_token(), session_token());
    }
}

//! Checksum guard.
//!
//! Two djb2 digests: one over the header's business fields, one over the
//! whole data region including poisoned slots, so a write past `size` that
//! misses every sentinel is still caught.

use crate::error::Violation;
use crate::guard::{StackHeader, VerifyStrategy};
use crate::layout::RegionLayout;
use crate::tracker::RawRegion;

/// Initial djb2 state.
pub const DJB2_SEED: u64 = 5381;

/// djb2: `h = h * 33 + byte`, wrapping.
#[must_use]
pub fn djb2(bytes: &[u8]) -> u64 {
    bytes.iter().fold(DJB2_SEED, |hash, &byte| {
        (hash << 5).wrapping_add(hash).wrapping_add(u64::from(byte))
    })
}

/// Computes and checks the structure and data checksums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashGuard;

impl HashGuard {
    /// Digest over `size`, `capacity`, `init_capacity`, `element_size`, the
    /// data address and the region generation.
    #[must_use]
    pub fn structure_hash(header: &StackHeader) -> u64 {
        djb2(&header.business_bytes())
    }

    /// Digest over all `capacity * element_size` data bytes.
    #[must_use]
    pub fn data_hash(region: &RawRegion, layout: &RegionLayout) -> u64 {
        let data = region
            .as_slice()
            .get(layout.data_offset()..layout.data_end())
            .unwrap_or_default();
        djb2(data)
    }
}

impl VerifyStrategy for HashGuard {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn seal(&self, header: &mut StackHeader, region: &mut RawRegion, layout: &RegionLayout) {
        header.structure_hash = Self::structure_hash(header);
        header.data_hash = Self::data_hash(region, layout);
    }

    fn verify(&self, header: &StackHeader, region: &RawRegion, layout: &RegionLayout) -> Result<(), Violation> {
        if header.structure_hash != Self::structure_hash(header) {
            return Err(Violation::StructureHash);
        }
        if header.data_hash != Self::data_hash(region, layout) {
            return Err(Violation::DataHash);
        }
        Ok(())
    }
}

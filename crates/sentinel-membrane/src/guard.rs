//! Stack header record and the guard capability.
//!
//! A [`VerifyStrategy`] writes its protection values after a mutation
//! (`seal`) and checks them before the next one (`verify`). The canary and
//! hash guards are independent strategies; [`GuardSet`] composes whichever
//! ones a [`Protection`] level selects.

use crate::canary::CanaryGuard;
use crate::config::Protection;
use crate::error::Violation;
use crate::hash::HashGuard;
use crate::layout::RegionLayout;
use crate::tracker::RawRegion;

/// Metadata record of one stack, bounded by the two structure canaries.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackHeader {
    pub(crate) left_canary: u64,
    pub(crate) structure_hash: u64,
    pub(crate) data_hash: u64,
    pub(crate) size: usize,
    pub(crate) capacity: usize,
    pub(crate) init_capacity: usize,
    pub(crate) element_size: usize,
    pub(crate) data_addr: usize,
    pub(crate) generation: u64,
    pub(crate) right_canary: u64,
}

impl StackHeader {
    /// Empty header for a fresh region; protection values are unset.
    #[must_use]
    pub fn new(capacity: usize, element_size: usize, data_addr: usize) -> Self {
        Self {
            left_canary: 0,
            structure_hash: 0,
            data_hash: 0,
            size: 0,
            capacity,
            init_capacity: capacity,
            element_size,
            data_addr,
            generation: 1,
            right_canary: 0,
        }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn init_capacity(&self) -> usize {
        self.init_capacity
    }

    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    #[must_use]
    pub const fn data_addr(&self) -> usize {
        self.data_addr
    }

    /// Bumped on every reallocation of the data region.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn left_canary(&self) -> u64 {
        self.left_canary
    }

    #[must_use]
    pub const fn right_canary(&self) -> u64 {
        self.right_canary
    }

    #[must_use]
    pub const fn structure_hash(&self) -> u64 {
        self.structure_hash
    }

    #[must_use]
    pub const fn data_hash(&self) -> u64 {
        self.data_hash
    }

    /// Little-endian image of the fields covered by the structure checksum.
    #[must_use]
    pub fn business_bytes(&self) -> [u8; 48] {
        let words = [
            self.size as u64,
            self.capacity as u64,
            self.init_capacity as u64,
            self.element_size as u64,
            self.data_addr as u64,
            self.generation,
        ];
        let mut out = [0u8; 48];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// Capability to protect and check one stack's header and region.
pub trait VerifyStrategy {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Recompute and store this strategy's protection values.
    fn seal(&self, header: &mut StackHeader, region: &mut RawRegion, layout: &RegionLayout);

    /// Check the stored values against fresh derivations.
    fn verify(&self, header: &StackHeader, region: &RawRegion, layout: &RegionLayout) -> Result<(), Violation>;
}

/// The guards selected for one stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardSet {
    canary: Option<CanaryGuard>,
    hash: Option<HashGuard>,
}

impl GuardSet {
    /// Guards for `protection`, canaries keyed by `token`.
    #[must_use]
    pub fn new(protection: Protection, token: u64) -> Self {
        Self {
            canary: protection.canaries().then(|| CanaryGuard::new(token)),
            hash: protection.hashes().then_some(HashGuard),
        }
    }

    #[must_use]
    pub const fn has_canaries(&self) -> bool {
        self.canary.is_some()
    }

    #[must_use]
    pub const fn has_hashes(&self) -> bool {
        self.hash.is_some()
    }
}

impl VerifyStrategy for GuardSet {
    fn name(&self) -> &'static str {
        match (self.canary.is_some(), self.hash.is_some()) {
            (true, true) => "full",
            (true, false) => "canary",
            (false, true) => "hash",
            (false, false) => "off",
        }
    }

    fn seal(&self, header: &mut StackHeader, region: &mut RawRegion, layout: &RegionLayout) {
        if let Some(canary) = &self.canary {
            canary.seal(header, region, layout);
        }
        if let Some(hash) = &self.hash {
            hash.seal(header, region, layout);
        }
    }

    fn verify(&self, header: &StackHeader, region: &RawRegion, layout: &RegionLayout) -> Result<(), Violation> {
        if let Some(canary) = &self.canary {
            canary.verify(header, region, layout)?;
        }
        if let Some(hash) = &self.hash {
            hash.verify(header, region, layout)?;
        }
        Ok(())
    }
}

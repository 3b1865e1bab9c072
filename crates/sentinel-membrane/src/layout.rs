//! Byte layout of a stack's data allocation.
//!
//! With sentinels enabled an allocation looks like:
//!
//! ```text
//! [ left sentinel (8) | data (capacity * element_size) | padding | right sentinel (8) ]
//! ```
//!
//! The padding brings the right sentinel onto an 8-byte boundary. Without
//! sentinels the allocation is the bare data region.

use crate::error::StackError;

/// Width of one data sentinel in bytes.
pub const SENTINEL_SIZE: usize = 8;

/// Alignment of every region allocation.
pub const REGION_ALIGN: usize = 8;

/// Offsets of every part of one region allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    capacity: usize,
    element_size: usize,
    sentinels: bool,
    data_len: usize,
    padding: usize,
}

impl RegionLayout {
    /// Compute the layout for `capacity` elements of `element_size` bytes.
    pub fn new(capacity: usize, element_size: usize, sentinels: bool) -> Result<Self, StackError> {
        if element_size == 0 {
            return Err(StackError::ZeroElementSize);
        }
        if capacity == 0 {
            return Err(StackError::ZeroCapacity);
        }
        let data_len = capacity
            .checked_mul(element_size)
            .ok_or(StackError::CapacityOverflow)?;
        let padding = if sentinels {
            alignment_padding(data_len)
        } else {
            0
        };
        let layout = Self {
            capacity,
            element_size,
            sentinels,
            data_len,
            padding,
        };
        // Reject layouts whose total does not fit before anyone allocates.
        data_len
            .checked_add(padding)
            .and_then(|n| n.checked_add(layout.sentinel_width() * 2))
            .filter(|&n| n <= isize::MAX as usize)
            .ok_or(StackError::CapacityOverflow)?;
        Ok(layout)
    }

    /// Same element size and sentinel mode, different capacity.
    pub fn with_capacity(&self, capacity: usize) -> Result<Self, StackError> {
        Self::new(capacity, self.element_size, self.sentinels)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn element_size(&self) -> usize {
        self.element_size
    }

    #[must_use]
    pub const fn has_sentinels(&self) -> bool {
        self.sentinels
    }

    /// Bytes reserved for one sentinel (zero when sentinels are off).
    #[must_use]
    pub const fn sentinel_width(&self) -> usize {
        if self.sentinels { SENTINEL_SIZE } else { 0 }
    }

    /// Offset of the left sentinel; always the start of the allocation.
    #[must_use]
    pub const fn left_sentinel_offset(&self) -> usize {
        0
    }

    /// Offset of the first data byte.
    #[must_use]
    pub const fn data_offset(&self) -> usize {
        self.sentinel_width()
    }

    /// Length of the data region in bytes.
    #[must_use]
    pub const fn data_len(&self) -> usize {
        self.data_len
    }

    /// One past the last data byte.
    #[must_use]
    pub const fn data_end(&self) -> usize {
        self.data_offset() + self.data_len
    }

    /// Padding between the data end and the right sentinel.
    #[must_use]
    pub const fn padding(&self) -> usize {
        self.padding
    }

    /// Offset of the right sentinel.
    #[must_use]
    pub const fn right_sentinel_offset(&self) -> usize {
        self.data_end() + self.padding
    }

    /// Total allocation size.
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.right_sentinel_offset() + self.sentinel_width()
    }

    /// Byte range of slot `index` relative to the allocation start.
    #[must_use]
    pub fn slot_range(&self, index: usize) -> std::ops::Range<usize> {
        let start = self.data_offset() + index * self.element_size;
        start..start + self.element_size
    }
}

/// Bytes needed after `data_len` to reach the next 8-byte boundary.
#[must_use]
pub const fn alignment_padding(data_len: usize) -> usize {
    (SENTINEL_SIZE - data_len % SENTINEL_SIZE) % SENTINEL_SIZE
}

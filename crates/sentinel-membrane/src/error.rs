//! Closed error taxonomy for guarded stacks.
//!
//! Callers branch on [`StackError`] to tell the one ordinary outcome
//! ([`StackError::Empty`]) apart from input rejections and from failures
//! that consume the stack instance.

use serde::Serialize;
use thiserror::Error;

/// A single failed structural check.
///
/// Each canary and each checksum has its own kind so a dump can name which
/// side of which region was overrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Violation {
    /// The stack has no data region.
    NullData,
    /// `size` exceeds `capacity`.
    IncorrectSize,
    /// `capacity` dropped below `init_capacity`.
    InvalidCapacity,
    /// The data address or capacity disagrees with the region layout.
    InvalidData,
    /// Left structure canary mismatch.
    LeftCanary,
    /// Right structure canary mismatch.
    RightCanary,
    /// Left data canary mismatch.
    DataLeftCanary,
    /// Right data canary mismatch.
    DataRightCanary,
    /// Checksum over the metadata fields mismatch.
    StructureHash,
    /// Checksum over the data region mismatch.
    DataHash,
    /// The diagnostic sink is no longer open.
    SinkClosed,
}

impl Violation {
    /// Stable name written into dumps and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NullData => "STACK_NULL_DATA",
            Self::IncorrectSize => "STACK_INCORRECT_SIZE",
            Self::InvalidCapacity => "STACK_INVALID_CAPACITY",
            Self::InvalidData => "STACK_INVALID_DATA",
            Self::LeftCanary => "STACK_UNEXPECTED_LEFT_CANARY",
            Self::RightCanary => "STACK_UNEXPECTED_RIGHT_CANARY",
            Self::DataLeftCanary => "STACK_UNEXPECTED_DATA_LEFT_CANARY",
            Self::DataRightCanary => "STACK_UNEXPECTED_DATA_RIGHT_CANARY",
            Self::StructureHash => "STACK_UNEXPECTED_STRUCTURE_HASH",
            Self::DataHash => "STACK_UNEXPECTED_DATA_HASH",
            Self::SinkClosed => "STACK_DUMP_ERROR",
        }
    }

    /// Returns true for the four sentinel kinds.
    #[must_use]
    pub const fn is_canary(self) -> bool {
        matches!(
            self,
            Self::LeftCanary | Self::RightCanary | Self::DataLeftCanary | Self::DataRightCanary
        )
    }

    /// Returns true for the two checksum kinds.
    #[must_use]
    pub const fn is_hash(self) -> bool {
        matches!(self, Self::StructureHash | Self::DataHash)
    }

    /// Every kind, in verification order.
    pub const ALL: [Self; 11] = [
        Self::NullData,
        Self::InvalidData,
        Self::IncorrectSize,
        Self::InvalidCapacity,
        Self::LeftCanary,
        Self::RightCanary,
        Self::DataLeftCanary,
        Self::DataRightCanary,
        Self::StructureHash,
        Self::DataHash,
        Self::SinkClosed,
    ];
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Every outcome a stack operation can report besides success.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack handle is no longer live")]
    Null,
    #[error("element is {got} bytes, stack stores {expected}-byte elements")]
    InvalidInput { expected: usize, got: usize },
    #[error("output buffer is {got} bytes, stack stores {expected}-byte elements")]
    InvalidOutput { expected: usize, got: usize },
    #[error("element size must be non-zero")]
    ZeroElementSize,
    #[error("capacity must be non-zero")]
    ZeroCapacity,
    #[error("diagnostics parameter `{0}` is missing")]
    MissingDiagnostics(&'static str),
    #[error("allocation of {bytes} bytes failed")]
    Memory { bytes: usize },
    #[error("capacity overflows the address space")]
    CapacityOverflow,
    #[error("element copy did not land in the data region")]
    Copy,
    #[error("diagnostic sink: {0}")]
    Dump(#[source] std::io::Error),
    #[error("stack is empty")]
    Empty,
    #[error("corruption detected: {0}")]
    Corrupted(Violation),
    /// The failure being reported could not be dumped. `trigger` is that
    /// failure; `source` is the sink or formatter error.
    #[error("dump failed while reporting {trigger}")]
    DumpFailed {
        trigger: Box<StackError>,
        #[source]
        source: std::io::Error,
    },
}

impl StackError {
    /// Stable upper-snake name used in dumps and logs.
    #[must_use]
    pub fn code_name(&self) -> &'static str {
        match self {
            Self::Null => "STACK_NULL",
            Self::InvalidInput { .. } | Self::ZeroElementSize | Self::MissingDiagnostics(_) => {
                "STACK_INVALID_INPUT"
            }
            Self::InvalidOutput { .. } => "STACK_INVALID_OUTPUT",
            Self::ZeroCapacity => "STACK_INVALID_CAPACITY",
            Self::Memory { .. } | Self::CapacityOverflow | Self::Copy => "STACK_MEMORY_ERROR",
            Self::Dump(_) | Self::DumpFailed { .. } => "STACK_DUMP_ERROR",
            Self::Empty => "STACK_EMPTY",
            Self::Corrupted(violation) => violation.name(),
        }
    }

    /// Returns true when the failing operation tears the stack down.
    ///
    /// Only input rejections, the empty pop and calls on a dead handle leave
    /// the instance as it was.
    #[must_use]
    pub const fn consumes_stack(&self) -> bool {
        !matches!(
            self,
            Self::Null | Self::Empty | Self::InvalidInput { .. } | Self::InvalidOutput { .. }
        )
    }

    /// The violation behind this error, if it reports corruption.
    #[must_use]
    pub fn violation(&self) -> Option<Violation> {
        match self {
            Self::Corrupted(v) => Some(*v),
            Self::DumpFailed { trigger, .. } => trigger.violation(),
            _ => None,
        }
    }
}

impl From<Violation> for StackError {
    fn from(violation: Violation) -> Self {
        Self::Corrupted(violation)
    }
}

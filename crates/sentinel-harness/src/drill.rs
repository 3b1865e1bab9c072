//! Corruption drills.
//!
//! Each drill builds a fully protected stack with its own dump file, injects
//! one fault out of band, runs a single push and checks that:
//! - the push fails with exactly the expected kind,
//! - the stack is gone afterwards,
//! - the dump holds exactly one record naming that kind (a closed sink holds
//!   none, since it cannot take its own report).

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use sentinel_membrane::dump::{hex, record_errors};
use sentinel_membrane::fault::overrun_reach;
use sentinel_membrane::{
    DiagnosticsConfig, GuardedStack, Protection, Sentinel, StackBuilder, Violation, provenance,
};

use crate::HarnessError;

/// Session token pinned for every drill stack.
pub const DRILL_SEED: u64 = 0x5EED_C0FF_EE00_0001;

/// One detection kind and the fault that triggers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrillKind {
    NullData,
    InvalidData,
    IncorrectSize,
    InvalidCapacity,
    LeftCanary,
    RightCanary,
    DataLeftCanary,
    DataRightCanary,
    StructureHash,
    DataHash,
    SinkClosed,
}

impl DrillKind {
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

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NullData => "null-data",
            Self::InvalidData => "invalid-data",
            Self::IncorrectSize => "incorrect-size",
            Self::InvalidCapacity => "invalid-capacity",
            Self::LeftCanary => "left-canary",
            Self::RightCanary => "right-canary",
            Self::DataLeftCanary => "data-left-canary",
            Self::DataRightCanary => "data-right-canary",
            Self::StructureHash => "structure-hash",
            Self::DataHash => "data-hash",
            Self::SinkClosed => "sink-closed",
        }
    }

    /// The violation this drill must produce.
    #[must_use]
    pub const fn violation(self) -> Violation {
        match self {
            Self::NullData => Violation::NullData,
            Self::InvalidData => Violation::InvalidData,
            Self::IncorrectSize => Violation::IncorrectSize,
            Self::InvalidCapacity => Violation::InvalidCapacity,
            Self::LeftCanary => Violation::LeftCanary,
            Self::RightCanary => Violation::RightCanary,
            Self::DataLeftCanary => Violation::DataLeftCanary,
            Self::DataRightCanary => Violation::DataRightCanary,
            Self::StructureHash => Violation::StructureHash,
            Self::DataHash => Violation::DataHash,
            Self::SinkClosed => Violation::SinkClosed,
        }
    }

    /// Parse a drill name; `None` for unknown names.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = name.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|kind| kind.name() == wanted)
    }

    /// `all` or a single drill name.
    pub fn select(name: &str) -> Result<Vec<Self>, HarnessError> {
        if name.eq_ignore_ascii_case("all") {
            return Ok(Self::ALL.to_vec());
        }
        Self::from_name(name)
            .map(|kind| vec![kind])
            .ok_or_else(|| HarnessError::UnknownDrill(name.to_string()))
    }

    fn inject(self, stack: &mut GuardedStack) {
        let reach = overrun_reach(stack);
        let Some(mut inj) = stack.fault_injector() else {
            return;
        };
        match self {
            Self::NullData => inj.null_data(),
            Self::InvalidData => inj.misplace_data(8),
            Self::IncorrectSize => inj.set_size(usize::MAX),
            // Still above the size, so only the init floor is broken.
            Self::InvalidCapacity => inj.set_capacity(DRILL_CAPACITY - 1),
            Self::LeftCanary => {
                inj.overwrite_sentinel(Sentinel::StructureLeft, 0);
            }
            Self::RightCanary => {
                inj.overwrite_sentinel(Sentinel::StructureRight, 0);
            }
            Self::DataLeftCanary => {
                inj.underrun(&[0xAA; 4]);
            }
            Self::DataRightCanary => {
                inj.overrun(&vec![0xBB; reach]);
            }
            // Size stays within capacity, so only the checksum notices.
            Self::StructureHash => inj.set_size(3),
            // Last byte of the last (poisoned) slot.
            Self::DataHash => {
                inj.write_data(DRILL_CAPACITY * DRILL_ELEMENT_SIZE - 1, 0xCC);
            }
            Self::SinkClosed => {
                inj.close_sink();
            }
        }
    }
}

const DRILL_CAPACITY: usize = 4;
const DRILL_ELEMENT_SIZE: usize = 3;

/// Result of one drill.
#[derive(Debug, Clone, Serialize)]
pub struct DrillOutcome {
    pub kind: DrillKind,
    pub expected: String,
    pub got: String,
    pub stack_consumed: bool,
    pub dump_records: Vec<String>,
    pub dump_path: String,
    pub dump_sha256: String,
    pub passed: bool,
}

/// All drills of one run.
#[derive(Debug, Clone, Serialize)]
pub struct DrillReport {
    pub out_dir: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub outcomes: Vec<DrillOutcome>,
}

impl DrillReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Run `kinds`, writing one dump per drill into `out_dir`.
pub fn run_drills(out_dir: &Path, kinds: &[DrillKind]) -> Result<DrillReport, HarnessError> {
    std::fs::create_dir_all(out_dir)?;
    let outcomes = kinds
        .iter()
        .map(|&kind| run_drill(out_dir, kind))
        .collect::<Result<Vec<_>, _>>()?;
    let passed = outcomes.iter().filter(|o| o.passed).count();
    Ok(DrillReport {
        out_dir: out_dir.display().to_string(),
        total: outcomes.len(),
        passed,
        failed: outcomes.len() - passed,
        outcomes,
    })
}

/// Run one drill.
pub fn run_drill(out_dir: &Path, kind: DrillKind) -> Result<DrillOutcome, HarnessError> {
    let dump_path: PathBuf = out_dir.join(format!("{}.dump", kind.name()));
    let mut stack = StackBuilder::new(DRILL_CAPACITY, DRILL_ELEMENT_SIZE)
        .protection(Protection::Full)
        .canary_seed(DRILL_SEED)
        .diagnostics(DiagnosticsConfig::new(&dump_path, provenance!(drill_stack), hex))
        .build()?;
    stack.push(b"one")?;
    stack.push(b"two")?;

    kind.inject(&mut stack);
    let result = stack.push(b"six");
    let got = match &result {
        Ok(()) => "STACK_SUCCESS".to_string(),
        Err(err) => err.code_name().to_string(),
    };
    let stack_consumed = !stack.is_live();
    drop(stack);

    let bytes = std::fs::read(&dump_path)?;
    let text = String::from_utf8_lossy(&bytes);
    let dump_records: Vec<String> = record_errors(&text).into_iter().map(str::to_string).collect();

    let expected = kind.violation().name();
    let expected_records: &[&str] = if kind == DrillKind::SinkClosed {
        &[]
    } else {
        &[expected]
    };
    let passed = got == expected && stack_consumed && dump_records == expected_records;

    Ok(DrillOutcome {
        kind,
        expected: expected.to_string(),
        got,
        stack_consumed,
        dump_records,
        dump_path: dump_path.display().to_string(),
        dump_sha256: hex_lower(&Sha256::digest(&bytes)),
        passed,
    })
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

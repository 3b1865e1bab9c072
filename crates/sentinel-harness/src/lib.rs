//! Verification harness for sentinel.
//!
//! This crate provides:
//! - Reference scenario: the push/pop walk every build must reproduce
//! - Corruption drills: one injected fault per detection kind, checked
//!   against the returned error and the dump it leaves behind
//! - Log validation: schema checks over allocation/event logs

#![forbid(unsafe_code)]

pub mod drill;
pub mod error;
pub mod scenario;

pub use drill::{DrillKind, DrillOutcome, DrillReport};
pub use error::HarnessError;
pub use scenario::{ScenarioReport, ScenarioStep};

//! Self-verifying resizable stack for sentinel.
//!
//! A [`GuardedStack`] stores fixed-size opaque elements in one tracked heap
//! region and re-checks its own integrity around every operation. Corruption
//! is never repaired: the first failed check writes a diagnostic dump,
//! releases the stack and hands the caller a named error.
//!
//! # Architecture
//!
//! - **Region layout** (`layout`): sentinel/data/padding offsets per allocation size
//! - **Allocation tracker** (`tracker`): allocate/reallocate/free with an optional JSONL log
//! - **Canary guard** (`canary`): four SipHash-derived sentinels around header and data
//! - **Hash guard** (`hash`): djb2 checksums over metadata and the whole data region
//! - **Guard composition** (`guard`): `VerifyStrategy` capability and `GuardSet`
//! - **Diagnostics** (`dump`): text dumps with caller-supplied element formatters
//! - **Stack engine** (`stack`): guarded operations and the resize policy
//! - **Fault injection** (`fault`): out-of-band corruption for tests and drills
//! - **Configuration** (`config`): protection level control
//! - **Metrics** (`metrics`): atomic counters for observability
//! - **Structured log** (`structured_log`): JSONL records and schema checks

#![deny(unsafe_code)]

pub mod canary;
pub mod config;
pub mod dump;
pub mod error;
pub mod fault;
pub mod guard;
pub mod hash;
pub mod layout;
pub mod metrics;
pub mod stack;
pub mod structured_log;
pub mod tracker;

pub use canary::Sentinel;
pub use config::Protection;
pub use dump::{CallSite, DiagnosticsConfig, ElementFormatter, Provenance};
pub use error::{StackError, Violation};
pub use fault::FaultInjector;
pub use guard::{GuardSet, StackHeader, VerifyStrategy};
pub use metrics::StackMetrics;
pub use stack::{GuardedStack, StackBuilder};
pub use tracker::{AllocationLog, AllocationTracker};

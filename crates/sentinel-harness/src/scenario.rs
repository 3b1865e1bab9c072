//! Reference scenario.
//!
//! Initial capacity 3, one-byte elements: push `a b c` (no resize), push `d`
//! (grows to 6), pop four times (`d c b a`, shrinking back to 3 on the last
//! one), then a fifth pop that must report an empty stack.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use sentinel_membrane::dump::{ascii, record_errors};
use sentinel_membrane::metrics::{MetricsSnapshot, global_metrics};
use sentinel_membrane::tracker::TrackerSnapshot;
use sentinel_membrane::{
    AllocationLog, AllocationTracker, DiagnosticsConfig, GuardedStack, Protection, StackBuilder,
    StackError, provenance,
};

use crate::HarnessError;

/// Capacities observed after each step of the reference walk.
pub const EXPECTED_CAPACITIES: [usize; 10] = [3, 3, 3, 3, 6, 6, 6, 6, 3, 3];

/// One operation of the walk and the state it left behind.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStep {
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<char>,
    pub result: String,
    pub size: usize,
    pub capacity: usize,
}

/// Machine-readable outcome of [`run_scenario`].
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub dump_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_log: Option<String>,
    pub protection: Protection,
    pub steps: Vec<ScenarioStep>,
    pub popped: String,
    pub dump_records: Vec<String>,
    pub tracker: TrackerSnapshot,
    pub metrics: MetricsSnapshot,
}

impl ScenarioReport {
    /// True when the walk matched the reference behavior exactly.
    #[must_use]
    pub fn matches_reference(&self) -> bool {
        let capacities: Vec<usize> = self.steps.iter().map(|s| s.capacity).collect();
        let last = self.steps.last().map(|s| s.result.as_str());
        self.popped == "dcba"
            && capacities == EXPECTED_CAPACITIES
            && last == Some("STACK_EMPTY")
            && self.dump_records.is_empty()
            && self.tracker.live_regions == 0
    }
}

fn step(stack: &GuardedStack, op: &str, element: Option<char>, result: Result<(), StackError>) -> ScenarioStep {
    ScenarioStep {
        op: op.to_string(),
        element,
        result: match result {
            Ok(()) => "STACK_SUCCESS".to_string(),
            Err(err) => err.code_name().to_string(),
        },
        size: stack.len(),
        capacity: stack.capacity(),
    }
}

/// Run the reference walk with its dump at `dump` and, optionally, an
/// allocation log at `alloc_log`.
pub fn run_scenario(dump: &Path, alloc_log: Option<&Path>) -> Result<ScenarioReport, HarnessError> {
    let log = alloc_log.map(|path| Arc::new(AllocationLog::to_file(path)));
    let tracker = log
        .as_ref()
        .map_or_else(AllocationTracker::new, |log| AllocationTracker::with_log(Arc::clone(log)));

    let mut stack = StackBuilder::new(3, 1)
        .protection(Protection::Full)
        .diagnostics(DiagnosticsConfig::new(dump, provenance!(stack), ascii))
        .tracker(tracker.clone())
        .build()?;

    let mut steps = vec![step(&stack, "init", None, Ok(()))];
    for symbol in ['a', 'b', 'c', 'd'] {
        let result = stack.push(&[symbol as u8]);
        steps.push(step(&stack, "push", Some(symbol), result));
    }

    let mut popped = String::new();
    for _ in 0..5 {
        let mut out = [0u8];
        let result = stack.pop(&mut out);
        let element = result.is_ok().then_some(char::from(out[0]));
        popped.extend(element);
        steps.push(step(&stack, "pop", element, result));
    }

    stack.destroy()?;
    if let Some(log) = &log {
        log.shutdown()?;
    }

    let text = std::fs::read_to_string(dump)?;
    Ok(ScenarioReport {
        dump_path: dump.display().to_string(),
        alloc_log: alloc_log.map(|p| p.display().to_string()),
        protection: Protection::Full,
        steps,
        popped,
        dump_records: record_errors(&text).into_iter().map(str::to_string).collect(),
        tracker: tracker.snapshot(),
        metrics: global_metrics().snapshot(),
    })
}

//! Integration test: reference scenario and corruption drills end to end.

use sha2::{Digest, Sha256};

use sentinel_harness::drill::{self, DrillKind};
use sentinel_harness::scenario::{self, EXPECTED_CAPACITIES};
use sentinel_membrane::structured_log::validate_log_file;

#[test]
fn scenario_matches_reference_walk() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("scenario.dump");
    let log = dir.path().join("alloc.jsonl");

    let report = scenario::run_scenario(&dump, Some(&log)).unwrap();
    assert!(report.matches_reference(), "{report:#?}");
    assert_eq!(report.popped, "dcba");
    let capacities: Vec<usize> = report.steps.iter().map(|s| s.capacity).collect();
    assert_eq!(capacities, EXPECTED_CAPACITIES);
    assert_eq!(report.steps.last().unwrap().result, "STACK_EMPTY");
    assert_eq!(report.tracker.live_regions, 0);

    // Healthy run: the sink exists but holds nothing.
    assert!(dump.exists());
    assert!(std::fs::read_to_string(&dump).unwrap().is_empty());

    let (lines, errors) = validate_log_file(&log).unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    assert!(lines > 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["protection"], "full");
    assert_eq!(json["steps"].as_array().unwrap().len(), 10);
}

#[test]
fn scenario_without_alloc_log() {
    let dir = tempfile::tempdir().unwrap();
    let report = scenario::run_scenario(&dir.path().join("s.dump"), None).unwrap();
    assert!(report.matches_reference());
    assert!(report.alloc_log.is_none());
}

#[test]
fn every_drill_is_detected_and_dumped_once() {
    let dir = tempfile::tempdir().unwrap();
    let report = drill::run_drills(dir.path(), &DrillKind::ALL).unwrap();
    for outcome in &report.outcomes {
        assert!(outcome.passed, "{outcome:#?}");
        assert!(outcome.stack_consumed, "{}", outcome.kind.name());
    }
    assert_eq!(report.total, 11);
    assert!(report.all_passed());

    for outcome in &report.outcomes {
        let bytes = std::fs::read(&outcome.dump_path).unwrap();
        assert_eq!(outcome.dump_sha256.len(), 64);
        assert!(outcome.dump_sha256.bytes().all(|b| b.is_ascii_hexdigit()));
        let digest: String = Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(outcome.dump_sha256, digest, "{}", outcome.kind.name());
    }
}

#[test]
fn drill_dump_names_the_provenance_and_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = drill::run_drill(dir.path(), DrillKind::DataRightCanary).unwrap();
    assert!(outcome.passed, "{outcome:#?}");
    let text = std::fs::read_to_string(&outcome.dump_path).unwrap();
    assert!(text.contains("as 'drill_stack'"));
    assert!(text.contains("ERROR = 'STACK_UNEXPECTED_DATA_RIGHT_CANARY'"));
    assert!(text.contains("'push'"));
    assert!(text.contains("---CANARIES---"));
}

#[test]
fn drill_selection_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let kinds = DrillKind::select("sink-closed").unwrap();
    let report = drill::run_drills(&dir.path().join("nested"), &kinds).unwrap();
    assert_eq!(report.total, 1);
    assert!(report.all_passed());
    assert!(report.outcomes[0].dump_records.is_empty());
}

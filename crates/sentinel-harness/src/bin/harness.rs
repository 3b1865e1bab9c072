//! CLI entrypoint for the sentinel stack harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use sentinel_harness::{DrillKind, drill, scenario};
use sentinel_membrane::structured_log::validate_log_file;

/// Verification tooling for the guarded stack.
#[derive(Debug, Parser)]
#[command(name = "sentinel-harness")]
#[command(about = "Scenario and corruption drills for the guarded stack")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reference push/pop walk.
    Scenario {
        /// Dump sink path.
        #[arg(long, default_value = "stack.dump")]
        dump: PathBuf,
        /// Optional allocation log (JSONL).
        #[arg(long)]
        alloc_log: Option<PathBuf>,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Corrupt fresh stacks on purpose and check each detection.
    Drill {
        /// Directory receiving one dump file per drill.
        #[arg(long)]
        out_dir: PathBuf,
        /// Drill name (e.g. `left-canary`) or `all`.
        #[arg(long, default_value = "all")]
        kind: String,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate an allocation log against the record schema.
    ValidateLog {
        /// Structured JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn write_report(body: &str, output: Option<&Path>) -> std::io::Result<()> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body)?;
            eprintln!("Wrote report to {}", path.display());
        }
        None => println!("{body}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scenario {
            dump,
            alloc_log,
            output,
        } => {
            eprintln!("Running reference scenario, dump sink {}", dump.display());
            let report = scenario::run_scenario(&dump, alloc_log.as_deref())?;
            write_report(&serde_json::to_string_pretty(&report)?, output.as_deref())?;
            if !report.matches_reference() {
                return Err(format!(
                    "Scenario diverged: popped '{}', {} dump record(s)",
                    report.popped,
                    report.dump_records.len()
                )
                .into());
            }
        }
        Command::Drill {
            out_dir,
            kind,
            output,
        } => {
            let kinds = DrillKind::select(&kind)?;
            eprintln!("Running {} drill(s) into {}", kinds.len(), out_dir.display());
            let report = drill::run_drills(&out_dir, &kinds)?;
            for outcome in report.outcomes.iter().filter(|o| !o.passed) {
                eprintln!(
                    "[{}] expected {}, got {} (records {:?})",
                    outcome.kind.name(),
                    outcome.expected,
                    outcome.got,
                    outcome.dump_records
                );
            }
            write_report(&serde_json::to_string_pretty(&report)?, output.as_deref())?;
            if !report.all_passed() {
                return Err(format!("{} of {} drill(s) failed", report.failed, report.total).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!("{} invalid field(s) across {lines} line(s)", errors.len()).into());
            }
            eprintln!("{lines} line(s) valid in {}", log.display());
        }
    }

    Ok(())
}

// Terminal output
// Node progress lines and command results

use std::path::Path;
use std::time::Duration;

use megflow_service::{NodeStatus, RunReport};

const RESET: &str = "\x1b[0m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";

/// Final node states in the order they are summarised
const TERMINAL: [NodeStatus; 4] = [
    NodeStatus::Completed,
    NodeStatus::Failed,
    NodeStatus::Skipped,
    NodeStatus::Cancelled,
];

fn colour(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Completed => GREEN,
        NodeStatus::Failed => RED,
        NodeStatus::Skipped => YELLOW,
        NodeStatus::Cancelled => DIM,
        NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Running => CYAN,
    }
}

fn label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Ready => "ready",
        NodeStatus::Running => "running",
        NodeStatus::Completed => "completed",
        NodeStatus::Failed => "failed",
        NodeStatus::Skipped => "skipped",
        NodeStatus::Cancelled => "cancelled",
    }
}

/// Print a right-aligned phase name followed by its subject
pub fn phase(name: &str, subject: &str) {
    eprintln!("\x1b[1;36m{:>12}{} {}", name, RESET, subject);
}

pub fn section(title: &str) {
    eprintln!("\x1b[1m==> {}{}", title, RESET);
}

pub fn note(message: &str) {
    eprintln!("{CYAN}  i{RESET} {}", message);
}

pub fn detail(message: &str) {
    eprintln!("{DIM}{}{RESET}", message);
}

/// A check that held
pub fn passed(message: &str) {
    eprintln!("{GREEN}  \u{2713}{RESET} {}", message);
}

/// A check that did not hold
pub fn rejected(message: &str) {
    eprintln!("{RED}  \u{2717}{RESET} {}", message);
}

pub fn warning(message: &str) {
    eprintln!("{YELLOW}  !{RESET} {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:{RESET} {}", message);
}

pub fn node_started(context_key: &str, unit: &str) {
    println!("    [{}] {}", context_key, unit);
}

/// One line per node reaching a final state, with an optional reason below it
pub fn node_finished(
    context_key: &str,
    unit: &str,
    status: NodeStatus,
    elapsed: Option<Duration>,
    reason: Option<&str>,
) {
    let timing = elapsed
        .map(|d| format!(" ({:.2}s)", d.as_secs_f64()))
        .unwrap_or_default();
    eprintln!(
        "{}    [{}] {} {}{}{RESET}",
        colour(status),
        context_key,
        unit,
        label(status),
        timing
    );
    if let Some(reason) = reason {
        program_line(reason, status == NodeStatus::Failed);
    }
}

/// A line written by an external program, or a failure reason
pub fn program_line(line: &str, is_stderr: bool) {
    if is_stderr {
        eprintln!("{RED}        | {}{RESET}", line);
    } else {
        println!("        | {}", line);
    }
}

pub fn artifact_published(path: &Path) {
    detail(&format!("      -> {}", path.display()));
}

pub fn instance_finished(context_key: &str, success: bool) {
    if success {
        passed(&format!("{} complete", context_key));
    } else {
        rejected(&format!("{} incomplete", context_key));
    }
}

pub fn run_finished(elapsed: Duration, success: bool) {
    let message = format!("Run finished ({:.2}s)", elapsed.as_secs_f64());
    if success {
        eprintln!("\x1b[1;32m  \u{2713}{RESET} {}", message);
    } else {
        eprintln!("\x1b[1;31m  \u{2717}{RESET} {}", message);
    }
}

/// Per-state node counts, coloured by state
pub fn status_counts(report: &RunReport) {
    let counts: Vec<String> = TERMINAL
        .iter()
        .map(|&status| {
            format!(
                "{}{} {}{RESET}",
                colour(status),
                report.count(status),
                label(status)
            )
        })
        .collect();
    println!("  {} ({} total)", counts.join(", "), report.total_nodes());
}

//! Terminal output - plain ASCII, color only as emphasis

use owo_colors::OwoColorize;

use upkeep_common::orchestrator::UpdateCycleResult;

pub fn header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "-".repeat(title.len()).dimmed());
}

pub fn kv(key: &str, value: &str) {
    println!("  {:<20} {}", format!("{}:", key).dimmed(), value);
}

pub fn ok(message: &str) {
    println!("{} {}", "[OK]".bright_green(), message);
}

pub fn note(message: &str) {
    println!("{} {}", "[NOTE]".yellow(), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", "[ERROR]".bright_red(), message);
}

/// One-line rendering of a cycle outcome
pub fn cycle_result(result: &UpdateCycleResult) {
    let text = result.to_string();
    match result {
        UpdateCycleResult::UpToDate { .. } | UpdateCycleResult::Updated { .. } => ok(&text),
        UpdateCycleResult::UpdateAvailable { .. } => note(&text),
        UpdateCycleResult::CheckFailed(_) | UpdateCycleResult::InstallFailed { .. } => error(&text),
    }
}

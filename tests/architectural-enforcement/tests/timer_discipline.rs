//! Integration Test: Timer Discipline
//!
//! **Policy**: Production code MUST NOT sleep for a duration.
//! Delivery pacing waits on an absolute deadline (`sleep_until`) raced
//! against cancellation, and periodic work uses `tokio::time::interval`.
//! A relative `sleep(..)` in a loop drifts and cannot be cancelled cleanly.
//!
//! Test code (behind `#[cfg(test)]` or in `tests/`) is exempt.

use architectural_enforcement::{code_part, production_files};

/// Test that production code contains no relative sleeps
#[test]
fn test_no_relative_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_files() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if code.contains("::sleep(") || code.contains(".sleep(") || code.contains(" sleep(") {
                violations.push(file.violation(idx, "Relative sleep"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE timers:");
        eprintln!("  - tokio::time::sleep_until(deadline) inside tokio::select!");
        eprintln!("  - tokio::time::interval(..) for periodic ticks");
        panic!("\nFound {} sleep violation(s) in production code.", violations.len());
    }
}

/// Test that every deadline wait is raced against something else
///
/// A `sleep_until` outside `select!` would block cancellation until the
/// deadline passes.
#[test]
fn test_deadline_waits_are_selected() {
    let mut violations = Vec::new();

    for file in production_files() {
        for (idx, line) in file.lines.iter().enumerate() {
            if !code_part(line).contains("sleep_until(") || line.trim_start().starts_with("use ") {
                continue;
            }
            let window = idx.saturating_sub(15)..idx;
            let selected = window
                .into_iter()
                .any(|i| file.lines[i].contains("tokio::select!"));
            if !selected {
                violations.push(file.violation(idx, "Deadline wait outside select!"));
            }
        }
    }

    assert!(violations.is_empty(), "{violations:#?}");
}

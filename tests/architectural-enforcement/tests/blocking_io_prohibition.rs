//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the streaming crates MUST NOT use blocking I/O.
//! **Required**: Use `tokio::fs`, `tokio::io`, `tokio::net` and async
//! `reqwest`, not `std::fs`, `std::net` or `reqwest::blocking`.
//!
//! Blocking calls are acceptable in plain functions that run before the
//! runtime starts (argument parsing, config loading) and in test code.

use architectural_enforcement::{code_part, enclosing_context, production_files, Context};

/// Test that async production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in async code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n❌ FORBIDDEN in async code:");
        eprintln!("  - std::fs::*, std::net::*");
        eprintln!("  - std::io::stdin(), std::io::stdout()");
        eprintln!("  - std::thread::sleep");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs, tokio::io::stdout() with AsyncWriteExt");
        eprintln!("  - reqwest::Client with .await");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Test that the blocking HTTP client is never used anywhere
#[test]
fn test_no_blocking_http_client() {
    let mut violations = Vec::new();
    for file in production_files() {
        for (idx, line) in file.lines.iter().enumerate() {
            if code_part(line).contains("reqwest::blocking") {
                violations.push(file.violation(idx, "Blocking HTTP client"));
            }
        }
    }
    assert!(violations.is_empty(), "{violations:#?}");
}

fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for file in production_files() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if enclosing_context(&file.lines, idx) != Context::Async {
                continue;
            }

            if code.contains("std::fs::") {
                violations.push(file.violation(idx, "Blocking file I/O"));
            }
            if code.contains("std::net::") {
                violations.push(file.violation(idx, "Blocking network I/O"));
            }
            if code.contains("std::io::stdin()") || code.contains("std::io::stdout()") {
                violations.push(file.violation(idx, "Blocking stdin/stdout"));
            }
            if code.contains("std::thread::sleep") {
                violations.push(file.violation(idx, "Blocking sleep"));
            }
        }
    }

    violations
}

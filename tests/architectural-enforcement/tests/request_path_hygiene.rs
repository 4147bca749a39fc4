//! Integration Test: Request Path Hygiene
//!
//! **Policy**: code that runs while a client stream is open never panics on
//! a fallible value, and the library never writes to stdout. Diagnostics go
//! through `tracing`.

use architectural_enforcement::{production_lines, rust_files, violation};

/// Library sources on the request path
const REQUEST_PATH_DIRS: &[&str] = &[
    "answer/core/src/relay",
    "answer/core/src/transport",
    "answer/core/src/retrieval",
    "answer/daemon/src",
];

/// Individual request path files outside those directories
const REQUEST_PATH_FILES: &[&str] = &[
    "answer/core/src/pipeline.rs",
    "answer/core/src/fallback.rs",
    "answer/core/src/finalize.rs",
    "answer/core/src/persistence.rs",
];

#[test]
fn test_no_unwrap_on_request_path() {
    let mut files = Vec::new();
    for dir in REQUEST_PATH_DIRS {
        files.extend(rust_files(dir));
    }
    for file in REQUEST_PATH_FILES {
        files.push(architectural_enforcement::workspace_root().join(file));
    }

    let mut violations = Vec::new();
    for path in &files {
        for line in production_lines(path) {
            if line.code.contains(".unwrap()") || line.code.contains(".expect(") {
                violations.push(violation(path, &line));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Panicking calls on the request path:\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        panic!("\nFound {} unwrap/expect call(s). Propagate or log instead.", violations.len());
    }
}

#[test]
fn test_library_does_not_print() {
    let mut violations = Vec::new();
    for path in rust_files("answer/core/src") {
        for line in production_lines(&path) {
            if line.code.contains("println!") || line.code.contains("print!(") {
                violations.push(violation(&path, &line));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "stdout writes in answer-core:\n{}",
        violations.join("\n")
    );
}

//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the answer crates MUST NOT block a runtime
//! thread, and every async sleep MUST be raced against cancellation so a
//! stopped request never waits out a delay.
//!
//! **Exceptions**: the scripted backend, which replays timed test scripts.

use architectural_enforcement::{production_lines, rust_files, violation, SourceLine};

/// Production source roots
const PRODUCTION_DIRS: &[&str] = &["answer/core/src", "answer/daemon/src"];

/// Files allowed to sleep without a race
const SLEEP_EXEMPT: &[&str] = &["backend/scripted.rs"];

/// Lines searched above a sleep for an enclosing `select!`
const SELECT_WINDOW: usize = 6;

#[test]
fn test_no_blocking_sleep() {
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for path in rust_files(dir) {
            for line in production_lines(&path) {
                if line.code.contains("thread::sleep") {
                    violations.push(violation(&path, &line));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking sleep calls found in production code:\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        panic!("\nFound {} blocking sleep(s). Use tokio::time instead.", violations.len());
    }
}

#[test]
fn test_async_sleep_is_cancellable() {
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for path in rust_files(dir) {
            let shown = path.to_string_lossy().replace('\\', "/");
            if SLEEP_EXEMPT.iter().any(|exempt| shown.ends_with(exempt)) {
                continue;
            }

            let lines = production_lines(&path);
            for (idx, line) in lines.iter().enumerate() {
                if (line.code.contains("::sleep(") || line.code.contains(".sleep("))
                    && !in_select(&lines, idx)
                {
                    violations.push(violation(&path, line));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleeps not raced against cancellation:\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        eprintln!("\n✅ Wrap the sleep in tokio::select! with the request's CancellationToken");
        panic!("\nFound {} unraced sleep(s).", violations.len());
    }
}

/// Whether the sleep at `idx` sits inside a `select!` with a cancellation arm
fn in_select(lines: &[SourceLine], idx: usize) -> bool {
    let start = idx.saturating_sub(SELECT_WINDOW);
    let window = &lines[start..=idx];
    window.iter().any(|l| l.code.contains("select!"))
        && window.iter().any(|l| l.code.contains("cancelled()"))
}

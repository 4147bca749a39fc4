//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the answer pipeline:
//! - No blocking or unraced sleeps in production code
//! - No panicking shortcuts on the request path
//! - No stdout printing from the library
//!
//! The helpers below locate production sources and strip their test modules,
//! so every rule only sees code that ships.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// All `.rs` files under `dir`, relative to the workspace root
#[must_use]
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root().join(dir);
    if !root.exists() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// A production source line
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// 1-based line number
    pub number: usize,
    /// Line text with any trailing `//` comment removed
    pub code: String,
}

/// Lines of `path` before its `#[cfg(test)]` module, comments stripped
///
/// Doc comments and comment-only lines are dropped.
#[must_use]
pub fn production_lines(path: &Path) -> Vec<SourceLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter_map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            if code.trim().is_empty() {
                return None;
            }
            Some(SourceLine {
                number: idx + 1,
                code: code.to_string(),
            })
        })
        .collect()
}

/// Format a violation for the failure report
#[must_use]
pub fn violation(path: &Path, line: &SourceLine) -> String {
    let shown = path
        .strip_prefix(workspace_root())
        .unwrap_or(path)
        .display()
        .to_string();
    format!("{}:{} - {}", shown, line.number, line.code.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let dir = std::env::temp_dir().join(format!("arch-enf-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sample.rs");
        fs::write(
            &file,
            "fn a() {}\n// comment\nfn b() { x.unwrap() } // note\n#[cfg(test)]\nmod tests {}\n",
        )
        .unwrap();

        let lines = production_lines(&file);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].number, 3);
        assert!(!lines[1].code.contains("note"));

        fs::remove_dir_all(&dir).unwrap();
    }
}

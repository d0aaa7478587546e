//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the production crates of the workspace:
//! - All I/O inside async code is async
//! - No sleeping in production code; timers wait on deadlines or intervals
//!
//! The helpers here locate production sources and answer simple questions
//! about the context of a line. They are line-based heuristics, not a parser.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["stream/core/src", "stream/cli/src"];

/// Workspace root, derived from this package's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// A production source file with its test module cut off
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Read `path`, keeping only lines before the `#[cfg(test)]` module
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        let lines = content
            .lines()
            .take_while(|line| line.trim() != "#[cfg(test)]")
            .map(str::to_string)
            .collect();
        Some(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    /// Format a violation for `line_idx`
    #[must_use]
    pub fn violation(&self, line_idx: usize, kind: &str) -> String {
        format!(
            "{}:{} - {kind}: {}",
            self.path.display(),
            line_idx + 1,
            self.lines[line_idx].trim()
        )
    }
}

/// Every `.rs` file under the production directories
#[must_use]
pub fn production_files() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                if let Some(file) = SourceFile::load(entry.path()) {
                    files.push(file);
                }
            }
        }
    }
    files
}

/// The part of a line before any `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Execution context of a line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Context {
    /// Inside an `async fn` or an `async` block
    Async,
    /// Inside a plain `fn`
    Sync,
    /// Outside any function
    Item,
}

/// Classify the innermost function or async block enclosing `idx`
#[must_use]
pub fn enclosing_context<S: AsRef<str>>(lines: &[S], idx: usize) -> Context {
    for i in (0..idx).rev() {
        let line = code_part(lines[i].as_ref()).trim();

        if line.contains("async move") || line.ends_with("async {") {
            return Context::Async;
        }
        let signature = strip_visibility(line);
        if signature.starts_with("async fn ") {
            return Context::Async;
        }
        if signature.starts_with("fn ") {
            return Context::Sync;
        }
        if line.starts_with("mod ") || line.starts_with("pub mod ") {
            return Context::Item;
        }
    }
    Context::Item
}

fn strip_visibility(line: &str) -> &str {
    let line = line
        .strip_prefix("pub(crate) ")
        .or_else(|| line.strip_prefix("pub "))
        .unwrap_or(line);
    line.strip_prefix("const ").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_fn_detection() {
        let code = [
            "pub async fn open(&self) -> Result<()> {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert_eq!(enclosing_context(&code, 1), Context::Async);
    }

    #[test]
    fn test_sync_fn_detection() {
        let code = [
            "pub fn load_config() -> Result<Config> {",
            "    let contents = std::fs::read_to_string(\"config.toml\")?;",
            "}",
        ];
        assert_eq!(enclosing_context(&code, 1), Context::Sync);
    }

    #[test]
    fn test_async_block_in_sync_fn() {
        let code = [
            "fn spawn_printer() {",
            "    tokio::spawn(async move {",
            "        let out = std::io::stdout();",
            "    });",
            "}",
        ];
        assert_eq!(enclosing_context(&code, 2), Context::Async);
    }

    #[test]
    fn test_code_part_strips_comments() {
        assert_eq!(code_part("let x = 1; // std::fs::read"), "let x = 1; ");
    }

    #[test]
    fn test_workspace_has_production_sources() {
        assert!(!production_files().is_empty());
    }
}

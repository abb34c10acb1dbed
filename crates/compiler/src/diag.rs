//! Diagnostics
//!
//! Source locations, diagnostic records, and the engine that collects them
//! and decides the process exit code.
//!
//! The current-location cell is the one process-global in the crate. Parse
//! actions publish their position before running; a diagnostic fired from
//! any component (or a signal handler / debug-printer thread) can then read
//! a coherent `{file, line, column}` tuple without taking a lock. The cell
//! is a seqlock: the version counter is bumped to odd before the payload is
//! written and to even after, and readers retry-free detect torn reads by
//! comparing the version before and after the payload loads.

use crate::strings::{StrId, StringTable};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A point in a source file. Lines and columns are 0-indexed internally;
/// rendering adds 1 for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: StrId,
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(file: StrId, line: u32, column: u32) -> Self {
        SourceLoc { file, line, column }
    }

    /// Location used when no position is known (internal errors, torn reads).
    pub fn unknown() -> Self {
        SourceLoc {
            file: StrId::EMPTY,
            line: 0,
            column: 0,
        }
    }

    pub fn render(&self, strings: &StringTable) -> String {
        let file = strings.resolve(self.file);
        if file.is_empty() {
            "<unknown>".to_string()
        } else {
            format!("{}:{}:{}", file, self.line + 1, self.column + 1)
        }
    }
}

// Seqlock cell for the current diagnostic location. Writers are the
// single compilation thread; readers may be anywhere.
static LOC_VERSION: AtomicU64 = AtomicU64::new(0);
static LOC_FILE: AtomicU32 = AtomicU32::new(0);
static LOC_LINE: AtomicU32 = AtomicU32::new(0);
static LOC_COLUMN: AtomicU32 = AtomicU32::new(0);

/// Publish the current location. Called before each parse action.
pub fn update_current_location(loc: SourceLoc) {
    // Odd version marks the critical section.
    LOC_VERSION.fetch_add(1, Ordering::AcqRel);
    LOC_FILE.store(loc.file.index() as u32, Ordering::Relaxed);
    LOC_LINE.store(loc.line, Ordering::Relaxed);
    LOC_COLUMN.store(loc.column, Ordering::Relaxed);
    LOC_VERSION.fetch_add(1, Ordering::Release);
}

/// Read the current location coherently.
///
/// Returns `None` when a write is in progress or completed between the two
/// version reads; callers fall back to `<unknown>`.
pub fn current_location() -> Option<SourceLoc> {
    let start = LOC_VERSION.load(Ordering::Acquire);
    if start & 1 != 0 {
        return None;
    }
    let file = LOC_FILE.load(Ordering::Relaxed);
    let line = LOC_LINE.load(Ordering::Relaxed);
    let column = LOC_COLUMN.load(Ordering::Relaxed);
    let end = LOC_VERSION.load(Ordering::Acquire);
    if start != end {
        return None;
    }
    Some(SourceLoc {
        file: StrId::from_index(file),
        line,
        column,
    })
}

/// Diagnostic severity. `Error` and above fail the compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
    /// Internal invariant violation (exit code 2, never user error).
    Internal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Internal => "internal error",
        };
        write!(f, "{}", s)
    }
}

/// A single reported problem.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub loc: SourceLoc,
    pub message: String,
}

impl Diagnostic {
    pub fn error(loc: SourceLoc, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            loc,
            message: message.into(),
        }
    }

    pub fn warning(loc: SourceLoc, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            loc,
            message: message.into(),
        }
    }

    /// Internal invariant violation at the current published location.
    pub fn internal(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Internal,
            loc: current_location().unwrap_or_else(SourceLoc::unknown),
            message: message.into(),
        }
    }

    /// Error at the current published location, for components that do not
    /// carry a location of their own (constant evaluator, type registry).
    pub fn error_here(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            loc: current_location().unwrap_or_else(SourceLoc::unknown),
            message: message.into(),
        }
    }

    pub fn render(&self, strings: &StringTable) -> String {
        format!(
            "{}: {}: {}",
            self.loc.render(strings),
            self.severity,
            self.message
        )
    }
}

/// Collects diagnostics across the pipeline and maps them to exit codes.
#[derive(Debug, Default)]
pub struct DiagnosticEngine {
    diags: Vec<Diagnostic>,
    errors: usize,
    internal_errors: usize,
}

impl DiagnosticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, diag: Diagnostic) {
        match diag.severity {
            Severity::Error => self.errors += 1,
            Severity::Internal => self.internal_errors += 1,
            _ => {}
        }
        self.diags.push(diag);
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0 || self.internal_errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    /// 0 on success, 1 on any error-severity diagnostic, 2 on internal
    /// invariant failure.
    pub fn exit_code(&self) -> i32 {
        if self.internal_errors > 0 {
            2
        } else if self.errors > 0 {
            1
        } else {
            0
        }
    }

    pub fn render_all(&self, strings: &StringTable) -> String {
        let mut out = String::new();
        for d in &self.diags {
            out.push_str(&d.render(strings));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_seqlock_roundtrip() {
        let mut strings = StringTable::new();
        let file = strings.intern("main.cpp");
        update_current_location(SourceLoc::new(file, 9, 4));
        let loc = current_location().expect("no write in progress");
        assert_eq!(loc.file, file);
        assert_eq!(loc.line, 9);
        assert_eq!(loc.column, 4);
    }

    #[test]
    #[serial]
    fn test_seqlock_overwrite_keeps_latest() {
        let mut strings = StringTable::new();
        let a = strings.intern("a.cpp");
        let b = strings.intern("b.cpp");
        update_current_location(SourceLoc::new(a, 1, 1));
        update_current_location(SourceLoc::new(b, 2, 2));
        let loc = current_location().unwrap();
        assert_eq!(loc.file, b);
        assert_eq!(loc.line, 2);
    }

    #[test]
    fn test_exit_codes() {
        let mut engine = DiagnosticEngine::new();
        assert_eq!(engine.exit_code(), 0);
        engine.report(Diagnostic::warning(SourceLoc::unknown(), "shadowed"));
        assert_eq!(engine.exit_code(), 0);
        engine.report(Diagnostic::error(SourceLoc::unknown(), "bad token"));
        assert_eq!(engine.exit_code(), 1);
        engine.report(Diagnostic {
            severity: Severity::Internal,
            loc: SourceLoc::unknown(),
            message: "payload mismatch".into(),
        });
        assert_eq!(engine.exit_code(), 2);
    }

    #[test]
    fn test_render_uses_one_indexed_positions() {
        let mut strings = StringTable::new();
        let file = strings.intern("x.cpp");
        let d = Diagnostic::error(SourceLoc::new(file, 0, 0), "unexpected token");
        assert_eq!(d.render(&strings), "x.cpp:1:1: error: unexpected token");
    }
}

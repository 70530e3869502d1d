//! Local syntax linter.
//!
//! A synchronous pre-flight check that catches code which cannot possibly
//! compile before a sandbox round-trip is spent on it. Two checks run over
//! the masked source:
//!
//! - **Bracket balance**: `()`, `[]` and `{}` must nest. Unexpected or
//!   mismatched closers and unclosed openers are errors.
//! - **Statement termination**: a code line that neither ends in a
//!   terminator nor starts with a control-flow or declaration keyword gets a
//!   "possible missing terminator" warning.
//!
//! Only errors block a run. [`LintDebouncer`] coalesces rapid edits into a
//! single lint pass.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::diagnostics::Diagnostic;
use crate::language::{mask_source, LanguageProfile, MaskMode};

/// Default debounce window between the last edit and the lint pass.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Static syntax checks driven by a [`LanguageProfile`].
#[derive(Debug, Clone, Copy)]
pub struct Linter {
    profile: &'static LanguageProfile,
}

impl Linter {
    /// Creates a linter for the given profile.
    #[must_use]
    pub const fn new(profile: &'static LanguageProfile) -> Self {
        Self { profile }
    }

    /// Lints `source`, returning diagnostics ordered by position.
    ///
    /// # Examples
    ///
    /// ```
    /// use codequest_engine::{LanguageProfile, Linter, Severity};
    ///
    /// let linter = Linter::new(LanguageProfile::csharp());
    /// let diagnostics = linter.lint("class P {\n");
    /// assert_eq!(diagnostics.len(), 1);
    /// assert_eq!(diagnostics[0].severity, Severity::Error);
    /// assert_eq!((diagnostics[0].line, diagnostics[0].column), (1, 9));
    /// ```
    #[must_use]
    pub fn lint(&self, source: &str) -> Vec<Diagnostic> {
        let masked = mask_source(source, MaskMode::CommentsAndStrings);
        let mut diagnostics = check_brackets(&masked);
        diagnostics.extend(self.check_terminators(&masked));
        diagnostics.sort_by_key(|d| (d.line, d.column));
        diagnostics
    }

    fn check_terminators(&self, masked: &str) -> Vec<Diagnostic> {
        let lines: Vec<&str> = masked.lines().collect();
        let mut diagnostics = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty()
                || self.profile.ends_with_terminator(trimmed)
                || self.profile.starts_with_continuation(trimmed)
                || self.profile.starts_with_control_flow(trimmed)
                || self.profile.starts_with_declaration(trimmed)
            {
                continue;
            }

            // The statement may carry on to the next code line.
            let next_continues = lines[idx + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
                .is_some_and(|l| self.profile.starts_with_continuation(l));
            if next_continues {
                continue;
            }

            let column = line.trim_end().chars().count() + 1;
            diagnostics.push(Diagnostic::lint_warning(
                to_u32(idx + 1),
                to_u32(column),
                "Possible missing terminator ';' at end of line",
            ));
        }

        diagnostics
    }
}

/// Returns `true` if any diagnostic blocks a sandbox run.
#[must_use]
pub fn has_blocking(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity.is_error())
}

fn check_brackets(masked: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut stack: Vec<(char, u32, u32)> = Vec::new();

    for (line_idx, line) in masked.lines().enumerate() {
        let line_no = to_u32(line_idx + 1);
        for (col_idx, c) in line.chars().enumerate() {
            let column = to_u32(col_idx + 1);
            match c {
                '(' | '[' | '{' => stack.push((c, line_no, column)),
                ')' | ']' | '}' => match stack.pop() {
                    None => diagnostics.push(Diagnostic::lint_error(
                        line_no,
                        column,
                        format!("Unexpected closing '{c}'"),
                    )),
                    Some((open, open_line, open_col)) if closer_for(open) != c => {
                        diagnostics.push(Diagnostic::lint_error(
                            line_no,
                            column,
                            format!(
                                "Mismatched '{c}': expected '{}' to close '{open}' from line {open_line}, column {open_col}",
                                closer_for(open)
                            ),
                        ));
                    }
                    Some(_) => {}
                },
                _ => {}
            }
        }
    }

    for (open, line, column) in stack {
        diagnostics.push(Diagnostic::lint_error(
            line,
            column,
            format!("Unclosed '{open}'"),
        ));
    }

    diagnostics
}

const fn closer_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ============================================================================
// Debouncer
// ============================================================================

/// Lints the most recent source after a quiet period.
///
/// Every [`schedule`](Self::schedule) call restarts the window; only the last
/// source scheduled before the window elapses is linted. Results arrive on
/// the receiver returned by [`spawn`](Self::spawn). The background task ends
/// when the cancel token fires or the debouncer is dropped.
#[derive(Debug, Clone)]
pub struct LintDebouncer {
    tx: mpsc::UnboundedSender<String>,
}

/// A completed debounced lint pass.
#[derive(Debug, Clone)]
pub struct LintResult {
    /// The source that was linted.
    pub source: String,
    /// Its diagnostics.
    pub diagnostics: Vec<Diagnostic>,
}

impl LintDebouncer {
    /// Spawns the debounce task on the current tokio runtime.
    #[must_use]
    pub fn spawn(
        linter: Linter,
        window: Duration,
        cancel: CancelToken,
    ) -> (Self, mpsc::UnboundedReceiver<LintResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        tokio::spawn(debounce_loop(linter, window, rx, result_tx, cancel));
        (Self { tx }, result_rx)
    }

    /// Schedules `source` for linting, replacing anything pending.
    pub fn schedule(&self, source: impl Into<String>) {
        // A closed channel means the task has stopped; nothing to do.
        let _ = self.tx.send(source.into());
    }
}

async fn debounce_loop(
    linter: Linter,
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<String>,
    results: mpsc::UnboundedSender<LintResult>,
    cancel: CancelToken,
) {
    loop {
        let mut pending = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(source) => source,
                None => break,
            },
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                next = rx.recv() => match next {
                    Some(source) => {
                        trace!("lint window reset");
                        pending = source;
                    }
                    None => break,
                },
                () = tokio::time::sleep(window) => break,
            }
        }

        let diagnostics = linter.lint(&pending);
        debug!(count = diagnostics.len(), "debounced lint pass");
        if results
            .send(LintResult {
                source: pending,
                diagnostics,
            })
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;

    fn lint(source: &str) -> Vec<Diagnostic> {
        Linter::new(LanguageProfile::csharp()).lint(source)
    }

    const VALID: &str = r#"using System;

class Program
{
    // Reads a radius and prints the volume.
    static void Main()
    {
        Console.Write("Enter radius: ");
        double r = double.Parse(Console.ReadLine());
        double v = 4.0 / 3.0 * Math.PI * Math.Pow(r, 3);
        if (v > 0)
        {
            Console.WriteLine("Volume: " + v.ToString("F2"));
        }
    }
}
"#;

    #[test]
    fn test_valid_program_is_clean() {
        assert!(lint(VALID).is_empty(), "{:?}", lint(VALID));
    }

    #[test]
    fn test_unclosed_brace_reports_once_at_open_location() {
        let source = "class Program\n{\n    static void Main() {\n        Console.WriteLine(1);\n    }\n";
        let diagnostics = lint(source);
        let errors: Vec<_> = diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!((errors[0].line, errors[0].column), (2, 1));
        assert!(errors[0].message.contains("Unclosed"));
    }

    #[test]
    fn test_unexpected_closer_is_an_error() {
        let diagnostics = lint("int x = 1;\n}\n");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!((diagnostics[0].line, diagnostics[0].column), (2, 1));
        assert!(diagnostics[0].message.contains("Unexpected"));
    }

    #[test]
    fn test_mismatched_closer_is_an_error() {
        let diagnostics = lint("var x = Foo(1];");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].column, 14);
        assert!(diagnostics[0].message.contains("Mismatched"));
    }

    #[test]
    fn test_brackets_in_strings_and_comments_are_ignored() {
        let source = "Console.WriteLine(\"(\"); // )\n/* { */ var c = '[';\n";
        assert!(lint(source).is_empty());
    }

    #[test]
    fn test_missing_semicolon_is_a_warning_at_end_of_line() {
        let diagnostics = lint("int x = 1\nint y = 2;\n");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert_eq!((diagnostics[0].line, diagnostics[0].column), (1, 10));
        assert!(!has_blocking(&diagnostics));
    }

    #[test]
    fn test_trailing_comment_does_not_hide_missing_terminator() {
        let diagnostics = lint("int x = 1 // one\n");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].column, 10);
    }

    #[test]
    fn test_continued_statements_are_not_flagged() {
        let source = "var total = values\n    .Where(v => v > 0)\n    .Sum();\n";
        assert!(lint(source).is_empty());
    }

    #[test]
    fn test_control_flow_lines_are_not_flagged() {
        let source = "if (x > 1)\n    y = 2;\nelse\n    y = 3;\nwhile (y < 10)\n    y++;\n";
        assert!(lint(source).is_empty());
    }

    #[tokio::test]
    async fn test_debouncer_lints_only_last_source() {
        let cancel = CancelToken::new();
        let (debouncer, mut results) = LintDebouncer::spawn(
            Linter::new(LanguageProfile::csharp()),
            Duration::from_millis(30),
            cancel.clone(),
        );

        debouncer.schedule("class A {");
        debouncer.schedule("class B {");
        debouncer.schedule("class C { }");

        let result = tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.source, "class C { }");
        assert!(result.diagnostics.is_empty());

        // No second pass for the superseded sources.
        let extra = tokio::time::timeout(Duration::from_millis(100), results.recv()).await;
        assert!(extra.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_debouncer_stops_on_cancel() {
        let cancel = CancelToken::new();
        let (debouncer, mut results) = LintDebouncer::spawn(
            Linter::new(LanguageProfile::csharp()),
            Duration::from_millis(200),
            cancel.clone(),
        );

        debouncer.schedule("class A {");
        cancel.cancel();

        let closed = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}

//! Structured diagnostics and editor markers.
//!
//! Diagnostics come from two places: the local [`crate::Linter`] (warnings
//! and errors) and compiler output returned by the sandbox (always errors).
//! [`DiagnosticSet`] keeps both lists and recomputes the merged view whenever
//! either one changes.

use serde::{Deserialize, Serialize};

use crate::language::LanguageProfile;

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks a sandbox run.
    Error,
    /// Informational only.
    Warning,
}

impl Severity {
    /// Returns `true` for [`Severity::Error`].
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// Which component produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSource {
    /// The local syntax linter.
    Linter,
    /// The compiler, via sandbox standard error.
    Compiler,
}

impl std::fmt::Display for DiagnosticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linter => write!(f, "linter"),
            Self::Compiler => write!(f, "compiler"),
        }
    }
}

/// A located finding in learner source. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
    /// Human-readable message.
    pub message: String,
    /// Producing component.
    pub source: DiagnosticSource,
    /// Severity.
    pub severity: Severity,
    /// Compiler error code (e.g. `CS1002`), when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Diagnostic {
    /// Creates a linter error.
    #[must_use]
    pub fn lint_error(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            source: DiagnosticSource::Linter,
            severity: Severity::Error,
            code: None,
        }
    }

    /// Creates a linter warning.
    #[must_use]
    pub fn lint_warning(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::lint_error(line, column, message)
        }
    }

    /// Creates a compiler error.
    #[must_use]
    pub fn compile_error(
        line: u32,
        column: u32,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            source: DiagnosticSource::Compiler,
            severity: Severity::Error,
            code: Some(code.into()),
        }
    }

    /// Converts to a single-character editor marker.
    #[must_use]
    pub fn to_marker(&self) -> EditorMarker {
        let message = match &self.code {
            Some(code) => format!("{code}: {}", self.message),
            None => self.message.clone(),
        };
        EditorMarker {
            start_line: self.line,
            start_column: self.column,
            end_line: self.line,
            end_column: self.column.saturating_add(1),
            message,
            severity: self.severity,
        }
    }

    /// Converts to an editor marker that spans the identifier starting at
    /// the diagnostic position in `source`, falling back to a point marker.
    #[must_use]
    pub fn to_marker_in(&self, source: &str) -> EditorMarker {
        let mut marker = self.to_marker();
        let token_len = self
            .line
            .checked_sub(1)
            .and_then(|idx| source.lines().nth(idx as usize))
            .and_then(|line| {
                let start = self.column.checked_sub(1)? as usize;
                let len = line
                    .chars()
                    .skip(start)
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .count();
                u32::try_from(len).ok()
            })
            .unwrap_or(0);
        if token_len > 1 {
            marker.end_column = self.column.saturating_add(token_len);
        }
        marker
    }
}

/// An inline marker for the editor collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorMarker {
    /// 1-based start line.
    pub start_line: u32,
    /// 1-based start column.
    pub start_column: u32,
    /// 1-based end line.
    pub end_line: u32,
    /// 1-based exclusive end column.
    pub end_column: u32,
    /// Message shown on hover.
    pub message: String,
    /// Severity, used for styling.
    pub severity: Severity,
}

/// Extracts location-tagged compiler errors from sandbox standard error.
///
/// # Examples
///
/// ```
/// use codequest_engine::{parse_compiler_diagnostics, LanguageProfile, Severity};
///
/// let stderr = "Program.cs(5,27): error CS1002: ; expected\n";
/// let diagnostics = parse_compiler_diagnostics(LanguageProfile::csharp(), stderr);
/// assert_eq!(diagnostics.len(), 1);
/// assert_eq!((diagnostics[0].line, diagnostics[0].column), (5, 27));
/// assert_eq!(diagnostics[0].severity, Severity::Error);
/// ```
#[must_use]
pub fn parse_compiler_diagnostics(profile: &LanguageProfile, stderr: &str) -> Vec<Diagnostic> {
    profile
        .compile_errors(stderr)
        .map(|(line, column, code, message)| Diagnostic::compile_error(line, column, code, message))
        .collect()
}

/// Linter and compiler diagnostics with a merged view.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticSet {
    lint: Vec<Diagnostic>,
    compile: Vec<Diagnostic>,
    merged: Vec<Diagnostic>,
}

impl DiagnosticSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the linter diagnostics.
    pub fn set_lint(&mut self, diagnostics: Vec<Diagnostic>) {
        self.lint = diagnostics;
        self.remerge();
    }

    /// Replaces the compiler diagnostics.
    pub fn set_compile(&mut self, diagnostics: Vec<Diagnostic>) {
        self.compile = diagnostics;
        self.remerge();
    }

    /// Clears both lists.
    pub fn clear(&mut self) {
        self.lint.clear();
        self.compile.clear();
        self.merged.clear();
    }

    /// Linter diagnostics.
    #[must_use]
    pub fn lint(&self) -> &[Diagnostic] {
        &self.lint
    }

    /// Compiler diagnostics.
    #[must_use]
    pub fn compile(&self) -> &[Diagnostic] {
        &self.compile
    }

    /// Both lists, ordered by position.
    #[must_use]
    pub fn merged(&self) -> &[Diagnostic] {
        &self.merged
    }

    /// Returns `true` if any linter diagnostic is an error.
    #[must_use]
    pub fn has_lint_errors(&self) -> bool {
        self.lint.iter().any(|d| d.severity.is_error())
    }

    /// Editor markers for the merged view.
    #[must_use]
    pub fn markers(&self, source: &str) -> Vec<EditorMarker> {
        self.merged
            .iter()
            .map(|d| match d.source {
                DiagnosticSource::Compiler => d.to_marker_in(source),
                DiagnosticSource::Linter => d.to_marker(),
            })
            .collect()
    }

    fn remerge(&mut self) {
        self.merged = self.lint.iter().chain(&self.compile).cloned().collect();
        self.merged.sort_by_key(|d| (d.line, d.column));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_multiple_compiler_errors() {
        let stderr = "\
Program.cs(5,27): error CS1002: ; expected
Program.cs(9,13): error CS0103: The name 'radius' does not exist in the current context
Compilation failed: 2 error(s), 0 warnings
";
        let diagnostics = parse_compiler_diagnostics(LanguageProfile::csharp(), stderr);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[1].line, 9);
        assert_eq!(diagnostics[1].code.as_deref(), Some("CS0103"));
        assert!(diagnostics
            .iter()
            .all(|d| d.severity == Severity::Error && d.source == DiagnosticSource::Compiler));
    }

    #[test]
    fn test_runtime_errors_yield_no_diagnostics() {
        let stderr = "Unhandled Exception:\nSystem.FormatException: Input string was not in a correct format.\n";
        assert!(parse_compiler_diagnostics(LanguageProfile::csharp(), stderr).is_empty());
    }

    #[test]
    fn test_merge_is_recomputed_on_either_change() {
        let mut set = DiagnosticSet::new();
        set.set_compile(vec![Diagnostic::compile_error(3, 1, "CS1002", "; expected")]);
        set.set_lint(vec![Diagnostic::lint_warning(1, 10, "possible missing terminator")]);
        assert_eq!(set.merged().len(), 2);
        assert_eq!(set.merged()[0].line, 1);

        set.set_lint(Vec::new());
        assert_eq!(set.merged().len(), 1);
        assert!(!set.has_lint_errors());

        set.clear();
        assert!(set.merged().is_empty());
    }

    #[test]
    fn test_point_marker_is_one_column_wide() {
        let marker = Diagnostic::lint_error(2, 5, "Unclosed '{'").to_marker();
        insta::assert_json_snapshot!(marker, @r###"
        {
          "startLine": 2,
          "startColumn": 5,
          "endLine": 2,
          "endColumn": 6,
          "message": "Unclosed '{'",
          "severity": "error"
        }
        "###);
    }

    #[test]
    fn test_compiler_marker_spans_identifier() {
        let source = "class P {\n  int x = radius;\n}";
        let diagnostic = Diagnostic::compile_error(2, 11, "CS0103", "The name 'radius' does not exist");
        let marker = diagnostic.to_marker_in(source);
        assert_eq!(marker.start_column, 11);
        assert_eq!(marker.end_column, 17);
        assert!(marker.message.starts_with("CS0103: "));

        // Out-of-range positions fall back to a point marker.
        let far = Diagnostic::compile_error(40, 1, "CS1002", "; expected").to_marker_in(source);
        assert_eq!(far.end_column, 2);
    }
}

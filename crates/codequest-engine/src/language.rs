//! Language profiles for source-text heuristics.
//!
//! Every pattern the engine uses to reason about learner source (input and
//! output calls, prompt literals, processing indicators, statement
//! terminators, compiler diagnostics) lives in a [`LanguageProfile`]. The
//! linter, prompt scanner, diagnostic parser and structural gate consult the
//! profile instead of hard-coding syntax.
//!
//! [`mask_source`] is the minimal tokenizer shared by those components: it
//! blanks comments (and optionally literal contents) one character at a time,
//! so line and column positions in the masked text match the original.

use std::iter::Peekable;
use std::str::Chars;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Languages with a shipped profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Language {
    /// C# console programs (`Console.ReadLine` / `Console.WriteLine`).
    #[default]
    CSharp,
}

impl Language {
    /// Parses a language name case-insensitively.
    pub(crate) fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "csharp" | "c#" | "cs" => Some(Self::CSharp),
            _ => None,
        }
    }

    /// Returns the heuristic profile for this language.
    #[must_use]
    pub fn profile(self) -> &'static LanguageProfile {
        match self {
            Self::CSharp => &CSHARP,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CSharp => write!(f, "csharp"),
        }
    }
}

impl<'de> Deserialize<'de> for Language {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid language '{s}': expected 'csharp'"))
        })
    }
}

impl Serialize for Language {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Source-text patterns for one language.
#[derive(Debug)]
pub struct LanguageProfile {
    /// Identifier sent to the sandbox.
    pub sandbox_language: &'static str,
    input_call: Regex,
    output_call: Regex,
    print_literal: Regex,
    math_call: Regex,
    arithmetic: Regex,
    compile_error: Regex,
    control_keywords: &'static [&'static str],
    declaration_keywords: &'static [&'static str],
    terminators: &'static [char],
    continuation_starts: &'static [char],
}

/// Compiles a pattern that is a string constant in this module.
#[allow(clippy::expect_used)]
fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("language profile patterns are valid regexes")
}

static CSHARP: Lazy<LanguageProfile> = Lazy::new(|| LanguageProfile {
    sandbox_language: "csharp",
    input_call: pattern(r"\bConsole\s*\.\s*Read(?:Line|Key)?\s*\("),
    output_call: pattern(r"\bConsole\s*\.\s*Write(?:Line)?\s*\("),
    print_literal: pattern(
        r#"\bConsole\s*\.\s*Write(?:Line)?\s*\(\s*(?:\$?"((?:[^"\\\n]|\\.)*)"|(?:@\$?|\$@)"((?:[^"]|"")*)")"#,
    ),
    math_call: pattern(r"\bMath\s*\.\s*[A-Za-z]+\s*\("),
    arithmetic: pattern(r"[-+*/%]"),
    compile_error: pattern(r"\((\d+),(\d+)\)\s*:\s*error\s+([A-Za-z]+\d+)\s*:\s*([^\r\n]*)"),
    control_keywords: &[
        "if", "else", "for", "foreach", "while", "do", "switch", "case", "default", "try",
        "catch", "finally", "lock", "using",
    ],
    declaration_keywords: &[
        "namespace", "class", "struct", "interface", "enum", "record", "public", "private",
        "protected", "internal", "static", "void", "abstract", "sealed", "override", "virtual",
        "async", "partial",
    ],
    terminators: &[';', '{', '}', ',', '(', '[', '+', '-', '*', '/', '=', '&', '|', '?', ':', '.'],
    continuation_starts: &['{', '}', ')', '.', '?', ':', '+', '-', '#', '['],
});

impl LanguageProfile {
    /// Returns the C# profile.
    #[must_use]
    pub fn csharp() -> &'static Self {
        &CSHARP
    }

    /// Returns `true` if `code` contains a console-input read call.
    ///
    /// `code` should be masked with [`MaskMode::CommentsAndStrings`].
    #[must_use]
    pub fn reads_input(&self, code: &str) -> bool {
        self.input_call.is_match(code)
    }

    /// Counts console-input read calls in `code`.
    #[must_use]
    pub fn input_call_count(&self, code: &str) -> usize {
        self.input_call.find_iter(code).count()
    }

    /// Byte offset of the first input read call in `code`, if any.
    #[must_use]
    pub fn first_input_call(&self, code: &str) -> Option<usize> {
        self.input_call.find(code).map(|m| m.start())
    }

    /// Returns `true` if `code` contains a console-output write call.
    #[must_use]
    pub fn writes_output(&self, code: &str) -> bool {
        self.output_call.is_match(code)
    }

    /// Returns `true` if `code` shows any processing step: an arithmetic
    /// operator, a math-library call, or a conditional/loop keyword.
    ///
    /// `code` must have string contents masked, or every `-` inside a
    /// literal would count.
    #[must_use]
    pub fn has_processing(&self, code: &str) -> bool {
        self.arithmetic.is_match(code)
            || self.math_call.is_match(code)
            || code
                .split(|c: char| !(c.is_alphanumeric() || c == '_'))
                .any(|word| self.is_processing_keyword(word))
    }

    fn is_processing_keyword(&self, word: &str) -> bool {
        matches!(
            word,
            "if" | "else" | "switch" | "for" | "foreach" | "while" | "do"
        ) && self.control_keywords.contains(&word)
    }

    /// Returns the string literal printed by the last output call in `line`.
    ///
    /// `line` should be masked with [`MaskMode::Comments`] so the literal is
    /// still present. Escape sequences are decoded; verbatim literals
    /// (`@"..."`, `@$"..."`, `$@"..."`) only collapse doubled quotes.
    #[must_use]
    pub fn printed_literal(&self, line: &str) -> Option<String> {
        self.print_literal
            .captures_iter(line)
            .last()
            .and_then(|caps| match (caps.get(1), caps.get(2)) {
                (Some(regular), _) => Some(unescape_literal(regular.as_str())),
                (None, Some(verbatim)) => Some(verbatim.as_str().replace("\"\"", "\"")),
                (None, None) => None,
            })
    }

    /// Iterates over compiler errors in `stderr` as `(line, column, code, message)`.
    pub fn compile_errors<'a>(
        &'a self,
        stderr: &'a str,
    ) -> impl Iterator<Item = (u32, u32, &'a str, &'a str)> + 'a {
        self.compile_error.captures_iter(stderr).filter_map(|caps| {
            let line = caps.get(1)?.as_str().parse().ok()?;
            let column = caps.get(2)?.as_str().parse().ok()?;
            let code = caps.get(3)?.as_str();
            let message = caps.get(4)?.as_str().trim_end();
            Some((line, column, code, message))
        })
    }

    /// Returns `true` if the trimmed line begins with a control-flow keyword.
    #[must_use]
    pub fn starts_with_control_flow(&self, trimmed: &str) -> bool {
        starts_with_any_keyword(trimmed, self.control_keywords)
    }

    /// Returns `true` if the trimmed line begins a declaration header.
    #[must_use]
    pub fn starts_with_declaration(&self, trimmed: &str) -> bool {
        starts_with_any_keyword(trimmed, self.declaration_keywords)
    }

    /// Returns `true` if the trimmed line ends a statement or block, or
    /// visibly continues onto the next line.
    #[must_use]
    pub fn ends_with_terminator(&self, trimmed: &str) -> bool {
        trimmed
            .chars()
            .last()
            .is_some_and(|c| self.terminators.contains(&c))
    }

    /// Returns `true` if the trimmed line continues a previous line.
    #[must_use]
    pub fn starts_with_continuation(&self, trimmed: &str) -> bool {
        trimmed
            .chars()
            .next()
            .is_some_and(|c| self.continuation_starts.contains(&c))
    }

    /// Returns `true` if the trimmed line is clearly a complete statement or
    /// a block boundary.
    #[must_use]
    pub fn is_statement_boundary(&self, trimmed: &str) -> bool {
        trimmed.ends_with(';')
            || trimmed.ends_with('{')
            || trimmed.ends_with('}')
            || trimmed.starts_with('{')
            || trimmed.starts_with('}')
    }
}

fn starts_with_any_keyword(trimmed: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| {
        trimmed.strip_prefix(keyword).is_some_and(|rest| {
            rest.chars()
                .next()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
        })
    })
}

/// Decodes the common backslash escapes of a string literal.
fn unescape_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// What [`mask_source`] blanks out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMode {
    /// Blank comments only; string literals stay intact.
    Comments,
    /// Blank comments and the contents of string and char literals. Quote
    /// characters are kept.
    CommentsAndStrings,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Code,
    LineComment,
    BlockComment,
    Str { verbatim: bool },
    Char,
}

/// Length of a verbatim string opening after `first`, quote included.
fn verbatim_opening(first: char, rest: &Peekable<Chars<'_>>) -> Option<usize> {
    let mut ahead = rest.clone();
    match (first, ahead.next(), ahead.next()) {
        ('@', Some('"'), _) => Some(1),
        ('@', Some('$'), Some('"')) | ('$', Some('@'), Some('"')) => Some(2),
        _ => None,
    }
}

/// Replaces comments (and optionally literal contents) with spaces.
///
/// Newlines are always preserved, so the result has the same number of
/// lines and the same number of characters per line as `source`.
#[must_use]
pub fn mask_source(source: &str, mode: MaskMode) -> String {
    let mask_strings = mode == MaskMode::CommentsAndStrings;
    let mut out = String::with_capacity(source.len());
    let mut state = ScanState::Code;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            out.push('\n');
            // Regular literals and line comments cannot span lines.
            if matches!(
                state,
                ScanState::LineComment | ScanState::Char | ScanState::Str { verbatim: false }
            ) {
                state = ScanState::Code;
            }
            continue;
        }

        match state {
            ScanState::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    state = ScanState::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = ScanState::BlockComment;
                }
                '@' | '$' if verbatim_opening(c, &chars).is_some() => {
                    out.push(c);
                    for _ in 0..verbatim_opening(c, &chars).unwrap_or(0) {
                        if let Some(next) = chars.next() {
                            out.push(next);
                        }
                    }
                    state = ScanState::Str { verbatim: true };
                }
                '"' => {
                    out.push('"');
                    state = ScanState::Str { verbatim: false };
                }
                '\'' => {
                    out.push('\'');
                    state = ScanState::Char;
                }
                _ => out.push(c),
            },
            ScanState::LineComment => out.push(' '),
            ScanState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = ScanState::Code;
                } else {
                    out.push(' ');
                }
            }
            ScanState::Str { verbatim } => {
                let keep = |out: &mut String, ch: char| {
                    out.push(if mask_strings { ' ' } else { ch });
                };
                if !verbatim && c == '\\' {
                    keep(&mut out, c);
                    if let Some(&next) = chars.peek() {
                        if next != '\n' {
                            chars.next();
                            keep(&mut out, next);
                        }
                    }
                } else if c == '"' {
                    if verbatim && chars.peek() == Some(&'"') {
                        chars.next();
                        keep(&mut out, '"');
                        keep(&mut out, '"');
                    } else {
                        out.push('"');
                        state = ScanState::Code;
                    }
                } else {
                    keep(&mut out, c);
                }
            }
            ScanState::Char => {
                if c == '\\' {
                    out.push(if mask_strings { ' ' } else { c });
                    if let Some(&next) = chars.peek() {
                        if next != '\n' {
                            chars.next();
                            out.push(if mask_strings { ' ' } else { next });
                        }
                    }
                } else if c == '\'' {
                    out.push('\'');
                    state = ScanState::Code;
                } else {
                    out.push(if mask_strings { ' ' } else { c });
                }
            }
        }
    }

    out
}

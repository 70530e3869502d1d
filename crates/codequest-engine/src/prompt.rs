//! Static prompt detection.
//!
//! Finds the first console-input read in a program and looks backwards for
//! the string literal printed just before it. That literal is what the
//! terminal shows while waiting for input, and what it strips when the
//! sandbox echoes it back.

use serde::{Deserialize, Serialize};

use crate::language::{mask_source, LanguageProfile, MaskMode};

/// Prompt shown when no explicit prompt literal is found.
pub const FALLBACK_PROMPT: &str = "> ";

/// A prompt to display before reading input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Text to append to the transcript.
    pub text: String,
    /// `true` if `text` was taken from the program source.
    pub explicit: bool,
}

impl Prompt {
    /// An explicit prompt detected in source.
    #[must_use]
    pub fn explicit(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            explicit: true,
        }
    }

    /// The generic fallback prompt.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            text: FALLBACK_PROMPT.to_string(),
            explicit: false,
        }
    }
}

/// Infers the prompt for the first input read in `source`.
///
/// Lines above the read are scanned upwards, skipping blank and comment-only
/// lines. The last literal printed on the nearest printing line wins.
/// Scanning gives up at the first line that is clearly an unrelated
/// statement or block boundary.
///
/// # Examples
///
/// ```
/// use codequest_engine::{scan_prompt, LanguageProfile};
///
/// let source = r#"
///     Console.Write("Enter radius: ");
///     double r = double.Parse(Console.ReadLine());
/// "#;
/// let prompt = scan_prompt(LanguageProfile::csharp(), source);
/// assert!(prompt.explicit);
/// assert_eq!(prompt.text, "Enter radius: ");
/// ```
#[must_use]
pub fn scan_prompt(profile: &LanguageProfile, source: &str) -> Prompt {
    let code = mask_source(source, MaskMode::CommentsAndStrings);
    let with_literals = mask_source(source, MaskMode::Comments);
    let code_lines: Vec<&str> = code.lines().collect();
    let literal_lines: Vec<&str> = with_literals.lines().collect();

    let Some((line_idx, call_col)) = code_lines
        .iter()
        .enumerate()
        .find_map(|(idx, line)| {
            profile
                .first_input_call(line)
                .map(|byte| (idx, line[..byte].chars().count()))
        })
    else {
        return Prompt::fallback();
    };

    // Same line, before the read call.
    if let Some(line) = literal_lines.get(line_idx) {
        let before: String = line.chars().take(call_col).collect();
        if let Some(text) = profile.printed_literal(&before) {
            return Prompt::explicit(text);
        }
    }

    for idx in (0..line_idx).rev() {
        let (Some(code_line), Some(literal_line)) = (code_lines.get(idx), literal_lines.get(idx))
        else {
            break;
        };
        let trimmed = code_line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(text) = profile.printed_literal(literal_line) {
            return Prompt::explicit(text);
        }
        if profile.is_statement_boundary(trimmed) {
            break;
        }
    }

    Prompt::fallback()
}

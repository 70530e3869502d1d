//! Solution verification.
//!
//! Submitting a solution runs two phases and stops at the first failure:
//!
//! 1. **Structural gate** (local): the program must read input, write
//!    output, and do some processing in between.
//! 2. **Differential testing** (sandbox): for every test input, the
//!    challenge oracle computes the expected output and the learner's
//!    program must print it somewhere in its output.
//!
//! A passing solution is graded from one to three stars by comparing its
//! length with the reference solution.

use std::time::Instant;

use codequest_sandbox::{ExecutionRequest, Sandbox};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::catalog::Challenge;
use crate::diagnostics::{parse_compiler_diagnostics, Diagnostic};
use crate::error::FailureClass;
use crate::language::{mask_source, LanguageProfile, MaskMode};
use crate::oracle::expected_output;

// ============================================================================
// Structural gate
// ============================================================================

/// Why a program failed the structural gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralFailure {
    /// No console-input read call.
    MissingInput,
    /// No console-output write call.
    MissingOutput,
    /// No arithmetic, math call, conditional or loop.
    MissingProcess,
}

impl std::fmt::Display for StructuralFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInput => write!(f, "Missing Input"),
            Self::MissingOutput => write!(f, "Missing Output"),
            Self::MissingProcess => write!(f, "Missing Process"),
        }
    }
}

/// Checks the Input → Process → Output rubric without running anything.
///
/// Comments and string contents are ignored.
pub fn structural_check(
    profile: &LanguageProfile,
    source: &str,
) -> Result<(), StructuralFailure> {
    let code = mask_source(source, MaskMode::CommentsAndStrings);
    if !profile.reads_input(&code) {
        return Err(StructuralFailure::MissingInput);
    }
    if !profile.writes_output(&code) {
        return Err(StructuralFailure::MissingOutput);
    }
    if !profile.has_processing(&code) {
        return Err(StructuralFailure::MissingProcess);
    }
    Ok(())
}

// ============================================================================
// Output comparison and grading
// ============================================================================

/// Collapses whitespace runs to single spaces and trims both ends.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Returns `true` if the normalized `expected` text appears in the
/// normalized `actual` output.
///
/// # Examples
///
/// ```
/// use codequest_engine::output_matches;
///
/// assert!(output_matches("523.60", "The volume is 523.60 cubic units."));
/// assert!(!output_matches("523.60", "The volume is 523.6 cubic units."));
/// ```
#[must_use]
pub fn output_matches(expected: &str, actual: &str) -> bool {
    normalize_whitespace(actual).contains(&normalize_whitespace(expected))
}

/// Star thresholds on `user length / reference length`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradingPolicy {
    /// Ratios at or below this earn three stars.
    pub three_star_ratio: f64,
    /// Ratios at or below this earn two stars.
    pub two_star_ratio: f64,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            three_star_ratio: 1.2,
            two_star_ratio: 1.5,
        }
    }
}

impl GradingPolicy {
    /// Grades a passing solution by length.
    ///
    /// Lengths are in characters. An empty reference always earns three
    /// stars.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stars(&self, source: &str, reference: &str) -> u8 {
        let reference_len = reference.chars().count();
        if reference_len == 0 {
            return 3;
        }
        let ratio = source.chars().count() as f64 / reference_len as f64;
        if ratio <= self.three_star_ratio {
            3
        } else if ratio <= self.two_star_ratio {
            2
        } else {
            1
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// Category of a failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Structural gate failure.
    Structural(StructuralFailure),
    /// The program wrote to standard error.
    ProgramError,
    /// The expected output was not found.
    WrongOutput,
    /// The sandbox or an oracle failed.
    SystemError,
}

/// Details of a failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailure {
    /// Category.
    pub kind: FailureKind,
    /// The failing test input, verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// The expected substring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// The program output, verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// `true` when a system error came from the sandbox being unreachable.
    #[serde(default)]
    pub network: bool,
}

/// Outcome of one differential test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// Input block.
    pub input: String,
    /// Expected substring.
    pub expected: String,
    /// Program standard output.
    pub actual: String,
    /// Whether the expected text was found.
    pub passed: bool,
    /// Time spent in the sandbox.
    pub execution_time_ms: u64,
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    /// Challenge id.
    pub challenge_id: String,
    /// Whether every phase passed.
    pub passed: bool,
    /// Stars earned, when passed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stars: Option<u8>,
    /// Learner-facing summary.
    pub message: String,
    /// Failure details, when not passed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<VerificationFailure>,
    /// Differential tests that ran.
    pub tests: Vec<TestResult>,
    /// Compiler diagnostics found in standard error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    /// Total sandbox time.
    pub execution_time_ms: u64,
}

impl VerificationReport {
    fn failed(challenge_id: &str, message: String, failure: VerificationFailure) -> Self {
        Self {
            challenge_id: challenge_id.to_string(),
            passed: false,
            stars: None,
            message,
            failure: Some(failure),
            tests: Vec::new(),
            diagnostics: Vec::new(),
            execution_time_ms: 0,
        }
    }

    /// Failure category for logs and events.
    #[must_use]
    pub fn failure_class(&self) -> Option<FailureClass> {
        let failure = self.failure.as_ref()?;
        Some(match failure.kind {
            FailureKind::ProgramError if !self.diagnostics.is_empty() => FailureClass::Compile,
            FailureKind::ProgramError => FailureClass::Runtime,
            FailureKind::SystemError if failure.network => FailureClass::Network,
            _ => FailureClass::Verification,
        })
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Runs structural and differential verification against a sandbox.
pub struct Verifier<'a> {
    sandbox: &'a dyn Sandbox,
    profile: &'static LanguageProfile,
    grading: GradingPolicy,
}

impl<'a> Verifier<'a> {
    /// Creates a verifier.
    #[must_use]
    pub fn new(
        sandbox: &'a dyn Sandbox,
        profile: &'static LanguageProfile,
        grading: GradingPolicy,
    ) -> Self {
        Self {
            sandbox,
            profile,
            grading,
        }
    }

    /// Verifies `source` against `challenge`.
    ///
    /// Never fails: sandbox and oracle errors become a
    /// [`FailureKind::SystemError`] report.
    #[instrument(skip_all, fields(challenge = %challenge.id, source_len = source.len()))]
    pub async fn verify(&self, challenge: &Challenge, source: &str) -> VerificationReport {
        if let Err(structural) = structural_check(self.profile, source) {
            debug!(%structural, "structural gate failed");
            return VerificationReport::failed(
                &challenge.id,
                structural_message(structural),
                VerificationFailure {
                    kind: FailureKind::Structural(structural),
                    input: None,
                    expected: None,
                    actual: None,
                    network: false,
                },
            );
        }

        let mut tests = Vec::with_capacity(challenge.test_inputs.len());
        let mut total_ms = 0_u64;

        for (index, input) in challenge.test_inputs.iter().enumerate() {
            let expected = match expected_output(challenge.oracle.as_ref(), input) {
                Ok(expected) => expected,
                Err(e) => {
                    warn!(test = index + 1, error = %e, "oracle failed");
                    return system_error(&challenge.id, &e.to_string(), false, tests, total_ms);
                }
            };

            let mut stdin = input.clone();
            if !stdin.ends_with('\n') {
                stdin.push('\n');
            }
            let request = ExecutionRequest::new(self.profile.sandbox_language, source)
                .with_stdin(stdin);

            let started = Instant::now();
            let output = match self.sandbox.execute(&request).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(test = index + 1, error = %e, "sandbox failed during verification");
                    return system_error(&challenge.id, &e.to_string(), e.is_network(), tests, total_ms);
                }
            };
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            total_ms = total_ms.saturating_add(elapsed);

            if output.has_stderr() {
                let diagnostics = parse_compiler_diagnostics(self.profile, &output.stderr);
                let mut report = VerificationReport::failed(
                    &challenge.id,
                    format!("Your program reported an error:\n{}", output.stderr.trim_end()),
                    VerificationFailure {
                        kind: FailureKind::ProgramError,
                        input: Some(input.clone()),
                        expected: None,
                        actual: Some(output.stderr.clone()),
                        network: false,
                    },
                );
                report.tests = tests;
                report.diagnostics = diagnostics;
                report.execution_time_ms = total_ms;
                return report;
            }

            let passed = output_matches(&expected, &output.stdout);
            tests.push(TestResult {
                input: input.clone(),
                expected: normalize_whitespace(&expected),
                actual: output.stdout.clone(),
                passed,
                execution_time_ms: elapsed,
            });

            if !passed {
                debug!(test = index + 1, "output mismatch");
                let mut report = VerificationReport::failed(
                    &challenge.id,
                    format!(
                        "Test {} failed.\nInput:\n{input}\nExpected to find:\n{}\nYour output:\n{}",
                        index + 1,
                        normalize_whitespace(&expected),
                        output.stdout
                    ),
                    VerificationFailure {
                        kind: FailureKind::WrongOutput,
                        input: Some(input.clone()),
                        expected: Some(normalize_whitespace(&expected)),
                        actual: Some(output.stdout),
                        network: false,
                    },
                );
                report.tests = tests;
                report.execution_time_ms = total_ms;
                return report;
            }
        }

        let stars = self.grading.stars(source, &challenge.reference_solution);
        info!(stars, tests = tests.len(), "solution verified");
        VerificationReport {
            challenge_id: challenge.id.clone(),
            passed: true,
            stars: Some(stars),
            message: format!(
                "All {} tests passed! You earned {stars} star{}.",
                tests.len(),
                if stars == 1 { "" } else { "s" }
            ),
            failure: None,
            tests,
            diagnostics: Vec::new(),
            execution_time_ms: total_ms,
        }
    }
}

fn structural_message(failure: StructuralFailure) -> String {
    let detail = match failure {
        StructuralFailure::MissingInput => "your program never reads from the console",
        StructuralFailure::MissingOutput => "your program never prints a result",
        StructuralFailure::MissingProcess => {
            "your program does not calculate or decide anything with its input"
        }
    };
    format!("{failure}: {detail}.")
}

fn system_error(
    challenge_id: &str,
    error: &str,
    network: bool,
    tests: Vec<TestResult>,
    total_ms: u64,
) -> VerificationReport {
    let mut report = VerificationReport::failed(
        challenge_id,
        format!("System error during verification: {error}"),
        VerificationFailure {
            kind: FailureKind::SystemError,
            input: None,
            expected: None,
            actual: None,
            network,
        },
    );
    report.tests = tests;
    report.execution_time_ms = total_ms;
    report
}

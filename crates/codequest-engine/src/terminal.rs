//! Terminal I/O emulation.
//!
//! The sandbox is batch-only: a program and all of its standard input go in,
//! all of its output comes out. [`Terminal`] makes that feel interactive. It
//! shows the detected prompt, lets the learner type after a frozen
//! *history snapshot*, and only calls the sandbox once every input line the
//! program will read has been collected.
//!
//! ```text
//!            begin_run (no reads)
//!   Idle ───────────────────────────────▶ Executing ──complete/fail──▶ Idle
//!    │                                        ▲
//!    │ begin_run (reads)                      │ submit_input (last line)
//!    ▼                                        │
//!   AwaitingInput ──submit_input (more)──▶ AwaitingInput
//! ```

use serde::{Deserialize, Serialize};

use codequest_sandbox::ExecutionOutput;

use crate::error::{EngineError, Result};
use crate::language::{mask_source, LanguageProfile, MaskMode};
use crate::prompt::{scan_prompt, Prompt};

/// Header line that introduces standard error in the transcript.
pub const ERROR_BLOCK_HEADER: &str = "--- error ---";

/// Prefix of the line rendered for sandbox-layer failures.
pub const SYSTEM_ERROR_PREFIX: &str = "[system error]";

// ============================================================================
// TerminalState
// ============================================================================

/// Terminal run state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// Nothing is running; the source is editable.
    #[default]
    Idle,
    /// Waiting for the learner to type a line of input.
    AwaitingInput,
    /// A sandbox call is in flight.
    Executing,
}

impl TerminalState {
    /// Returns `true` while the terminal waits for input.
    #[must_use]
    pub const fn is_awaiting_input(&self) -> bool {
        matches!(self, Self::AwaitingInput)
    }

    /// Returns `true` while a sandbox call is in flight.
    #[must_use]
    pub const fn is_executing(&self) -> bool {
        matches!(self, Self::Executing)
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingInput => write!(f, "awaiting_input"),
            Self::Executing => write!(f, "executing"),
        }
    }
}

// ============================================================================
// Run steps
// ============================================================================

/// What the caller must do next after driving the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStep {
    /// Show the prompt and wait for [`Terminal::submit_input`].
    AwaitInput(Prompt),
    /// Call the sandbox, then report back with [`Terminal::complete`] or
    /// [`Terminal::fail`].
    Execute(ExecutionPlan),
}

/// A ready-to-send sandbox invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Program source.
    pub source: String,
    /// Accumulated standard input, one line per read.
    pub stdin: String,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    source: String,
    reads: usize,
    prompt: Prompt,
    inputs: Vec<String>,
}

// ============================================================================
// Terminal
// ============================================================================

/// The transcript and its run state machine.
#[derive(Debug, Clone, Default)]
pub struct Terminal {
    state: TerminalState,
    transcript: String,
    snapshot: Option<String>,
    run: Option<ActiveRun>,
}

impl Terminal {
    /// Creates an idle terminal with an empty transcript.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TerminalState {
        self.state
    }

    /// Full transcript text.
    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// The frozen transcript prefix, while awaiting input.
    #[must_use]
    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    /// Input lines collected so far in the current run.
    #[must_use]
    pub fn inputs(&self) -> &[String] {
        self.run.as_ref().map_or(&[], |run| run.inputs.as_slice())
    }

    /// Starts a run of `source`.
    ///
    /// The transcript is cleared first. If the program reads console input,
    /// the detected prompt is appended, the history snapshot is taken, and
    /// the terminal waits for input. Otherwise the sandbox should be called
    /// right away with empty input.
    ///
    /// Starting a run while awaiting input abandons the pending one. Starting
    /// while executing is rejected.
    pub fn begin_run(&mut self, profile: &LanguageProfile, source: &str) -> Result<RunStep> {
        if self.state.is_executing() {
            return Err(EngineError::invalid_transition(
                self.state,
                TerminalState::Executing,
            ));
        }

        self.transcript.clear();
        self.snapshot = None;

        let code = mask_source(source, MaskMode::CommentsAndStrings);
        let reads = profile.input_call_count(&code);
        let prompt = scan_prompt(profile, source);

        self.run = Some(ActiveRun {
            source: source.to_string(),
            reads,
            prompt: prompt.clone(),
            inputs: Vec::new(),
        });

        if reads == 0 {
            self.state = TerminalState::Executing;
            return Ok(RunStep::Execute(ExecutionPlan {
                source: source.to_string(),
                stdin: String::new(),
            }));
        }

        Ok(self.await_input(prompt))
    }

    fn await_input(&mut self, prompt: Prompt) -> RunStep {
        self.transcript.push_str(&prompt.text);
        self.snapshot = Some(self.transcript.clone());
        self.state = TerminalState::AwaitingInput;
        RunStep::AwaitInput(prompt)
    }

    /// Returns `true` if `candidate` is an acceptable transcript edit: the
    /// terminal is awaiting input and `candidate` keeps the history snapshot
    /// as its prefix.
    #[must_use]
    pub fn can_edit(&self, candidate: &str) -> bool {
        self.state.is_awaiting_input()
            && self
                .snapshot
                .as_deref()
                .is_some_and(|snapshot| candidate.starts_with(snapshot))
    }

    /// Replaces the transcript with a learner edit.
    ///
    /// Fails with [`EngineError::HistoryRewrite`] unless [`can_edit`](Self::can_edit)
    /// holds.
    pub fn edit_transcript(&mut self, candidate: &str) -> Result<()> {
        if !self.can_edit(candidate) {
            return Err(EngineError::HistoryRewrite);
        }
        self.transcript = candidate.to_string();
        Ok(())
    }

    /// Types `line` after the snapshot and submits it.
    pub fn submit_line(&mut self, line: &str) -> Result<RunStep> {
        let candidate = format!("{}{line}", self.transcript);
        self.edit_transcript(&candidate)?;
        self.submit_input()
    }

    /// Submits whatever was typed after the snapshot as one input line.
    ///
    /// If the program reads more lines, the generic prompt is shown for the
    /// next one. After the last line the accumulated input is returned as an
    /// [`ExecutionPlan`].
    pub fn submit_input(&mut self) -> Result<RunStep> {
        let (TerminalState::AwaitingInput, Some(snapshot), Some(run)) =
            (self.state, self.snapshot.take(), self.run.as_mut())
        else {
            return Err(EngineError::invalid_transition(
                self.state,
                TerminalState::Executing,
            ));
        };

        let typed = self
            .transcript
            .get(snapshot.len()..)
            .unwrap_or_default()
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.transcript.truncate(snapshot.len());
        self.transcript.push_str(&typed);
        self.transcript.push('\n');
        run.inputs.push(typed);

        if run.inputs.len() < run.reads {
            return Ok(self.await_input(Prompt::fallback()));
        }

        let mut stdin = run.inputs.join("\n");
        stdin.push('\n');
        let plan = ExecutionPlan {
            source: run.source.clone(),
            stdin,
        };
        self.state = TerminalState::Executing;
        Ok(RunStep::Execute(plan))
    }

    /// Appends a sandbox response and returns to idle.
    ///
    /// The prompt echo is stripped from standard output when the prompt was
    /// explicit. Standard error is rendered as a separate error block.
    /// Returns the text that was appended.
    pub fn complete(&mut self, output: &ExecutionOutput) -> Result<String> {
        let run = self.finish_executing()?;

        let mut stdout = output.stdout.as_str();
        if run.reads > 0 && run.prompt.explicit {
            stdout = strip_prompt_echo(&run.prompt.text, stdout);
        }

        let mut appended = stdout.to_string();
        if output.has_stderr() {
            if !appended.is_empty() && !appended.ends_with('\n') {
                appended.push('\n');
            }
            appended.push_str(ERROR_BLOCK_HEADER);
            appended.push('\n');
            appended.push_str(output.stderr.trim_end());
            appended.push('\n');
        }

        self.transcript.push_str(&appended);
        Ok(appended)
    }

    /// Renders a sandbox-layer failure as a single system-error line and
    /// returns to idle.
    pub fn fail(&mut self, message: &str) -> Result<()> {
        self.finish_executing()?;
        if !self.transcript.is_empty() && !self.transcript.ends_with('\n') {
            self.transcript.push('\n');
        }
        let message = message.lines().next().unwrap_or_default();
        self.transcript
            .push_str(&format!("{SYSTEM_ERROR_PREFIX} {message}\n"));
        Ok(())
    }

    fn finish_executing(&mut self) -> Result<ActiveRun> {
        let (TerminalState::Executing, Some(run)) = (self.state, self.run.take()) else {
            return Err(EngineError::invalid_transition(self.state, TerminalState::Idle));
        };
        self.state = TerminalState::Idle;
        self.snapshot = None;
        Ok(run)
    }

    /// Clears the transcript and returns to idle, abandoning any run.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Strips the first matching prompt variant from the start of `stdout`.
///
/// Variants are tried in order: exact, CRLF line endings, LF line endings,
/// trimmed. The first one that prefixes `stdout` is removed; if none does,
/// `stdout` is returned unchanged.
///
/// # Examples
///
/// ```
/// use codequest_engine::strip_prompt_echo;
///
/// let stdout = "Enter radius: 5\nVolume: 523.60\n";
/// assert_eq!(strip_prompt_echo("Enter radius: ", stdout), "5\nVolume: 523.60\n");
/// ```
#[must_use]
pub fn strip_prompt_echo<'a>(prompt: &str, stdout: &'a str) -> &'a str {
    let lf = prompt.replace("\r\n", "\n");
    let variants = [
        prompt.to_string(),
        lf.replace('\n', "\r\n"),
        lf,
        prompt.trim().to_string(),
    ];
    variants
        .iter()
        .filter(|v| !v.is_empty())
        .find_map(|v| stdout.strip_prefix(v.as_str()))
        .unwrap_or(stdout)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const SPHERE: &str = r#"
        Console.Write("Enter radius: ");
        double r = double.Parse(Console.ReadLine());
        Console.WriteLine("Volume: " + (4.0 / 3.0 * Math.PI * r * r * r).ToString("F2"));
    "#;

    fn profile() -> &'static LanguageProfile {
        LanguageProfile::csharp()
    }

    #[test]
    fn test_strip_exact_prompt() {
        assert_eq!(
            strip_prompt_echo("Enter radius: ", "Enter radius: 5\nVolume: 523.60\n"),
            "5\nVolume: 523.60\n"
        );
    }

    #[test]
    fn test_strip_line_ending_variants() {
        assert_eq!(strip_prompt_echo("Name?\n", "Name?\r\nBob\r\n"), "Bob\r\n");
        assert_eq!(strip_prompt_echo("Name?\r\n", "Name?\nBob\n"), "Bob\n");
        assert_eq!(strip_prompt_echo("  Age: ", "Age: 3"), " 3");
    }

    #[test]
    fn test_strip_without_match_is_identity() {
        assert_eq!(strip_prompt_echo("Radius: ", "Volume: 1\n"), "Volume: 1\n");
        assert_eq!(strip_prompt_echo("   ", "abc"), "abc");
    }

    #[test]
    fn test_interactive_run_round_trip() {
        let mut terminal = Terminal::new();
        let step = terminal.begin_run(profile(), SPHERE).unwrap();
        assert_eq!(step, RunStep::AwaitInput(Prompt::explicit("Enter radius: ")));
        assert_eq!(terminal.state(), TerminalState::AwaitingInput);
        assert_eq!(terminal.snapshot(), Some("Enter radius: "));

        let step = terminal.submit_line("5").unwrap();
        let RunStep::Execute(plan) = step else {
            panic!("expected execute, got {step:?}");
        };
        assert_eq!(plan.stdin, "5\n");
        assert_eq!(terminal.transcript(), "Enter radius: 5\n");
        assert!(terminal.state().is_executing());

        let appended = terminal
            .complete(&ExecutionOutput::new("Enter radius: Volume: 523.60\n", ""))
            .unwrap();
        assert_eq!(appended, "Volume: 523.60\n");
        assert_eq!(terminal.state(), TerminalState::Idle);
        insta::assert_snapshot!(terminal.transcript(), @r###"
        Enter radius: 5
        Volume: 523.60
        "###);
    }

    #[test]
    fn test_non_interactive_run_executes_immediately() {
        let mut terminal = Terminal::new();
        let step = terminal
            .begin_run(profile(), r#"Console.WriteLine("hi");"#)
            .unwrap();
        assert_eq!(
            step,
            RunStep::Execute(ExecutionPlan {
                source: r#"Console.WriteLine("hi");"#.to_string(),
                stdin: String::new(),
            })
        );
        terminal.complete(&ExecutionOutput::new("hi\n", "")).unwrap();
        assert_eq!(terminal.transcript(), "hi\n");
    }

    #[test]
    fn test_history_cannot_be_rewritten() {
        let mut terminal = Terminal::new();
        terminal.begin_run(profile(), SPHERE).unwrap();

        assert!(terminal.can_edit("Enter radius: 12"));
        assert!(!terminal.can_edit("Enter rad"));
        assert!(matches!(
            terminal.edit_transcript("Changed: 5"),
            Err(EngineError::HistoryRewrite)
        ));
        assert_eq!(terminal.transcript(), "Enter radius: ");

        terminal.edit_transcript("Enter radius: 12").unwrap();
        terminal.edit_transcript("Enter radius: 1").unwrap();
        let RunStep::Execute(plan) = terminal.submit_input().unwrap() else {
            panic!("expected execute");
        };
        assert_eq!(plan.stdin, "1\n");
    }

    #[test]
    fn test_idle_transcript_is_not_editable() {
        let mut terminal = Terminal::new();
        assert!(!terminal.can_edit("anything"));
        assert!(terminal.edit_transcript("anything").is_err());
    }

    #[test]
    fn test_multiple_reads_collect_all_lines_before_executing() {
        let source = r#"
            Console.Write("Width: ");
            double w = double.Parse(Console.ReadLine());
            Console.Write("Height: ");
            double h = double.Parse(Console.ReadLine());
            Console.WriteLine(w * h);
        "#;
        let mut terminal = Terminal::new();
        terminal.begin_run(profile(), source).unwrap();

        let step = terminal.submit_line("3").unwrap();
        assert_eq!(step, RunStep::AwaitInput(Prompt::fallback()));
        assert_eq!(terminal.snapshot(), Some("Width: 3\n> "));
        assert_eq!(terminal.inputs(), ["3"]);

        let RunStep::Execute(plan) = terminal.submit_line("4").unwrap() else {
            panic!("expected execute");
        };
        assert_eq!(plan.stdin, "3\n4\n");

        terminal
            .complete(&ExecutionOutput::new("Width: Height: 12\n", ""))
            .unwrap();
        assert_eq!(terminal.transcript(), "Width: 3\n> 4\nHeight: 12\n");
    }

    #[test]
    fn test_stderr_renders_as_error_block() {
        let mut terminal = Terminal::new();
        terminal
            .begin_run(profile(), r#"Console.Write("x");"#)
            .unwrap();
        terminal
            .complete(&ExecutionOutput::new(
                "partial",
                "Program.cs(1,1): error CS1002: ; expected\n",
            ))
            .unwrap();
        insta::assert_snapshot!(terminal.transcript(), @r###"
        partial
        --- error ---
        Program.cs(1,1): error CS1002: ; expected
        "###);
    }

    #[test]
    fn test_sandbox_failure_is_one_system_error_line() {
        let mut terminal = Terminal::new();
        terminal.begin_run(profile(), SPHERE).unwrap();
        terminal.submit_line("5").unwrap();
        terminal
            .fail("sandbox unreachable: connection refused\ncaused by: os error 111")
            .unwrap();
        assert_eq!(
            terminal.transcript(),
            "Enter radius: 5\n[system error] sandbox unreachable: connection refused\n"
        );
        assert_eq!(terminal.state(), TerminalState::Idle);

        // Still usable afterwards.
        assert!(terminal.begin_run(profile(), SPHERE).is_ok());
    }

    #[test]
    fn test_cannot_start_while_executing() {
        let mut terminal = Terminal::new();
        terminal
            .begin_run(profile(), r#"Console.WriteLine(1);"#)
            .unwrap();
        let err = terminal.begin_run(profile(), SPHERE).unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_restart_while_awaiting_input_clears_transcript() {
        let mut terminal = Terminal::new();
        terminal.begin_run(profile(), SPHERE).unwrap();
        terminal.edit_transcript("Enter radius: 9").unwrap();
        terminal.begin_run(profile(), SPHERE).unwrap();
        assert_eq!(terminal.transcript(), "Enter radius: ");
        assert!(terminal.inputs().is_empty());
    }

    #[test]
    fn test_complete_requires_executing() {
        let mut terminal = Terminal::new();
        assert!(terminal.complete(&ExecutionOutput::default()).is_err());
        assert!(terminal.fail("x").is_err());
        assert!(terminal.submit_input().is_err());
    }
}

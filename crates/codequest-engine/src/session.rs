//! The learner session.
//!
//! A [`Session`] is the single writer for one learner's attempt state: the
//! active challenge, the editable source buffer, the terminal transcript,
//! diagnostics, and the local progression mirror. It is created and owned
//! by the top-level controller (the CLI or the HTTP server) and handed to
//! whoever needs it.
//!
//! Every sandbox call races the session's [`CancelToken`]; once the session
//! is closed, late results are dropped and every operation returns
//! [`EngineError::SessionClosed`].

use std::collections::BTreeMap;
use std::sync::Arc;

use codequest_sandbox::{ExecutionRequest, Sandbox};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::catalog::{Catalog, Challenge, ChallengeInfo};
use crate::diagnostics::{parse_compiler_diagnostics, Diagnostic, DiagnosticSet, EditorMarker};
use crate::error::{EngineError, FailureClass, Result};
use crate::language::{Language, LanguageProfile};
use crate::lint::{LintResult, Linter};
use crate::progression::{Economy, Profile, Progression, ProgressionDelta, ProgressionPolicy};
use crate::prompt::Prompt;
use crate::sync::{ProfileChange, ProfileSync, SyncStatus};
use crate::terminal::{ExecutionPlan, RunStep, Terminal, TerminalState};
use crate::verify::{GradingPolicy, VerificationReport, Verifier};
use crate::websocket::{EventBroadcaster, SessionEvent};

/// Tunables for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionSettings {
    /// Source language.
    pub language: Language,
    /// Star thresholds.
    pub grading: GradingPolicy,
    /// Rewards and level curve.
    pub progression: ProgressionPolicy,
}

/// Result of a run step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    /// Terminal state after the step.
    pub state: TerminalState,
    /// Prompt being shown, while awaiting input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Prompt>,
    /// Full transcript.
    pub transcript: String,
    /// Failure category, if the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    /// Merged diagnostics.
    pub diagnostics: Vec<Diagnostic>,
}

/// Result of submitting a solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    /// Verification details.
    pub report: VerificationReport,
    /// The challenge had been completed before this submission.
    pub already_completed: bool,
    /// Economy changes, on a first-time pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ProgressionDelta>,
    /// Set when the change could not be logged for sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// Index of the active challenge.
    pub challenge_index: usize,
    /// The active challenge.
    pub challenge: ChallengeInfo,
    /// Source buffer.
    pub source: String,
    /// Terminal transcript.
    pub transcript: String,
    /// Terminal state.
    pub state: TerminalState,
    /// History snapshot, while awaiting input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Merged diagnostics.
    pub diagnostics: Vec<Diagnostic>,
    /// Editor markers for the merged diagnostics.
    pub markers: Vec<EditorMarker>,
    /// Completed challenge ids.
    pub completed: Vec<String>,
    /// Stars by challenge id.
    pub stars: BTreeMap<String, u8>,
    /// Economy counters.
    pub economy: Economy,
    /// Profile sync status, when persistence is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncStatus>,
    /// Whether the session has been closed.
    pub closed: bool,
}

/// One learner's challenge session.
pub struct Session {
    catalog: Arc<Catalog>,
    sandbox: Arc<dyn Sandbox>,
    language: &'static LanguageProfile,
    linter: Linter,
    grading: GradingPolicy,
    challenge_index: usize,
    source: String,
    terminal: Terminal,
    diagnostics: DiagnosticSet,
    progression: Progression,
    sync: Option<ProfileSync>,
    events: Option<EventBroadcaster>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("challenge_index", &self.challenge_index)
            .field("sandbox", &self.sandbox.name())
            .field("state", &self.terminal.state())
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a session on the first challenge of `catalog`.
    pub fn new(
        catalog: Arc<Catalog>,
        sandbox: Arc<dyn Sandbox>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let language = settings.language.profile();
        let mut session = Self {
            catalog,
            sandbox,
            language,
            linter: Linter::new(language),
            grading: settings.grading,
            challenge_index: 0,
            source: String::new(),
            terminal: Terminal::new(),
            diagnostics: DiagnosticSet::new(),
            progression: Progression::new(settings.progression),
            sync: None,
            events: None,
            cancel: CancelToken::new(),
        };
        session.select_challenge(0)?;
        Ok(session)
    }

    /// Mirrors a stored profile and logs future changes through `sync`.
    #[must_use]
    pub fn with_profile(
        mut self,
        policy: ProgressionPolicy,
        profile: &Profile,
        sync: ProfileSync,
    ) -> Self {
        self.progression = Progression::from_profile(policy, profile);
        self.sync = Some(sync);
        self
    }

    /// Publishes session events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    /// A clone of the session-scoped cancel token.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The language profile in use.
    #[must_use]
    pub const fn language(&self) -> &'static LanguageProfile {
        self.language
    }

    /// The challenge catalog.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The linter in use.
    #[must_use]
    pub const fn linter(&self) -> Linter {
        self.linter
    }

    /// The active challenge.
    pub fn challenge(&self) -> Result<&Challenge> {
        self.catalog.get(self.challenge_index)
    }

    /// The source buffer.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The terminal.
    #[must_use]
    pub const fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    /// Diagnostics.
    #[must_use]
    pub const fn diagnostics(&self) -> &DiagnosticSet {
        &self.diagnostics
    }

    /// Progression mirror.
    #[must_use]
    pub const fn progression(&self) -> &Progression {
        &self.progression
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    fn emit_transcript(&self) {
        self.emit(SessionEvent::transcript(
            self.terminal.state(),
            self.terminal.transcript().to_string(),
        ));
    }

    fn emit_diagnostics(&self) {
        self.emit(SessionEvent::diagnostics(
            self.diagnostics.merged().to_vec(),
            self.diagnostics.markers(&self.source),
        ));
    }

    // ------------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------------

    /// Makes the challenge at `index` active.
    ///
    /// The buffer is reset to the normalized starter text, diagnostics are
    /// cleared and the terminal returns to idle.
    pub fn select_challenge(&mut self, index: usize) -> Result<()> {
        self.ensure_open()?;
        let challenge = self.catalog.get(index)?;
        self.source = challenge.starter_text();
        info!(challenge = %challenge.id, index, "Challenge selected");
        self.challenge_index = index;
        self.diagnostics.clear();
        self.terminal.reset();
        self.emit_transcript();
        self.emit_diagnostics();
        Ok(())
    }

    /// Makes the challenge with `id` active.
    pub fn select_challenge_by_id(&mut self, id: &str) -> Result<()> {
        let (index, _) = self.catalog.find(id)?;
        self.select_challenge(index)
    }

    /// Replaces the source buffer.
    pub fn set_source(&mut self, source: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.source = source.into();
        Ok(())
    }

    /// Lints the buffer immediately.
    pub fn lint_now(&mut self) -> Result<&[Diagnostic]> {
        self.ensure_open()?;
        self.diagnostics.set_lint(self.linter.lint(&self.source));
        self.emit_diagnostics();
        Ok(self.diagnostics.merged())
    }

    /// Applies a debounced lint result if it is for the current buffer.
    ///
    /// Returns `false` for stale results and closed sessions.
    pub fn apply_lint(&mut self, result: LintResult) -> bool {
        if self.is_closed() || result.source != self.source {
            debug!("Discarding stale lint result");
            return false;
        }
        self.diagnostics.set_lint(result.diagnostics);
        self.emit_diagnostics();
        true
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Runs the buffer.
    ///
    /// Lint errors block the run. Programs that read input stop in
    /// [`TerminalState::AwaitingInput`]; the others are executed right away.
    #[instrument(skip(self), fields(challenge = self.challenge_index, source_len = self.source.len()))]
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.ensure_open()?;

        self.diagnostics.set_lint(self.linter.lint(&self.source));
        self.diagnostics.set_compile(Vec::new());
        if self.diagnostics.has_lint_errors() {
            debug!(failure = %FailureClass::Syntax, "Run blocked by lint errors");
            self.emit_diagnostics();
            return Ok(self.outcome(None, Some(FailureClass::Syntax)));
        }
        self.emit_diagnostics();

        let step = self.terminal.begin_run(self.language, &self.source)?;
        self.drive(step).await
    }

    /// Replaces the transcript while awaiting input.
    ///
    /// Fails with [`EngineError::HistoryRewrite`] if the edit does not keep
    /// the history snapshot as a prefix.
    pub fn edit_transcript(&mut self, candidate: &str) -> Result<()> {
        self.ensure_open()?;
        self.terminal.edit_transcript(candidate)
    }

    /// Submits the text typed after the snapshot as one input line.
    pub async fn submit_input(&mut self) -> Result<RunOutcome> {
        self.ensure_open()?;
        let step = self.terminal.submit_input()?;
        self.drive(step).await
    }

    /// Types `line` into the terminal and submits it.
    pub async fn submit_line(&mut self, line: &str) -> Result<RunOutcome> {
        self.ensure_open()?;
        let step = self.terminal.submit_line(line)?;
        self.drive(step).await
    }

    async fn drive(&mut self, step: RunStep) -> Result<RunOutcome> {
        match step {
            RunStep::AwaitInput(prompt) => {
                self.emit_transcript();
                Ok(self.outcome(Some(prompt), None))
            }
            RunStep::Execute(plan) => self.execute(plan).await,
        }
    }

    async fn execute(&mut self, plan: ExecutionPlan) -> Result<RunOutcome> {
        self.emit_transcript();
        let request = ExecutionRequest::new(self.language.sandbox_language, plan.source)
            .with_stdin(plan.stdin);
        let sandbox = Arc::clone(&self.sandbox);
        let cancel = self.cancel.clone();

        let result = tokio::select! {
            () = cancel.cancelled() => {
                debug!("Session closed during sandbox call; dropping result");
                return Err(EngineError::SessionClosed);
            }
            result = sandbox.execute(&request) => result,
        };

        let failure = match result {
            Ok(output) => {
                self.terminal.complete(&output)?;
                let compile = parse_compiler_diagnostics(self.language, &output.stderr);
                let failure = if !output.has_stderr() {
                    None
                } else if compile.is_empty() {
                    Some(FailureClass::Runtime)
                } else {
                    Some(FailureClass::Compile)
                };
                self.diagnostics.set_compile(compile);
                failure
            }
            Err(e) => {
                warn!(sandbox = sandbox.name(), error = %e, "Sandbox call failed");
                self.terminal.fail(&e.to_string())?;
                self.emit(SessionEvent::error(e.to_string(), Some(FailureClass::Network)));
                Some(FailureClass::Network)
            }
        };

        self.emit_transcript();
        self.emit_diagnostics();
        Ok(self.outcome(None, failure))
    }

    fn outcome(&self, prompt: Option<Prompt>, failure: Option<FailureClass>) -> RunOutcome {
        RunOutcome {
            state: self.terminal.state(),
            prompt,
            transcript: self.terminal.transcript().to_string(),
            failure,
            diagnostics: self.diagnostics.merged().to_vec(),
        }
    }

    // ------------------------------------------------------------------------
    // Submitting
    // ------------------------------------------------------------------------

    /// Verifies the buffer against the active challenge and applies
    /// progression on a first-time pass.
    ///
    /// A repeat pass reports success again without changing the economy.
    #[instrument(skip(self), fields(challenge = self.challenge_index, source_len = self.source.len()))]
    pub async fn submit(&mut self) -> Result<SubmitOutcome> {
        self.ensure_open()?;
        if self.terminal.state().is_executing() {
            return Err(EngineError::invalid_transition(
                self.terminal.state(),
                TerminalState::Executing,
            ));
        }

        let catalog = Arc::clone(&self.catalog);
        let challenge = catalog.get(self.challenge_index)?;
        let cancel = self.cancel.clone();
        let verifier = Verifier::new(self.sandbox.as_ref(), self.language, self.grading);

        let report = tokio::select! {
            () = cancel.cancelled() => {
                debug!("Session closed during verification; dropping result");
                return Err(EngineError::SessionClosed);
            }
            report = verifier.verify(challenge, &self.source) => report,
        };

        if !report.diagnostics.is_empty() {
            self.diagnostics.set_compile(report.diagnostics.clone());
            self.emit_diagnostics();
        }

        let mut outcome = SubmitOutcome {
            report,
            already_completed: self.progression.is_completed(&challenge.id),
            delta: None,
            persistence_error: None,
        };

        if outcome.report.passed && !outcome.already_completed {
            let stars = outcome.report.stars.unwrap_or(1);
            if let Some(update) = self.progression.record_pass(
                challenge,
                stars,
                &self.source,
                outcome.report.execution_time_ms,
            ) {
                if let Some(sync) = &self.sync {
                    let changes = vec![
                        ProfileChange::Patch(update.patch),
                        ProfileChange::Progress(update.progress),
                        ProfileChange::History(update.history),
                    ];
                    if let Err(e) = sync.record(changes).await {
                        warn!(
                            failure = %FailureClass::Persistence,
                            error = %e,
                            "Could not log profile change; in-memory progress kept"
                        );
                        self.emit(SessionEvent::error(
                            e.to_string(),
                            Some(FailureClass::Persistence),
                        ));
                        outcome.persistence_error = Some(e.to_string());
                    }
                }
                info!(
                    challenge = %challenge.id,
                    stars,
                    xp = update.delta.xp_gained,
                    level = update.delta.economy.level,
                    "Challenge completed"
                );
                self.emit(SessionEvent::progress(
                    update.delta.clone(),
                    self.sync.as_ref().map(ProfileSync::status),
                ));
                outcome.delta = Some(update.delta);
            }
        } else if outcome.report.passed {
            debug!(challenge = %challenge.id, "Repeat pass; no economy change");
        }

        self.emit(SessionEvent::verification(outcome.report.clone()));
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Closes the session. Pending sandbox calls are abandoned and every
    /// later operation fails with [`EngineError::SessionClosed`].
    pub fn close(&mut self) {
        if self.cancel.is_cancelled() && self.terminal.state() == TerminalState::Idle {
            return;
        }
        self.cancel.cancel();
        self.terminal.reset();
        info!("Session closed");
    }

    /// A serializable snapshot.
    pub fn view(&self) -> Result<SessionView> {
        let challenge = self.challenge()?;
        Ok(SessionView {
            challenge_index: self.challenge_index,
            challenge: challenge.info(),
            source: self.source.clone(),
            transcript: self.terminal.transcript().to_string(),
            state: self.terminal.state(),
            snapshot: self.terminal.snapshot().map(str::to_string),
            diagnostics: self.diagnostics.merged().to_vec(),
            markers: self.diagnostics.markers(&self.source),
            completed: self.progression.completed().iter().cloned().collect(),
            stars: self.progression.stars().clone(),
            economy: self.progression.economy(),
            sync: self.sync.as_ref().map(ProfileSync::status),
            closed: self.is_closed(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use codequest_sandbox::{ExecutionOutput, SandboxError};
    use tokio::sync::Mutex;

    use super::*;
    use crate::lint::LintResult;
    use crate::sync::{ChangeLog, MemoryProfileStore, RetryPolicy};
    use crate::test_support::ScriptedSandbox;

    const SPHERE: &str = r#"using System;
class Program
{
    static void Main()
    {
        Console.Write("Enter radius: ");
        double r = double.Parse(Console.ReadLine());
        double v = 4.0 / 3.0 * Math.PI * Math.Pow(r, 3);
        Console.WriteLine("Volume: " + v.ToString("F2"));
    }
}
"#;

    fn sphere_sandbox() -> ScriptedSandbox {
        ScriptedSandbox::new(|request| {
            let out = match request.stdin.as_str() {
                "5\n" => "Enter radius: Volume: 523.60\n",
                "2.5\n" => "Enter radius: Volume: 65.45\n",
                "1\n" => "Enter radius: Volume: 4.19\n",
                _ => "Enter radius: Volume: NaN\n",
            };
            Ok(ExecutionOutput::new(out, ""))
        })
    }

    fn open(sandbox: Arc<ScriptedSandbox>) -> Session {
        let mut session = Session::new(
            Arc::new(Catalog::builtin()),
            sandbox,
            SessionSettings::default(),
        )
        .unwrap();
        session.select_challenge_by_id("sphere-volume").unwrap();
        session
    }

    #[test]
    fn test_selecting_a_challenge_resets_buffer_and_diagnostics() {
        let mut session = open(Arc::new(sphere_sandbox()));
        session.set_source("class P {").unwrap();
        assert!(!session.lint_now().unwrap().is_empty());

        session.select_challenge(0).unwrap();
        let starter = session.challenge().unwrap().starter_text();
        assert_eq!(session.source(), starter);
        assert!(session.source().contains('\n'));
        assert!(!session.source().contains("\\n"));
        assert!(session.diagnostics().merged().is_empty());
        assert_eq!(session.terminal().state(), TerminalState::Idle);
    }

    #[tokio::test]
    async fn test_interactive_run_strips_prompt_echo() {
        let sandbox = Arc::new(sphere_sandbox());
        let mut session = open(sandbox.clone());
        session.set_source(SPHERE).unwrap();

        let outcome = session.run().await.unwrap();
        assert_eq!(outcome.state, TerminalState::AwaitingInput);
        assert_eq!(outcome.prompt, Some(Prompt::explicit("Enter radius: ")));
        assert_eq!(sandbox.calls(), 0);

        let outcome = session.submit_line("5").await.unwrap();
        assert_eq!(outcome.state, TerminalState::Idle);
        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.transcript, "Enter radius: 5\nVolume: 523.60\n");
        assert_eq!(sandbox.requests()[0].stdin, "5\n");
    }

    #[tokio::test]
    async fn test_lint_errors_block_the_sandbox() {
        let sandbox = Arc::new(sphere_sandbox());
        let mut session = open(sandbox.clone());
        session
            .set_source("class Program {\n static void Main() {\n Console.WriteLine(1);\n}\n")
            .unwrap();

        let outcome = session.run().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureClass::Syntax));
        assert_eq!(outcome.state, TerminalState::Idle);
        assert_eq!(sandbox.calls(), 0);
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_compile_errors_are_merged_with_lint_warnings() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_| {
            Ok(ExecutionOutput::new(
                "",
                "Program.cs(3,17): error CS0103: The name 'y' does not exist in the current context\n",
            ))
        }));
        let mut session = open(sandbox);
        session
            .set_source("int x = 1\nclass P {\n  int z = y;\n  void M() { Console.WriteLine(z); }\n}\n")
            .unwrap();

        let outcome = session.run().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureClass::Compile));
        assert_eq!(outcome.diagnostics.len(), 2);
        assert_eq!(outcome.diagnostics[0].line, 1);
        assert_eq!(outcome.diagnostics[1].code.as_deref(), Some("CS0103"));
        assert!(outcome.transcript.contains("--- error ---"));

        let markers = session.view().unwrap().markers;
        assert_eq!(markers.len(), 2);
    }

    #[tokio::test]
    async fn test_runtime_error_is_raw_transcript_text() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_| {
            Ok(ExecutionOutput::new(
                "",
                "Unhandled Exception:\nSystem.FormatException: Input string was not in a correct format.",
            ))
        }));
        let mut session = open(sandbox);
        session.set_source(SPHERE).unwrap();
        session.run().await.unwrap();
        let outcome = session.submit_line("abc").await.unwrap();
        assert_eq!(outcome.failure, Some(FailureClass::Runtime));
        assert!(outcome.diagnostics.is_empty());
        assert!(outcome.transcript.contains("System.FormatException"));
    }

    #[tokio::test]
    async fn test_network_failure_leaves_session_usable() {
        let sandbox = Arc::new(ScriptedSandbox::new(|_| {
            Err(SandboxError::Network("connection refused".into()))
        }));
        let mut session = open(sandbox);
        session.set_source("Console.WriteLine(1 + 1);").unwrap();

        let outcome = session.run().await.unwrap();
        assert_eq!(outcome.failure, Some(FailureClass::Network));
        assert_eq!(outcome.state, TerminalState::Idle);
        assert_eq!(
            outcome.transcript,
            "[system error] sandbox unreachable: connection refused\n"
        );
        assert!(session.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_history_rewrite_is_rejected() {
        let mut session = open(Arc::new(sphere_sandbox()));
        session.set_source(SPHERE).unwrap();
        session.run().await.unwrap();

        assert!(matches!(
            session.edit_transcript("Enter diameter: 5"),
            Err(EngineError::HistoryRewrite)
        ));
        session.edit_transcript("Enter radius: 5").unwrap();
        let outcome = session.submit_input().await.unwrap();
        assert!(outcome.transcript.ends_with("Volume: 523.60\n"));
    }

    #[tokio::test]
    async fn test_repeat_pass_leaves_economy_unchanged() {
        let mut session = open(Arc::new(sphere_sandbox()));
        session.set_source(SPHERE).unwrap();

        let first = session.submit().await.unwrap();
        assert!(first.report.passed, "{}", first.report.message);
        assert!(!first.already_completed);
        let delta = first.delta.unwrap();
        assert_eq!(delta.xp_gained, 75);

        let before = session.view().unwrap();
        let second = session.submit().await.unwrap();
        assert!(second.report.passed);
        assert!(second.already_completed);
        assert!(second.delta.is_none());

        let after = session.view().unwrap();
        assert_eq!(after.completed, before.completed);
        assert_eq!(after.stars, before.stars);
        assert_eq!(after.economy, before.economy);
    }

    #[tokio::test]
    async fn test_first_pass_is_logged_for_sync() {
        let store = Arc::new(MemoryProfileStore::new());
        let app_cancel = CancelToken::new();
        let sync = ProfileSync::spawn(
            store.clone(),
            ChangeLog::in_memory(),
            RetryPolicy::default(),
            app_cancel.clone(),
        );
        let mut session = open(Arc::new(sphere_sandbox())).with_profile(
            ProgressionPolicy::default(),
            &Profile::default(),
            sync.clone(),
        );
        session.set_source(SPHERE).unwrap();

        let outcome = session.submit().await.unwrap();
        assert!(outcome.persistence_error.is_none());
        tokio::time::timeout(Duration::from_secs(2), sync.settled())
            .await
            .unwrap();

        let profile = store.snapshot().await;
        assert_eq!(profile.xp, 75);
        assert_eq!(profile.completed_challenge_ids, vec!["sphere-volume"]);
        assert_eq!(profile.progress["sphere-volume"].submitted_source, SPHERE);
        assert_eq!(profile.history.len(), 1);
        app_cancel.cancel();
    }

    #[tokio::test]
    async fn test_unwritable_log_keeps_optimistic_progress() {
        let dir = std::env::temp_dir().join(format!(
            "codequest-session-log-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path = dir.join("changes.jsonl");
        let log = ChangeLog::open(&path).await.unwrap();
        // The log path is a directory, so appending fails.
        std::fs::create_dir_all(&path).unwrap();

        let store = Arc::new(MemoryProfileStore::new());
        let app_cancel = CancelToken::new();
        let sync = ProfileSync::spawn(store.clone(), log, RetryPolicy::default(), app_cancel.clone());
        let events = EventBroadcaster::new(32);
        let mut rx = events.subscribe();
        let mut session = open(Arc::new(sphere_sandbox()))
            .with_events(events)
            .with_profile(ProgressionPolicy::default(), &Profile::default(), sync.clone());
        session.set_source(SPHERE).unwrap();

        let first = session.submit().await.unwrap();
        assert!(first.report.passed, "{}", first.report.message);
        assert!(first.persistence_error.is_some());
        assert_eq!(first.delta.as_ref().unwrap().xp_gained, 75);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event_name());
        }
        assert!(names.contains(&"error"));
        assert!(names.contains(&"progress"));

        let view = session.view().unwrap();
        assert_eq!(view.completed, vec!["sphere-volume".to_string()]);
        assert_eq!(view.economy.xp, 75);
        assert!(view.economy.level >= 1);

        let second = session.submit().await.unwrap();
        assert!(second.already_completed);
        assert!(second.delta.is_none());
        assert_eq!(session.view().unwrap().economy, view.economy);

        assert_eq!(sync.pending().await, 0);
        assert_eq!(store.writes(), 0);
        app_cancel.cancel();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let mut session = open(Arc::new(sphere_sandbox()));
        session.close();
        assert!(session.is_closed());
        assert!(matches!(session.run().await, Err(EngineError::SessionClosed)));
        assert!(matches!(session.submit().await, Err(EngineError::SessionClosed)));
        assert!(matches!(
            session.select_challenge(0),
            Err(EngineError::SessionClosed)
        ));
        assert!(session.view().unwrap().closed);
    }

    #[tokio::test]
    async fn test_closing_drops_in_flight_result() {
        let sandbox = Arc::new(
            ScriptedSandbox::stdout("late\n").with_delay(Duration::from_secs(5)),
        );
        let mut session = open(sandbox);
        session.set_source("Console.WriteLine(1 + 1);").unwrap();
        let cancel = session.cancel_token();
        let session = Arc::new(Mutex::new(session));

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.lock().await.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(EngineError::SessionClosed)));
        assert!(!session.lock().await.terminal().transcript().contains("late"));
    }

    #[tokio::test]
    async fn test_stale_lint_results_are_discarded() {
        let mut session = open(Arc::new(sphere_sandbox()));
        session.set_source("class A {").unwrap();
        let linter = session.linter();

        let stale = LintResult {
            source: "class B {".into(),
            diagnostics: linter.lint("class B {"),
        };
        assert!(!session.apply_lint(stale));

        let fresh = LintResult {
            source: "class A {".into(),
            diagnostics: linter.lint("class A {"),
        };
        assert!(session.apply_lint(fresh));
        assert_eq!(session.diagnostics().merged().len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let events = EventBroadcaster::new(32);
        let mut rx = events.subscribe();
        let mut session = open(Arc::new(sphere_sandbox())).with_events(events);
        session.set_source("Console.WriteLine(1 + 1);").unwrap();
        session.run().await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event_name());
        }
        assert!(names.contains(&"transcript"));
        assert!(names.contains(&"diagnostics"));
    }
}

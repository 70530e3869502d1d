//! CodeQuest challenge engine
//!
//! Runs learner programs in a sandbox through an emulated interactive
//! terminal, lints and annotates source, verifies submissions against
//! reference oracles, and keeps the learner's progression in sync with the
//! profile store. The HTTP API and WebSocket events expose one session to a
//! browser editor.

pub mod api;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod language;
pub mod lint;
pub mod oracle;
pub mod progression;
pub mod prompt;
pub mod session;
pub mod sync;
pub mod terminal;
pub mod verify;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use api::{
    create_router, AppState, ErrorResponse, InputRequest, SelectChallengeRequest, SourceRequest,
    TranscriptRequest,
};
pub use cancel::CancelToken;
pub use catalog::{normalize_escaped_newlines, Catalog, Challenge, ChallengeInfo};
pub use config::{
    Config, GradingConfig, LintConfig, ProfileConfig, ProgressionConfig, RetryConfig,
    SandboxBackend, SandboxConfig,
};
pub use diagnostics::{
    parse_compiler_diagnostics, Diagnostic, DiagnosticSet, DiagnosticSource, EditorMarker,
    Severity,
};
pub use error::{EngineError, FailureClass, Result};
pub use language::{mask_source, Language, LanguageProfile, MaskMode};
pub use lint::{has_blocking, LintDebouncer, LintResult, Linter, DEFAULT_DEBOUNCE};
pub use oracle::{
    builtin_oracle, expected_output, FnOracle, InputLines, Oracle, OracleError, OutputSink,
    TableOracle, BUILTIN_ORACLES,
};
pub use progression::{
    Economy, HistoryRecord, HistoryResults, Profile, ProfilePatch, ProgressRecord,
    ProgressStatus, Progression, ProgressionDelta, ProgressionPolicy, ProgressionUpdate,
};
pub use prompt::{scan_prompt, Prompt, FALLBACK_PROMPT};
pub use session::{RunOutcome, Session, SessionSettings, SessionView, SubmitOutcome};
pub use sync::{
    ChangeLog, FileProfileStore, LogEntry, MemoryProfileStore, ProfileChange, ProfileStore,
    ProfileSync, RetryPolicy, SyncStatus,
};
pub use terminal::{
    strip_prompt_echo, ExecutionPlan, RunStep, Terminal, TerminalState, ERROR_BLOCK_HEADER,
    SYSTEM_ERROR_PREFIX,
};
pub use verify::{
    normalize_whitespace, output_matches, structural_check, FailureKind, GradingPolicy,
    StructuralFailure, TestResult, VerificationFailure, VerificationReport, Verifier,
};
pub use websocket::{EventBroadcaster, SessionEvent, WsState};

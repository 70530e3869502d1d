//! Error types for the CodeQuest engine.
//!
//! This module defines the error hierarchy for engine operations: loading
//! configuration and challenge catalogs, driving the terminal state machine,
//! talking to the sandbox, and persisting learner progress.
//!
//! Learner-facing failures (syntax errors, compile errors, failed
//! verification) are *not* errors here; they are ordinary outcomes carried by
//! [`crate::RunOutcome`] and [`crate::VerificationReport`]. [`FailureClass`]
//! names them for logs and events.

use std::path::PathBuf;

use codequest_sandbox::SandboxError;
use serde::{Deserialize, Serialize};

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while running the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your codequest.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Catalog Errors
    // ========================================================================
    /// A challenge catalog file could not be parsed.
    #[error("Invalid challenge catalog '{path}': {message}\n\nSuggestion: Check the catalog against the documented format")]
    CatalogParseError {
        /// Path to the catalog file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// No challenge with the given id exists in the catalog.
    #[error("Unknown challenge: '{id}'\n\nSuggestion: Run 'codequest challenges' to list available ids")]
    UnknownChallenge {
        /// The id that was requested.
        id: String,
    },

    /// A challenge index outside the catalog was requested.
    #[error("Challenge index {index} is out of range (catalog has {len} challenges)")]
    ChallengeIndexOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of challenges in the catalog.
        len: usize,
    },

    /// A catalog entry names a built-in oracle that does not exist.
    #[error("Unknown oracle: '{name}'\n\nSuggestion: Use one of the built-in oracle names or a table oracle")]
    UnknownOracle {
        /// The oracle name.
        name: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Invalid terminal state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// A transcript edit would have changed text before the history snapshot.
    #[error("Transcript edit rejected: only text after the prompt can be changed")]
    HistoryRewrite,

    /// The session was closed; late results are discarded.
    #[error("Session is closed")]
    SessionClosed,

    // ========================================================================
    // Collaborator Errors
    // ========================================================================
    /// The sandbox call failed.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Writing to the profile store failed.
    #[error("Failed to persist profile change: {message}")]
    Persistence {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `CatalogParseError`.
    #[must_use]
    pub fn catalog_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CatalogParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `UnknownChallenge` error.
    #[must_use]
    pub fn unknown_challenge(id: impl Into<String>) -> Self {
        Self::UnknownChallenge { id: id.into() }
    }

    /// Creates a new `UnknownOracle` error.
    #[must_use]
    pub fn unknown_oracle(name: impl Into<String>) -> Self {
        Self::UnknownOracle { name: name.into() }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates a new `Persistence` error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is transient and may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Sandbox(e) => e.is_network(),
            Self::Persistence { .. } | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if this error prevents the engine from starting.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError { .. }
                | Self::ConfigValidationError { .. }
                | Self::CatalogParseError { .. }
                | Self::UnknownOracle { .. }
        )
    }
}

/// Learner-visible failure categories.
///
/// None of these is fatal: every path returns the session to an editable,
/// idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Local linter found an error; the sandbox was not called.
    Syntax,
    /// The compiler reported location-tagged errors.
    Compile,
    /// The program wrote to standard error without compiler diagnostics.
    Runtime,
    /// The sandbox could not be reached or answered garbage.
    Network,
    /// Structural or differential verification failed.
    Verification,
    /// Writing to the profile store failed.
    Persistence,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Compile => write!(f, "compile"),
            Self::Runtime => write!(f, "runtime"),
            Self::Network => write!(f, "network"),
            Self::Verification => write!(f, "verification"),
            Self::Persistence => write!(f, "persistence"),
        }
    }
}

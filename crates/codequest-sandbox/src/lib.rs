//! CodeQuest Sandbox
//!
//! Clients for the code-execution sandbox that compiles and runs learner
//! programs.
//!
//! The sandbox is an opaque request/response service: a program and its
//! standard input go in, captured standard output and standard error come
//! out. Two backends are provided:
//!
//! - [`HttpSandbox`] talks to a Piston-style execution API over HTTP.
//! - [`DockerSandbox`] runs each request in a throw-away Docker container.
//!
//! Both implement the [`Sandbox`] trait, which is what the engine depends on.

pub mod docker;
pub mod http;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::{DockerSandbox, DockerSandboxOptions};
pub use http::{HttpSandbox, HttpSandboxOptions};

/// Errors that can occur while talking to a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox could not be reached (connection refused, DNS, reset).
    #[error("sandbox unreachable: {0}")]
    Network(String),

    /// The sandbox did not answer within the configured timeout.
    #[error("sandbox timed out after {timeout_secs}s")]
    Timeout {
        /// The timeout that elapsed, in seconds.
        timeout_secs: u64,
    },

    /// The sandbox answered with a non-success HTTP status.
    #[error("sandbox returned HTTP {status}: {body}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// The (possibly truncated) response body.
        body: String,
    },

    /// The sandbox answered, but the response could not be understood.
    #[error("malformed sandbox response: {0}")]
    MalformedResponse(String),

    /// Docker API error.
    #[error("docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    /// The requested language is not supported by this backend.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

impl SandboxError {
    /// Returns `true` if the failure is in reaching the service (connection,
    /// timeout, 5xx) and a later retry may succeed.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout { .. } | Self::Http { status: 500..=599, .. }
        )
    }
}

/// A request to compile and run a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Language identifier understood by the sandbox (e.g. `csharp`).
    pub language: String,
    /// Full program source text.
    pub source: String,
    /// Text fed to the program's standard input.
    pub stdin: String,
}

impl ExecutionRequest {
    /// Creates a request with empty standard input.
    #[must_use]
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: String::new(),
        }
    }

    /// Sets the standard input text.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }
}

/// Captured result of a sandbox execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, including compiler diagnostics.
    pub stderr: String,
    /// Process exit code, when the backend reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Wall-clock time spent in the sandbox call.
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionOutput {
    /// Creates an output with the given streams.
    #[must_use]
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Returns `true` if the program wrote anything to standard error.
    #[must_use]
    pub fn has_stderr(&self) -> bool {
        !self.stderr.trim().is_empty()
    }
}

/// A code-execution service.
///
/// Implementations must be cheap to share behind an `Arc`; the engine holds
/// one sandbox per process and issues at most one call per session at a time.
pub trait Sandbox: Send + Sync {
    /// Compiles and runs `request.source` with `request.stdin`.
    fn execute<'a>(
        &'a self,
        request: &'a ExecutionRequest,
    ) -> BoxFuture<'a, Result<ExecutionOutput, SandboxError>>;

    /// Short backend name used in logs.
    fn name(&self) -> &str;
}

/// Truncates a response body for inclusion in an error message.
pub(crate) fn truncate_body(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

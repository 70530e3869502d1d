//! HTTP sandbox backend.
//!
//! Speaks the Piston v2 execution API: `POST {base_url}/execute` with the
//! program as a single file and the standard input as a string. Compilation
//! and execution are reported as separate stages; a failed compile stage is
//! surfaced as standard error so the diagnostic parser can pick it up.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{truncate_body, ExecutionOutput, ExecutionRequest, Sandbox, SandboxError};

/// Maximum number of response-body characters kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Options for [`HttpSandbox`].
#[derive(Debug, Clone)]
pub struct HttpSandboxOptions {
    /// Base URL of the execution API, without the trailing `/execute`.
    pub base_url: String,
    /// Language version requested from the sandbox (`*` for latest).
    pub language_version: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl HttpSandboxOptions {
    /// Creates options for the given base URL with a `*` version and 10s timeout.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            language_version: "*".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Sets the requested language version.
    #[must_use]
    pub fn with_language_version(mut self, version: impl Into<String>) -> Self {
        self.language_version = version.into();
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Sandbox backed by a remote Piston-style HTTP service.
#[derive(Debug, Clone)]
pub struct HttpSandbox {
    client: reqwest::Client,
    options: HttpSandboxOptions,
}

#[derive(Debug, Serialize)]
struct PistonFile<'a> {
    name: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct PistonRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<PistonFile<'a>>,
    stdin: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct PistonStage {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PistonResponse {
    #[serde(default)]
    compile: Option<PistonStage>,
    run: Option<PistonStage>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpSandbox {
    /// Creates a new HTTP sandbox client.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Network`] if the HTTP client cannot be built
    /// (e.g. TLS backend initialisation failure).
    pub fn new(options: HttpSandboxOptions) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| SandboxError::Network(e.to_string()))?;
        Ok(Self { client, options })
    }

    /// Returns the configured options.
    #[must_use]
    pub const fn options(&self) -> &HttpSandboxOptions {
        &self.options
    }

    fn execute_url(&self) -> String {
        format!("{}/execute", self.options.base_url.trim_end_matches('/'))
    }

    #[instrument(skip(self, request), fields(language = %request.language, source_len = request.source.len(), stdin_len = request.stdin.len()))]
    async fn execute_inner(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutput, SandboxError> {
        let body = build_request(request, &self.options.language_version);
        let started = Instant::now();

        let response = self
            .client
            .post(self.execute_url())
            .header(USER_AGENT, "codequest/0.1")
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.classify_transport_error(&e))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Sandbox returned an error status");
            return Err(SandboxError::Http {
                status: status.as_u16(),
                body: truncate_body(&text, MAX_ERROR_BODY),
            });
        }

        let parsed: PistonResponse = serde_json::from_str(&text)
            .map_err(|e| SandboxError::MalformedResponse(e.to_string()))?;
        let mut output = map_response(parsed)?;
        output.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            duration_ms = output.duration_ms,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "Sandbox execution finished"
        );
        Ok(output)
    }

    fn classify_transport_error(&self, error: &reqwest::Error) -> SandboxError {
        if error.is_timeout() {
            SandboxError::Timeout {
                timeout_secs: self.options.timeout.as_secs(),
            }
        } else if error.is_decode() {
            SandboxError::MalformedResponse(error.to_string())
        } else {
            SandboxError::Network(error.to_string())
        }
    }
}

impl Sandbox for HttpSandbox {
    fn execute<'a>(
        &'a self,
        request: &'a ExecutionRequest,
    ) -> BoxFuture<'a, Result<ExecutionOutput, SandboxError>> {
        Box::pin(self.execute_inner(request))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// File name used for the submitted program.
fn source_file_name(language: &str) -> &'static str {
    match language {
        "csharp" | "cs" | "c#" => "Program.cs",
        "python" | "py" => "main.py",
        "java" => "Main.java",
        _ => "main",
    }
}

fn build_request<'a>(request: &'a ExecutionRequest, version: &'a str) -> PistonRequest<'a> {
    PistonRequest {
        language: &request.language,
        version,
        files: vec![PistonFile {
            name: source_file_name(&request.language),
            content: &request.source,
        }],
        stdin: &request.stdin,
    }
}

/// Converts a Piston response into an [`ExecutionOutput`].
///
/// A compile stage with a non-zero exit code short-circuits: the compiler's
/// combined output becomes standard error and the run stage is ignored.
fn map_response(response: PistonResponse) -> Result<ExecutionOutput, SandboxError> {
    if let Some(compile) = response.compile {
        if compile.code.is_some_and(|code| code != 0) {
            debug!(code = ?compile.code, "Compile stage failed");
            let mut stderr = compile.stdout;
            if !compile.stderr.is_empty() {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&compile.stderr);
            }
            return Ok(ExecutionOutput {
                stdout: String::new(),
                stderr,
                exit_code: compile.code,
                duration_ms: 0,
            });
        }
    }

    let run = response.run.ok_or_else(|| {
        SandboxError::MalformedResponse(
            response
                .message
                .unwrap_or_else(|| "response has no run stage".to_string()),
        )
    })?;

    Ok(ExecutionOutput {
        stdout: run.stdout,
        stderr: run.stderr,
        exit_code: run.code,
        duration_ms: 0,
    })
}

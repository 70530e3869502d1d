//! Docker sandbox backend.
//!
//! Each execution runs in a fresh, network-less container that is removed
//! afterwards. The program source and standard input travel as environment
//! variables so no host paths need to be mounted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::{ExecutionOutput, ExecutionRequest, Sandbox, SandboxError};

/// Environment variable carrying the program source into the container.
const SOURCE_ENV: &str = "CQ_SOURCE";

/// Environment variable carrying standard input into the container.
const STDIN_ENV: &str = "CQ_STDIN";

/// Monotonic counter for unique container names within this process.
static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Options for [`DockerSandbox`].
#[derive(Debug, Clone)]
pub struct DockerSandboxOptions {
    /// Image providing the compiler and runtime (e.g. `mono:6.12`).
    pub image: String,
    /// Upper bound on a single execution, including compilation.
    pub timeout: Duration,
    /// Memory limit for the container in megabytes.
    pub memory_limit_mb: u64,
}

impl DockerSandboxOptions {
    /// Creates options for the given image with a 10s timeout and 256MB limit.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            timeout: Duration::from_secs(10),
            memory_limit_mb: 256,
        }
    }

    /// Sets the execution timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the container memory limit.
    #[must_use]
    pub const fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }
}

/// Sandbox that runs every request in a throw-away Docker container.
///
/// # Example
///
/// ```no_run
/// use codequest_sandbox::{DockerSandbox, DockerSandboxOptions, ExecutionRequest, Sandbox};
///
/// # async fn example() -> Result<(), codequest_sandbox::SandboxError> {
/// let sandbox = DockerSandbox::connect(DockerSandboxOptions::new("mono:6.12"))?;
/// sandbox.health_check().await?;
///
/// let request = ExecutionRequest::new("csharp", "class P { static void Main() {} }");
/// let output = sandbox.execute(&request).await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    docker: Docker,
    options: DockerSandboxOptions,
}

impl DockerSandbox {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::DockerApi`] if the daemon socket cannot be opened.
    pub fn connect(options: DockerSandboxOptions) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        debug!("Connected to Docker daemon");
        Ok(Self { docker, options })
    }

    /// Checks that the Docker daemon is reachable.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        debug!("Docker daemon health check passed");
        Ok(())
    }

    #[instrument(skip(self, request), fields(language = %request.language, image = %self.options.image))]
    async fn execute_inner(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutput, SandboxError> {
        let script = run_script(&request.language)?;
        let name = container_name();
        let started = Instant::now();

        let config = BollardConfig {
            image: Some(self.options.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            env: Some(vec![
                format!("{SOURCE_ENV}={}", request.source),
                format!("{STDIN_ENV}={}", request.stdin),
            ]),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory_bytes(self.options.memory_limit_mb)),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        for warning in &created.warnings {
            warn!(container_id = %created.id, warning = %warning, "Docker warning during container creation");
        }

        let result = self.run_to_completion(&created.id).await;

        if let Err(e) = self
            .docker
            .remove_container(
                &created.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container_id = %created.id, error = %e, "Failed to remove sandbox container");
        }

        let mut output = result?;
        output.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            container = %name,
            duration_ms = output.duration_ms,
            exit_code = ?output.exit_code,
            "Sandbox execution finished"
        );
        Ok(output)
    }

    async fn run_to_completion(&self, container_id: &str) -> Result<ExecutionOutput, SandboxError> {
        self.docker
            .start_container::<String>(container_id, None)
            .await?;

        let exit_code = tokio::time::timeout(self.options.timeout, self.wait_for_exit(container_id))
            .await
            .map_err(|_| SandboxError::Timeout {
                timeout_secs: self.options.timeout.as_secs(),
            })??;

        let mut output = self.collect_logs(container_id).await?;
        output.exit_code = Some(exit_code);
        Ok(output)
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<i64, SandboxError> {
        let mut stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let mut exit_code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => exit_code = response.status_code,
                // A non-zero exit is reported as an error by the daemon; it is
                // an ordinary outcome for a learner program.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(exit_code)
    }

    async fn collect_logs(&self, container_id: &str) -> Result<ExecutionOutput, SandboxError> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut output = ExecutionOutput::default();
        while let Some(item) = stream.next().await {
            match item? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(output)
    }
}

impl Sandbox for DockerSandbox {
    fn execute<'a>(
        &'a self,
        request: &'a ExecutionRequest,
    ) -> BoxFuture<'a, Result<ExecutionOutput, SandboxError>> {
        Box::pin(self.execute_inner(request))
    }

    fn name(&self) -> &str {
        "docker"
    }
}

/// Shell script that writes, compiles and runs the program inside the container.
///
/// Compiler output is buffered and replayed on standard error only when the
/// build fails, so a clean build leaves both streams untouched.
fn run_script(language: &str) -> Result<&'static str, SandboxError> {
    match language {
        "csharp" | "cs" | "c#" => Ok(concat!(
            "printf '%s' \"$CQ_SOURCE\" > /tmp/Program.cs && ",
            "{ mcs -out:/tmp/program.exe /tmp/Program.cs > /tmp/build.log 2>&1 ",
            "|| { cat /tmp/build.log >&2; exit 1; }; } && ",
            "printf '%s' \"$CQ_STDIN\" | mono /tmp/program.exe"
        )),
        "python" | "py" => Ok(concat!(
            "printf '%s' \"$CQ_SOURCE\" > /tmp/main.py && ",
            "printf '%s' \"$CQ_STDIN\" | python3 /tmp/main.py"
        )),
        other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
    }
}

fn container_name() -> String {
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("codequest-run-{}-{seq}", std::process::id())
}

fn memory_bytes(limit_mb: u64) -> i64 {
    i64::try_from(limit_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
}

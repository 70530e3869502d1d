//! Real sandbox backends. These need network access or a Docker daemon and
//! are ignored by default; run with `cargo test -- --ignored`.

mod support;

use std::time::Duration;

use codequest_sandbox::{
    DockerSandbox, DockerSandboxOptions, ExecutionRequest, HttpSandbox, HttpSandboxOptions,
    Sandbox, SandboxError,
};
use support::SUM_PROGRAM;

const PISTON_URL: &str = "https://emkc.org/api/v2/piston";

#[tokio::test]
#[ignore = "requires network access to the public sandbox"]
async fn test_http_sandbox_runs_program_with_stdin() {
    let sandbox = HttpSandbox::new(
        HttpSandboxOptions::new(PISTON_URL).with_timeout(Duration::from_secs(30)),
    )
    .expect("Failed to build HTTP sandbox");

    let output = sandbox
        .execute(&ExecutionRequest::new("csharp", SUM_PROGRAM).with_stdin("2\n3\n"))
        .await
        .expect("Execution should succeed");

    assert!(!output.has_stderr(), "stderr: {}", output.stderr);
    assert!(output.stdout.contains("Sum: 5"), "stdout: {}", output.stdout);
}

#[tokio::test]
#[ignore = "requires network access to the public sandbox"]
async fn test_http_sandbox_reports_compile_errors_on_stderr() {
    let sandbox = HttpSandbox::new(HttpSandboxOptions::new(PISTON_URL))
        .expect("Failed to build HTTP sandbox");
    let source = SUM_PROGRAM.replace("int a", "int a = ;");

    let output = sandbox
        .execute(&ExecutionRequest::new("csharp", source))
        .await
        .expect("Execution should succeed");

    assert!(output.has_stderr());
    assert!(output.stderr.contains("error CS"), "stderr: {}", output.stderr);
}

#[tokio::test]
async fn test_http_sandbox_unreachable_is_a_network_error() {
    let sandbox = HttpSandbox::new(
        HttpSandboxOptions::new("http://127.0.0.1:9").with_timeout(Duration::from_secs(2)),
    )
    .expect("Failed to build HTTP sandbox");

    let err = sandbox
        .execute(&ExecutionRequest::new("csharp", SUM_PROGRAM))
        .await
        .expect_err("Nothing listens on the discard port");

    assert!(err.is_network(), "unexpected error: {err}");
    assert!(matches!(
        err,
        SandboxError::Network(_) | SandboxError::Timeout { .. }
    ));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_docker_sandbox_runs_program_with_stdin() {
    let sandbox = DockerSandbox::connect(
        DockerSandboxOptions::new("mono:6.12").with_timeout(Duration::from_secs(60)),
    )
    .expect("Failed to connect to Docker");
    sandbox.health_check().await.expect("Docker should respond");

    let output = sandbox
        .execute(&ExecutionRequest::new("csharp", SUM_PROGRAM).with_stdin("-5\n10\n"))
        .await
        .expect("Execution should succeed");

    assert!(output.stdout.contains("Sum: 5"), "stdout: {}", output.stdout);
}

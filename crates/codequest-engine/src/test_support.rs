//! Scripted sandboxes for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use codequest_sandbox::{ExecutionOutput, ExecutionRequest, Sandbox, SandboxError};
use futures::future::BoxFuture;

type Script = dyn Fn(&ExecutionRequest) -> Result<ExecutionOutput, SandboxError> + Send + Sync;

/// A sandbox whose answers come from a closure.
pub struct ScriptedSandbox {
    script: Box<Script>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedSandbox {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ExecutionRequest) -> Result<ExecutionOutput, SandboxError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with `stdout` and empty stderr.
    pub fn stdout(stdout: &'static str) -> Self {
        Self::new(move |_| Ok(ExecutionOutput::new(stdout, "")))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute<'a>(
        &'a self,
        request: &'a ExecutionRequest,
    ) -> BoxFuture<'a, Result<ExecutionOutput, SandboxError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(request)
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

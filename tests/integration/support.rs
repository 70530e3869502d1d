//! Shared fixtures: a scripted sandbox that "runs" the sample programs, and
//! temp directories.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use codequest_sandbox::{ExecutionOutput, ExecutionRequest, Sandbox, SandboxError};
use futures::future::BoxFuture;

/// Reads two numbers and prints their sum, with prompts.
pub const SUM_PROGRAM: &str = r#"using System;

class Program
{
    static void Main()
    {
        Console.Write("First: ");
        int a = int.Parse(Console.ReadLine());
        Console.Write("Second: ");
        int b = int.Parse(Console.ReadLine());
        Console.WriteLine("Sum: " + (a + b));
    }
}
"#;

/// Computes the sum like [`SUM_PROGRAM`] would, so tests need no compiler.
///
/// Sources containing `BROKEN` get a compiler error; sources containing
/// `CRASH` get a runtime exception.
#[derive(Debug, Default)]
pub struct SumSandbox {
    calls: AtomicUsize,
    delay: Duration,
}

impl SumSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Sandbox for SumSandbox {
    fn execute<'a>(
        &'a self,
        request: &'a ExecutionRequest,
    ) -> BoxFuture<'a, Result<ExecutionOutput, SandboxError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if request.source.contains("BROKEN") {
                return Ok(ExecutionOutput::new(
                    "",
                    "Program.cs(7,9): error CS0103: The name 'BROKEN' does not exist in the current context",
                ));
            }
            if request.source.contains("CRASH") {
                return Ok(ExecutionOutput::new(
                    "First: ",
                    "Unhandled exception. System.FormatException: Input string was not in a correct format.",
                ));
            }
            let sum: i64 = request
                .stdin
                .lines()
                .filter_map(|l| l.trim().parse::<i64>().ok())
                .sum();
            Ok(ExecutionOutput::new(format!("First: Second: Sum: {sum}\n"), ""))
        })
    }

    fn name(&self) -> &str {
        "sum"
    }
}

/// A fresh directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let dir = std::env::temp_dir().join(format!(
        "codequest-it-{name}-{}-{nanos}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

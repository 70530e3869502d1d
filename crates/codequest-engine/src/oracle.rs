//! Reference oracles for differential testing.
//!
//! An oracle is the trusted implementation of a challenge. Given the same
//! input block the learner's program receives, it writes the output the
//! program is expected to contain. Oracles are plain Rust and never touch the
//! sandbox.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by an oracle while computing expected output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// The oracle asked for more input lines than the block contains.
    #[error("oracle expected another input line")]
    MissingInput,

    /// An input line could not be parsed.
    #[error("oracle could not parse input '{input}': {reason}")]
    InvalidInput {
        /// The offending line.
        input: String,
        /// Parse failure description.
        reason: String,
    },

    /// A table oracle has no entry for the input block.
    #[error("no expected output recorded for input '{input}'")]
    NoEntry {
        /// The input block.
        input: String,
    },
}

// ============================================================================
// Input supplier and output sink
// ============================================================================

/// Supplies an input block to an oracle one line at a time.
#[derive(Debug, Clone)]
pub struct InputLines {
    block: String,
    lines: VecDeque<String>,
}

impl InputLines {
    /// Splits `block` into lines.
    #[must_use]
    pub fn new(block: &str) -> Self {
        Self {
            block: block.to_string(),
            lines: block.lines().map(str::to_string).collect(),
        }
    }

    /// The whole input block.
    #[must_use]
    pub fn block(&self) -> &str {
        &self.block
    }

    /// Returns the next line.
    pub fn next_line(&mut self) -> Result<String, OracleError> {
        self.lines.pop_front().ok_or(OracleError::MissingInput)
    }

    /// Parses the next line as a floating-point number.
    pub fn next_f64(&mut self) -> Result<f64, OracleError> {
        let line = self.next_line()?;
        line.trim()
            .parse()
            .map_err(|e: std::num::ParseFloatError| OracleError::InvalidInput {
                input: line.clone(),
                reason: e.to_string(),
            })
    }

    /// Parses the next line as an integer.
    pub fn next_i64(&mut self) -> Result<i64, OracleError> {
        let line = self.next_line()?;
        line.trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| OracleError::InvalidInput {
                input: line.clone(),
                reason: e.to_string(),
            })
    }
}

/// Accumulates what an oracle writes.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    buffer: String,
}

impl OutputSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `text` without a newline.
    pub fn write(&mut self, text: impl AsRef<str>) {
        self.buffer.push_str(text.as_ref());
    }

    /// Writes `text` followed by a newline.
    pub fn write_line(&mut self, text: impl AsRef<str>) {
        self.buffer.push_str(text.as_ref());
        self.buffer.push('\n');
    }

    /// Everything written so far.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// Consumes the sink, returning its contents.
    #[must_use]
    pub fn into_string(self) -> String {
        self.buffer
    }
}

// ============================================================================
// Oracle trait
// ============================================================================

/// A trusted reference implementation of a challenge.
pub trait Oracle: Send + Sync + fmt::Debug {
    /// Reads from `input` and writes the expected output to `output`.
    fn run(&self, input: &mut InputLines, output: &mut OutputSink) -> Result<(), OracleError>;
}

/// Runs `oracle` on `block` and returns everything it wrote.
pub fn expected_output(oracle: &dyn Oracle, block: &str) -> Result<String, OracleError> {
    let mut input = InputLines::new(block);
    let mut output = OutputSink::new();
    oracle.run(&mut input, &mut output)?;
    Ok(output.into_string())
}

type OracleFn = dyn Fn(&mut InputLines, &mut OutputSink) -> Result<(), OracleError> + Send + Sync;

/// An oracle backed by a closure.
pub struct FnOracle {
    name: String,
    f: Box<OracleFn>,
}

impl FnOracle {
    /// Wraps `f` under a descriptive name.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut InputLines, &mut OutputSink) -> Result<(), OracleError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    /// The oracle name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for FnOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOracle").field("name", &self.name).finish()
    }
}

impl Oracle for FnOracle {
    fn run(&self, input: &mut InputLines, output: &mut OutputSink) -> Result<(), OracleError> {
        (self.f)(input, output)
    }
}

/// An oracle that looks expected output up by input block.
///
/// Blocks are compared line by line with surrounding whitespace trimmed.
#[derive(Debug, Clone, Default)]
pub struct TableOracle {
    entries: BTreeMap<String, String>,
}

impl TableOracle {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    #[must_use]
    pub fn with_case(mut self, input: &str, output: impl Into<String>) -> Self {
        self.entries.insert(table_key(input), output.into());
        self
    }

    /// Input blocks in the table.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Oracle for TableOracle {
    fn run(&self, input: &mut InputLines, output: &mut OutputSink) -> Result<(), OracleError> {
        let key = table_key(input.block());
        let expected = self
            .entries
            .get(&key)
            .ok_or(OracleError::NoEntry { input: key })?;
        output.write(expected);
        Ok(())
    }
}

fn table_key(block: &str) -> String {
    block
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Built-in oracles
// ============================================================================

/// Names accepted by [`builtin_oracle`].
pub const BUILTIN_ORACLES: &[&str] = &[
    "sphere_volume",
    "rectangle_area",
    "celsius_to_fahrenheit",
    "even_or_odd",
    "sum_of_two",
];

/// Looks up a built-in oracle by name.
#[must_use]
pub fn builtin_oracle(name: &str) -> Option<Arc<dyn Oracle>> {
    let oracle = match name {
        "sphere_volume" => FnOracle::new(name, |input, output| {
            let r = input.next_f64()?;
            let volume = 4.0 / 3.0 * std::f64::consts::PI * r.powi(3);
            output.write_line(format!("{volume:.2}"));
            Ok(())
        }),
        "rectangle_area" => FnOracle::new(name, |input, output| {
            let width = input.next_f64()?;
            let height = input.next_f64()?;
            output.write_line(format!("{:.2}", width * height));
            Ok(())
        }),
        "celsius_to_fahrenheit" => FnOracle::new(name, |input, output| {
            let celsius = input.next_f64()?;
            output.write_line(format!("{:.1}", celsius * 9.0 / 5.0 + 32.0));
            Ok(())
        }),
        "even_or_odd" => FnOracle::new(name, |input, output| {
            let n = input.next_i64()?;
            output.write_line(if n % 2 == 0 { "Even" } else { "Odd" });
            Ok(())
        }),
        "sum_of_two" => FnOracle::new(name, |input, output| {
            let a = input.next_i64()?;
            let b = input.next_i64()?;
            output.write_line(a.saturating_add(b).to_string());
            Ok(())
        }),
        _ => return None,
    };
    Some(Arc::new(oracle))
}

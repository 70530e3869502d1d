//! Challenge catalog.
//!
//! Challenges are immutable once loaded. The catalog is either the built-in
//! set shipped with the engine or a JSON file:
//!
//! ```json
//! {
//!   "challenges": [
//!     {
//!       "id": "sphere-volume",
//!       "title": "Volume of a Sphere",
//!       "description": "Read a radius and print the volume.",
//!       "starterSource": "using System;\\n...",
//!       "hint": "V = 4/3 * PI * r^3",
//!       "referenceSolution": "...",
//!       "testInputs": ["5", "2.5"],
//!       "oracle": { "type": "builtin", "name": "sphere_volume" },
//!       "xpReward": 50,
//!       "coinsReward": 10,
//!       "module": "Basics"
//!     }
//!   ]
//! }
//! ```
//!
//! A `table` oracle lists `cases` of `{ "input", "output" }`; when
//! `testInputs` is omitted the table inputs are used.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::oracle::{builtin_oracle, Oracle, TableOracle};

// ============================================================================
// Challenge
// ============================================================================

/// An immutable catalog entry.
#[derive(Clone)]
pub struct Challenge {
    /// Stable identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Task description.
    pub description: String,
    /// Starter source as authored (may contain escaped newlines).
    pub starter_source: String,
    /// Hint text.
    pub hint: String,
    /// Reference solution, used only for length-based grading.
    pub reference_solution: String,
    /// Ordered test-input blocks.
    pub test_inputs: Vec<String>,
    /// Trusted reference implementation.
    pub oracle: Arc<dyn Oracle>,
    /// XP awarded on first completion; the configured default when absent.
    pub xp_reward: Option<u32>,
    /// Coins awarded on first completion; the configured default when absent.
    pub coins_reward: Option<u32>,
    /// Module grouping.
    pub module: String,
}

impl Challenge {
    /// The starter source with escaped newline sequences turned into real
    /// newlines.
    #[must_use]
    pub fn starter_text(&self) -> String {
        normalize_escaped_newlines(&self.starter_source)
    }

    /// A serializable summary without the reference solution or oracle.
    #[must_use]
    pub fn info(&self) -> ChallengeInfo {
        ChallengeInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            starter_source: self.starter_text(),
            hint: self.hint.clone(),
            module: self.module.clone(),
            xp_reward: self.xp_reward,
            coins_reward: self.coins_reward,
            test_count: self.test_inputs.len(),
        }
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Challenge")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("module", &self.module)
            .field("test_inputs", &self.test_inputs.len())
            .field("oracle", &self.oracle)
            .finish_non_exhaustive()
    }
}

/// Public view of a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeInfo {
    /// Stable identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Task description.
    pub description: String,
    /// Normalized starter source.
    pub starter_source: String,
    /// Hint text.
    pub hint: String,
    /// Module grouping.
    pub module: String,
    /// Explicit XP reward.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xp_reward: Option<u32>,
    /// Explicit coin reward.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coins_reward: Option<u32>,
    /// Number of hidden test inputs.
    pub test_count: usize,
}

/// Replaces literal `\r\n` and `\n` escape sequences with a newline.
///
/// # Examples
///
/// ```
/// use codequest_engine::normalize_escaped_newlines;
///
/// assert_eq!(normalize_escaped_newlines(r"a\nb\r\nc"), "a\nb\nc");
/// ```
#[must_use]
pub fn normalize_escaped_newlines(text: &str) -> String {
    text.replace("\\r\\n", "\n").replace("\\n", "\n")
}

// ============================================================================
// Catalog
// ============================================================================

/// An ordered list of challenges.
#[derive(Debug, Clone)]
pub struct Catalog {
    challenges: Vec<Challenge>,
}

impl Catalog {
    /// Builds a catalog, rejecting an empty list, duplicate ids and
    /// challenges without test inputs.
    pub fn new(challenges: Vec<Challenge>) -> Result<Self> {
        if challenges.is_empty() {
            return Err(EngineError::config_validation(
                "catalog has no challenges",
                "Add at least one entry to challenges",
            ));
        }
        let mut seen = HashSet::new();
        for challenge in &challenges {
            if !seen.insert(challenge.id.as_str()) {
                return Err(EngineError::config_validation(
                    format!("duplicate challenge id '{}'", challenge.id),
                    "Give every challenge a unique id",
                ));
            }
            if challenge.test_inputs.is_empty() {
                return Err(EngineError::config_validation(
                    format!("challenge '{}' has no test inputs", challenge.id),
                    "Add at least one entry to testInputs",
                ));
            }
        }
        Ok(Self { challenges })
    }

    /// Loads a JSON catalog from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(path, &content)?;
        debug!(path = %path.display(), challenges = catalog.len(), "Loaded challenge catalog");
        Ok(catalog)
    }

    /// Parses a JSON catalog. `path` is used in error messages only.
    pub fn from_json(path: &Path, content: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(content)
            .map_err(|e| EngineError::catalog_parse(path, e.to_string()))?;
        let challenges = file
            .challenges
            .into_iter()
            .map(|entry| entry.into_challenge(path))
            .collect::<Result<Vec<_>>>()?;
        Self::new(challenges).map_err(|e| match e {
            EngineError::ConfigValidationError { message, .. } => {
                EngineError::catalog_parse(path, message)
            }
            other => other,
        })
    }

    /// Number of challenges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    /// Returns `true` if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    /// Challenge at `index`.
    pub fn get(&self, index: usize) -> Result<&Challenge> {
        self.challenges
            .get(index)
            .ok_or(EngineError::ChallengeIndexOutOfRange {
                index,
                len: self.challenges.len(),
            })
    }

    /// Challenge with `id`, along with its index.
    pub fn find(&self, id: &str) -> Result<(usize, &Challenge)> {
        self.challenges
            .iter()
            .enumerate()
            .find(|(_, c)| c.id == id)
            .ok_or_else(|| EngineError::unknown_challenge(id))
    }

    /// Iterates in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Challenge> {
        self.challenges.iter()
    }

    /// The catalog shipped with the engine.
    #[must_use]
    pub fn builtin() -> Self {
        let challenges = BUILTIN
            .iter()
            .filter_map(|spec| {
                Some(Challenge {
                    id: spec.id.to_string(),
                    title: spec.title.to_string(),
                    description: spec.description.to_string(),
                    starter_source: STARTER.to_string(),
                    hint: spec.hint.to_string(),
                    reference_solution: spec.reference.to_string(),
                    test_inputs: spec.inputs.iter().map(|s| (*s).to_string()).collect(),
                    oracle: builtin_oracle(spec.oracle)?,
                    xp_reward: spec.xp,
                    coins_reward: spec.coins,
                    module: spec.module.to_string(),
                })
            })
            .collect();
        Self { challenges }
    }
}

// ============================================================================
// JSON format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    challenges: Vec<ChallengeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeEntry {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    starter_source: String,
    #[serde(default)]
    hint: String,
    reference_solution: String,
    #[serde(default)]
    test_inputs: Vec<String>,
    oracle: OracleEntry,
    #[serde(default)]
    xp_reward: Option<u32>,
    #[serde(default)]
    coins_reward: Option<u32>,
    #[serde(default)]
    module: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OracleEntry {
    Builtin { name: String },
    Table { cases: Vec<TableCase> },
}

#[derive(Debug, Deserialize)]
struct TableCase {
    input: String,
    output: String,
}

impl ChallengeEntry {
    fn into_challenge(self, path: &Path) -> Result<Challenge> {
        let mut test_inputs = self.test_inputs;
        let oracle: Arc<dyn Oracle> = match self.oracle {
            OracleEntry::Builtin { name } => {
                builtin_oracle(&name).ok_or_else(|| EngineError::unknown_oracle(name))?
            }
            OracleEntry::Table { cases } => {
                if cases.is_empty() {
                    return Err(EngineError::catalog_parse(
                        path,
                        format!("challenge '{}' has an empty oracle table", self.id),
                    ));
                }
                if let Some(case) = cases.iter().find(|c| c.output.trim().is_empty()) {
                    return Err(EngineError::catalog_parse(
                        path,
                        format!(
                            "challenge '{}' has an empty expected output for input {:?}",
                            self.id, case.input
                        ),
                    ));
                }
                if test_inputs.is_empty() {
                    test_inputs = cases.iter().map(|c| c.input.clone()).collect();
                }
                let table = cases
                    .into_iter()
                    .fold(TableOracle::new(), |table, case| {
                        table.with_case(&case.input, case.output)
                    });
                Arc::new(table)
            }
        };

        Ok(Challenge {
            id: self.id,
            title: self.title,
            description: self.description,
            starter_source: self.starter_source,
            hint: self.hint,
            reference_solution: self.reference_solution,
            test_inputs,
            oracle,
            xp_reward: self.xp_reward,
            coins_reward: self.coins_reward,
            module: self.module,
        })
    }
}

// ============================================================================
// Built-in challenges
// ============================================================================

struct BuiltinSpec {
    id: &'static str,
    title: &'static str,
    description: &'static str,
    hint: &'static str,
    reference: &'static str,
    inputs: &'static [&'static str],
    oracle: &'static str,
    xp: Option<u32>,
    coins: Option<u32>,
    module: &'static str,
}

const STARTER: &str = "using System;\\n\\nclass Program\\n{\\n    static void Main()\\n    {\\n        // Your code here\\n    }\\n}\\n";

const BUILTIN: &[BuiltinSpec] = &[
    BuiltinSpec {
        id: "sum-of-two",
        title: "Sum of Two Numbers",
        description: "Read two whole numbers, one per line, and print their sum.",
        hint: "Parse each line with int.Parse before adding.",
        reference: r#"using System;
class Program
{
    static void Main()
    {
        int a = int.Parse(Console.ReadLine());
        int b = int.Parse(Console.ReadLine());
        Console.WriteLine(a + b);
    }
}
"#,
        inputs: &["2\n3", "-5\n10", "0\n0"],
        oracle: "sum_of_two",
        xp: Some(30),
        coins: Some(5),
        module: "Basics",
    },
    BuiltinSpec {
        id: "even-or-odd",
        title: "Even or Odd",
        description: "Read a whole number and print Even or Odd.",
        hint: "The remainder operator % tells you what is left after division.",
        reference: r#"using System;
class Program
{
    static void Main()
    {
        int n = int.Parse(Console.ReadLine());
        Console.WriteLine(n % 2 == 0 ? "Even" : "Odd");
    }
}
"#,
        inputs: &["4", "7", "0"],
        oracle: "even_or_odd",
        xp: Some(40),
        coins: None,
        module: "Basics",
    },
    BuiltinSpec {
        id: "celsius-to-fahrenheit",
        title: "Temperature Conversion",
        description: "Read a temperature in Celsius and print it in Fahrenheit with one decimal place.",
        hint: "F = C * 9 / 5 + 32. Use ToString(\"F1\") for one decimal place.",
        reference: r#"using System;
class Program
{
    static void Main()
    {
        double c = double.Parse(Console.ReadLine());
        Console.WriteLine((c * 9 / 5 + 32).ToString("F1"));
    }
}
"#,
        inputs: &["100", "-40", "37"],
        oracle: "celsius_to_fahrenheit",
        xp: None,
        coins: None,
        module: "Formulas",
    },
    BuiltinSpec {
        id: "rectangle-area",
        title: "Area of a Rectangle",
        description: "Read a width and a height, one per line, and print the area with two decimal places.",
        hint: "Multiply width by height and format with ToString(\"F2\").",
        reference: r#"using System;
class Program
{
    static void Main()
    {
        double w = double.Parse(Console.ReadLine());
        double h = double.Parse(Console.ReadLine());
        Console.WriteLine((w * h).ToString("F2"));
    }
}
"#,
        inputs: &["3\n4", "2.5\n10"],
        oracle: "rectangle_area",
        xp: None,
        coins: None,
        module: "Formulas",
    },
    BuiltinSpec {
        id: "sphere-volume",
        title: "Volume of a Sphere",
        description: "Read a radius and print the volume of the sphere with two decimal places.",
        hint: "V = 4/3 * Math.PI * r^3. Watch out for integer division in 4/3.",
        reference: r#"using System;
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
"#,
        inputs: &["5", "2.5", "1"],
        oracle: "sphere_volume",
        xp: Some(75),
        coins: Some(15),
        module: "Formulas",
    },
];

//! Configuration for the CodeQuest engine.
//!
//! Everything is read from an optional `codequest.json` with camelCase keys.
//! Every field has a default, so a missing file or a partial file is fine;
//! the values are validated after parsing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codequest_sandbox::{
    DockerSandbox, DockerSandboxOptions, HttpSandbox, HttpSandboxOptions, Sandbox,
};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::language::Language;
use crate::progression::ProgressionPolicy;
use crate::session::SessionSettings;
use crate::sync::RetryPolicy;
use crate::verify::GradingPolicy;

/// The default config file name.
const CONFIG_FILE_NAME: &str = "codequest.json";

fn default_sandbox_url() -> String {
    "https://emkc.org/api/v2/piston".to_string()
}

fn default_language_version() -> String {
    "*".to_string()
}

fn default_image() -> String {
    "mono:6.12".to_string()
}

const fn default_sandbox_timeout() -> u64 {
    10
}

const fn default_memory_limit() -> u64 {
    256
}

const fn default_debounce_ms() -> u64 {
    500
}

const fn default_three_star_ratio() -> f64 {
    1.2
}

const fn default_two_star_ratio() -> f64 {
    1.5
}

const fn default_xp_reward() -> u32 {
    50
}

const fn default_coins_reward() -> u32 {
    10
}

const fn default_level_threshold() -> u64 {
    100
}

const fn default_level_step() -> u64 {
    100
}

fn default_profile_path() -> String {
    ".codequest/profile.json".to_string()
}

fn default_change_log() -> String {
    ".codequest/changes.jsonl".to_string()
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    5000
}

const fn default_max_attempts() -> u32 {
    5
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Source language of the challenges.
    #[serde(default)]
    pub language: Language,

    /// Where programs run.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Background linting.
    #[serde(default)]
    pub lint: LintConfig,

    /// Star thresholds.
    #[serde(default)]
    pub grading: GradingConfig,

    /// Rewards and the level curve.
    #[serde(default)]
    pub progression: ProgressionConfig,

    /// Learner profile persistence.
    #[serde(default)]
    pub profile: ProfileConfig,

    /// Optional JSON challenge catalog; the built-in catalog is used when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
}

impl Config {
    /// Loads `codequest.json` from the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or holds
    /// invalid values.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            EngineError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads `codequest.json` from `dir`.
    ///
    /// # Errors
    ///
    /// See [`load_from_file`](Self::load_from_file).
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from `path`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigParseError` for unreadable files, invalid
    /// JSON and unknown enum values, and `EngineError::ConfigValidationError`
    /// for out-of-range values.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(EngineError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| EngineError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ConfigValidationError` naming the first bad
    /// field.
    pub fn validate(&self) -> Result<()> {
        if self.sandbox.timeout_seconds == 0 {
            return Err(EngineError::config_validation(
                "sandbox.timeoutSeconds must be greater than 0",
                "Set sandbox.timeoutSeconds to at least 1 in your codequest.json",
            ));
        }

        match self.sandbox.backend {
            SandboxBackend::Http if self.sandbox.url.trim().is_empty() => {
                return Err(EngineError::config_validation(
                    "sandbox.url must not be empty for the http backend",
                    "Set sandbox.url to the execution service base URL, or use \"backend\": \"docker\"",
                ));
            }
            SandboxBackend::Docker if self.sandbox.image.trim().is_empty() => {
                return Err(EngineError::config_validation(
                    "sandbox.image must not be empty for the docker backend",
                    "Set sandbox.image to an image with a C# compiler (e.g. mono:6.12)",
                ));
            }
            _ => {}
        }

        if self.sandbox.backend == SandboxBackend::Docker && self.sandbox.memory_limit_mb == 0 {
            return Err(EngineError::config_validation(
                "sandbox.memoryLimitMb must be greater than 0",
                "Set sandbox.memoryLimitMb to at least 64 in your codequest.json",
            ));
        }

        if self.lint.debounce_ms == 0 {
            return Err(EngineError::config_validation(
                "lint.debounceMs must be greater than 0",
                "Set lint.debounceMs to a positive delay such as 500",
            ));
        }

        let grading = &self.grading;
        if !(grading.three_star_ratio >= 1.0 && grading.two_star_ratio >= grading.three_star_ratio)
        {
            return Err(EngineError::config_validation(
                format!(
                    "grading ratios must satisfy twoStarRatio >= threeStarRatio >= 1.0 (got {} and {})",
                    grading.two_star_ratio, grading.three_star_ratio
                ),
                "Use the defaults threeStarRatio 1.2 and twoStarRatio 1.5 if unsure",
            ));
        }

        if self.progression.level_step == 0 || self.progression.initial_level_threshold == 0 {
            return Err(EngineError::config_validation(
                "progression.initialLevelThreshold and progression.levelStep must be greater than 0",
                "Set both to at least 1 in your codequest.json",
            ));
        }

        let retry = &self.profile.retry;
        if retry.initial_backoff_ms == 0 || retry.max_backoff_ms == 0 || retry.max_attempts == 0 {
            return Err(EngineError::config_validation(
                "profile.retry values must be greater than 0",
                "Set initialBackoffMs, maxBackoffMs and maxAttempts to at least 1",
            ));
        }

        if self.profile.path.trim().is_empty() || self.profile.change_log.trim().is_empty() {
            return Err(EngineError::config_validation(
                "profile.path and profile.changeLog must not be empty",
                "Provide file paths for the profile and its change log",
            ));
        }

        Ok(())
    }

    /// Session tunables derived from this configuration.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            language: self.language,
            grading: self.grading.policy(),
            progression: self.progression.policy(),
        }
    }

    /// Quiet period before background linting.
    #[must_use]
    pub const fn lint_debounce(&self) -> Duration {
        Duration::from_millis(self.lint.debounce_ms)
    }

    /// Path of the custom catalog, if configured.
    #[must_use]
    pub fn catalog_path(&self) -> Option<PathBuf> {
        self.catalog.as_deref().map(PathBuf::from)
    }
}

// ============================================================================
// Sandbox
// ============================================================================

/// Sandbox implementations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackend {
    /// Remote Piston-style HTTP service.
    #[default]
    Http,
    /// Local Docker daemon.
    Docker,
}

impl SandboxBackend {
    /// Parses a backend name, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Self::Http),
            "docker" => Some(Self::Docker),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for SandboxBackend {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid sandbox backend '{s}': expected one of 'http', 'docker'"
            ))
        })
    }
}

impl Serialize for SandboxBackend {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            Self::Http => "http",
            Self::Docker => "docker",
        })
    }
}

/// Sandbox settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Which implementation to use.
    #[serde(default)]
    pub backend: SandboxBackend,
    /// Base URL for the http backend.
    #[serde(default = "default_sandbox_url")]
    pub url: String,
    /// Language version requested from the http backend.
    #[serde(default = "default_language_version")]
    pub language_version: String,
    /// Image for the docker backend.
    #[serde(default = "default_image")]
    pub image: String,
    /// Per-execution timeout.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_seconds: u64,
    /// Container memory limit for the docker backend.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            url: default_sandbox_url(),
            language_version: default_language_version(),
            image: default_image(),
            timeout_seconds: default_sandbox_timeout(),
            memory_limit_mb: default_memory_limit(),
        }
    }
}

impl SandboxConfig {
    /// Per-execution timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Builds the configured sandbox.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Sandbox` if the HTTP client cannot be built or
    /// the Docker daemon cannot be reached.
    pub fn build(&self) -> Result<Arc<dyn Sandbox>> {
        let sandbox: Arc<dyn Sandbox> = match self.backend {
            SandboxBackend::Http => Arc::new(HttpSandbox::new(
                HttpSandboxOptions::new(&self.url)
                    .with_language_version(&self.language_version)
                    .with_timeout(self.timeout()),
            )?),
            SandboxBackend::Docker => Arc::new(DockerSandbox::connect(
                DockerSandboxOptions::new(&self.image)
                    .with_timeout(self.timeout())
                    .with_memory_limit_mb(self.memory_limit_mb),
            )?),
        };
        Ok(sandbox)
    }
}

// ============================================================================
// Lint, grading, progression
// ============================================================================

/// Background lint settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintConfig {
    /// Quiet period after the last edit, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Star thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingConfig {
    /// Length ratio at or below which three stars are earned.
    #[serde(default = "default_three_star_ratio")]
    pub three_star_ratio: f64,
    /// Length ratio at or below which two stars are earned.
    #[serde(default = "default_two_star_ratio")]
    pub two_star_ratio: f64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            three_star_ratio: default_three_star_ratio(),
            two_star_ratio: default_two_star_ratio(),
        }
    }
}

impl GradingConfig {
    /// The grading policy these values describe.
    #[must_use]
    pub const fn policy(&self) -> GradingPolicy {
        GradingPolicy {
            three_star_ratio: self.three_star_ratio,
            two_star_ratio: self.two_star_ratio,
        }
    }
}

/// Rewards and level curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionConfig {
    /// XP for challenges without an explicit reward.
    #[serde(default = "default_xp_reward")]
    pub default_xp_reward: u32,
    /// Coins for challenges without an explicit reward.
    #[serde(default = "default_coins_reward")]
    pub default_coins_reward: u32,
    /// XP needed to reach level 2.
    #[serde(default = "default_level_threshold")]
    pub initial_level_threshold: u64,
    /// Added to the threshold at every level-up.
    #[serde(default = "default_level_step")]
    pub level_step: u64,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            default_xp_reward: default_xp_reward(),
            default_coins_reward: default_coins_reward(),
            initial_level_threshold: default_level_threshold(),
            level_step: default_level_step(),
        }
    }
}

impl ProgressionConfig {
    /// The progression policy these values describe.
    #[must_use]
    pub const fn policy(&self) -> ProgressionPolicy {
        ProgressionPolicy {
            default_xp_reward: self.default_xp_reward,
            default_coins_reward: self.default_coins_reward,
            initial_level_threshold: self.initial_level_threshold,
            level_step: self.level_step,
        }
    }
}

// ============================================================================
// Profile persistence
// ============================================================================

/// Where the learner profile lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    /// Profile JSON file.
    #[serde(default = "default_profile_path")]
    pub path: String,
    /// Change log of writes not yet applied to the profile.
    #[serde(default = "default_change_log")]
    pub change_log: String,
    /// Backoff for failed writes.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            path: default_profile_path(),
            change_log: default_change_log(),
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff for profile writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Attempts per entry before giving up until the next trigger.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    /// The retry policy these values describe.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_attempts: self.max_attempts,
        }
    }
}

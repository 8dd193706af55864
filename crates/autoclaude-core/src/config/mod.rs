//! Daemon configuration model.
//!
//! Loads and validates the YAML configuration file that names the monitored
//! repositories and their merge policies. The configuration is immutable
//! after load; the daemon only ever reads it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Product name, used for default paths.
pub const PRODUCT_NAME: &str = "auto-claude";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("read config {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("parse config {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying YAML error.
        source: serde_yaml::Error,
    },

    /// A semantic validation rule was violated.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interval between repository polls.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Root directory for clones, worktrees, and logs.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Log file path. Defaults to `{workdir}/logs/auto-claude.log`.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Claude invocation settings.
    #[serde(default)]
    pub claude: ClaudeConfig,

    /// Monitored repositories.
    #[serde(default)]
    pub repos: Vec<RepoConfig>,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,

    /// Terminal status view settings.
    #[serde(default)]
    pub tui: TuiConfig,
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/tmp").join(PRODUCT_NAME)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            workdir: default_workdir(),
            log_file: None,
            claude: ClaudeConfig::default(),
            repos: Vec::new(),
            log: LogConfig::default(),
            tui: TuiConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// validation rule is violated (see [`Config::validate`]).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate semantic rules that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no repositories are configured,
    /// a repository is missing its owner or name, a concurrency limit is
    /// zero, the TUI refresh interval is not positive, or a review request
    /// comment is enabled without a message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repos.is_empty() {
            return Err(ConfigError::Invalid("no repos configured".to_string()));
        }
        if self.tui.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "tui.refresh_interval must be positive".to_string(),
            ));
        }
        for (i, repo) in self.repos.iter().enumerate() {
            if repo.owner.is_empty() {
                return Err(ConfigError::Invalid(format!("repos[{i}]: owner required")));
            }
            if repo.name.is_empty() {
                return Err(ConfigError::Invalid(format!("repos[{i}]: name required")));
            }
            if repo.max_concurrent_prs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "repos[{i}]: max_concurrent_prs must be at least 1"
                )));
            }
            if let Some(comment) = &repo.review_request_comment {
                if comment.enabled && comment.message.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "repos[{i}]: review_request_comment.message required when enabled"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Effective log file path.
    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.workdir.join("logs").join(format!("{PRODUCT_NAME}.log")))
    }

    /// Directory for persisted agent transcripts.
    #[must_use]
    pub fn transcript_dir(&self) -> PathBuf {
        self.workdir.join("logs").join("claude")
    }
}

/// Claude CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Model identifier passed to the CLI.
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "opus".to_string()
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
        }
    }
}

/// Per-repository merge policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Repository owner (user or organization).
    #[serde(default)]
    pub owner: String,

    /// Repository name.
    #[serde(default)]
    pub name: String,

    /// Branch pull requests merge into.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Authors whose pull requests are never touched.
    #[serde(default)]
    pub exclude_authors: Vec<String>,

    /// Merge method used when a pull request is ready.
    #[serde(default)]
    pub merge_method: MergeMethod,

    /// Maximum number of concurrently worked pull requests.
    #[serde(default = "default_max_concurrent_prs")]
    pub max_concurrent_prs: u32,

    /// Whether merge is gated on an approving Copilot review with all of
    /// its review threads resolved.
    #[serde(default = "default_require_copilot_review")]
    pub require_copilot_review: bool,

    /// Optional comment posted to nudge reviewers on unreviewed PRs.
    #[serde(default)]
    pub review_request_comment: Option<ReviewRequestComment>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

const fn default_max_concurrent_prs() -> u32 {
    3
}

const fn default_require_copilot_review() -> bool {
    true
}

impl RepoConfig {
    /// `owner/name` form.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Review request comment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequestComment {
    /// Whether the comment is posted at all.
    #[serde(default)]
    pub enabled: bool,

    /// Comment body.
    #[serde(default)]
    pub message: String,
}

/// How a ready pull request is merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    /// Squash all commits into one.
    #[default]
    Squash,
    /// Create a merge commit.
    Merge,
}

impl MergeMethod {
    /// Lowercase wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Squash => "squash",
            Self::Merge => "merge",
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level emitted to the log sinks.
    #[serde(default)]
    pub level: LogLevel,
}

/// Log verbosity level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Recoverable problems only.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Level directive understood by the tracing filter.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Terminal status view settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuiConfig {
    /// Interval between snapshot refreshes.
    #[serde(default = "default_refresh_interval")]
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(3)
}

impl Default for TuiConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

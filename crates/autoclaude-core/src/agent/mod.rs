//! Agent runner capability boundary.
//!
//! An agent runner executes one AI coding session inside a working
//! directory and reports whether it succeeded, together with the captured
//! output and whatever telemetry the underlying CLI provides. The [`claude`]
//! submodule implements the trait over the Claude Code CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod claude;

/// Receives agent output line by line while the session runs.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors raised by an agent runner.
///
/// A session that ran but did not succeed is not an error; that is
/// [`AgentOutcome::success`] being false.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent CLI could not be spawned.
    #[error("spawn {command}: {source}")]
    Spawn {
        /// Command line that failed to start.
        command: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Reading the agent's output streams failed.
    #[error("stream agent output: {0}")]
    Stream(#[from] std::io::Error),
}

/// Result of one agent session.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// Whether the session completed successfully.
    pub success: bool,
    /// Captured output (final result text, or the raw transcript).
    pub output: String,
    /// Path of the persisted transcript, when one was written.
    pub transcript_file: Option<PathBuf>,
    /// Session wall-clock duration in milliseconds, when reported.
    pub duration_ms: Option<u64>,
    /// Session cost in USD, when reported.
    pub total_cost_usd: Option<f64>,
    /// Session identifier, when reported.
    pub session_id: Option<String>,
    /// Number of conversation turns, when reported.
    pub num_turns: Option<u64>,
}

impl AgentOutcome {
    /// Last `lines` lines of the captured output, for error reporting.
    #[must_use]
    pub fn output_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Capability for executing AI coding sessions.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Runs a session with a natural-language prompt inside `workdir`.
    ///
    /// When `output` is provided, the session's output is streamed to it
    /// line by line as it is produced.
    ///
    /// # Errors
    ///
    /// Returns an error only when the session could not be executed at
    /// all; an unsuccessful session is reported through the outcome.
    async fn run(
        &self,
        workdir: &Path,
        prompt: &str,
        output: Option<OutputCallback>,
    ) -> Result<AgentOutcome, AgentError>;

    /// Runs a named slash command with arguments inside `workdir`.
    ///
    /// # Errors
    ///
    /// Same contract as [`AgentRunner::run`].
    async fn run_command(
        &self,
        workdir: &Path,
        command: &str,
        args: &[String],
        output: Option<OutputCallback>,
    ) -> Result<AgentOutcome, AgentError> {
        let prompt = format!("/{command} {}", args.join(" "));
        self.run(workdir, &prompt, output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_tail_keeps_last_lines() {
        let outcome = AgentOutcome {
            output: "one\ntwo\nthree\nfour".to_string(),
            ..AgentOutcome::default()
        };
        assert_eq!(outcome.output_tail(2), "three\nfour");
        assert_eq!(outcome.output_tail(10), "one\ntwo\nthree\nfour");
    }
}

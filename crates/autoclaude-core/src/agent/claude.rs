//! Agent runner backed by the Claude Code CLI.
//!
//! Sessions run non-interactively with `-p`. Without a line callback the
//! CLI's `json` output format is used and parsed in one piece; with a
//! callback the `stream-json` format is used, text deltas are re-assembled
//! into lines as they arrive, and the final `result` event carries the
//! outcome. The full transcript of every session is persisted under the
//! transcript directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{AgentError, AgentOutcome, AgentRunner, OutputCallback};

/// Claude Code CLI runner.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    model: String,
    transcript_dir: PathBuf,
}

impl ClaudeRunner {
    /// Creates a runner invoking the given model, persisting transcripts
    /// under `transcript_dir`.
    #[must_use]
    pub const fn new(model: String, transcript_dir: PathBuf) -> Self {
        Self {
            model,
            transcript_dir,
        }
    }

    async fn run_session(
        &self,
        workdir: &Path,
        prompt: &str,
        label: &str,
        callback: Option<OutputCallback>,
    ) -> Result<AgentOutcome, AgentError> {
        let mut args: Vec<&str> = vec!["-p", prompt];
        if callback.is_some() {
            args.extend([
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
            ]);
        } else {
            args.extend(["--output-format", "json"]);
        }
        args.extend([
            "--no-session-persistence",
            "--dangerously-skip-permissions",
            "--model",
            &self.model,
        ]);

        info!(
            workdir = %workdir.display(),
            prompt_len = prompt.len(),
            streaming = callback.is_some(),
            "spawning claude"
        );
        debug!(prompt, "claude prompt");

        let mut command = tokio::process::Command::new("claude");
        command
            .args(&args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let raw = match callback {
            None => {
                let output = command.output().await.map_err(|source| AgentError::Spawn {
                    command: "claude".to_string(),
                    source,
                })?;
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                CapturedRun {
                    output: combined,
                    success: output.status.success(),
                }
            },
            Some(callback) => self.run_streaming(command, callback).await?,
        };

        let mut outcome = if raw.success {
            parse_outcome(&raw.output)
        } else {
            AgentOutcome {
                success: false,
                output: raw.output.clone(),
                ..AgentOutcome::default()
            }
        };

        outcome.transcript_file = self.persist_transcript(label, &raw.output);

        info!(
            success = outcome.success,
            duration_ms = outcome.duration_ms,
            cost_usd = outcome.total_cost_usd,
            turns = outcome.num_turns,
            session_id = outcome.session_id.as_deref(),
            "claude completed"
        );

        Ok(outcome)
    }

    async fn run_streaming(
        &self,
        mut command: tokio::process::Command,
        callback: OutputCallback,
    ) -> Result<CapturedRun, AgentError> {
        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            command: "claude".to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::Stream(std::io::Error::other("claude stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            AgentError::Stream(std::io::Error::other("claude stderr not captured"))
        })?;

        let captured = Arc::new(Mutex::new(String::new()));

        let stdout_captured = Arc::clone(&captured);
        let stdout_callback = Arc::clone(&callback);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut assembler = LineAssembler::default();
            while let Some(line) = lines.next_line().await? {
                if let Ok(mut buf) = stdout_captured.lock() {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                if let Some(text) = extract_text_delta(&line) {
                    assembler.push(&text, |l| (stdout_callback)(l));
                }
            }
            assembler.finish(|l| (stdout_callback)(l));
            Ok::<(), std::io::Error>(())
        });

        let stderr_captured = Arc::clone(&captured);
        let stderr_callback = Arc::clone(&callback);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                if let Ok(mut buf) = stderr_captured.lock() {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                (stderr_callback)(&format!("[stderr] {line}"));
            }
            Ok::<(), std::io::Error>(())
        });

        let status = child.wait().await.map_err(AgentError::Stream)?;
        for task in [stdout_task, stderr_task] {
            match task.await {
                Ok(result) => result?,
                Err(join_err) => {
                    return Err(AgentError::Stream(std::io::Error::other(join_err)));
                },
            }
        }

        let output = captured.lock().map(|buf| buf.clone()).unwrap_or_default();
        Ok(CapturedRun {
            output,
            success: status.success(),
        })
    }

    /// Writes the full session output to a timestamped file. Best effort;
    /// a write failure is logged and the session outcome stands.
    fn persist_transcript(&self, label: &str, output: &str) -> Option<PathBuf> {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S%.6f");
        let path = self
            .transcript_dir
            .join(format!("claude-{label}-{timestamp}.log"));

        if let Err(err) = std::fs::create_dir_all(&self.transcript_dir) {
            warn!(dir = %self.transcript_dir.display(), %err, "create transcript dir failed");
            return None;
        }
        if let Err(err) = std::fs::write(&path, output) {
            warn!(path = %path.display(), %err, "persist transcript failed");
            return None;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        debug!(path = %path.display(), "session transcript written");
        Some(path)
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(
        &self,
        workdir: &Path,
        prompt: &str,
        output: Option<OutputCallback>,
    ) -> Result<AgentOutcome, AgentError> {
        self.run_session(workdir, prompt, "prompt", output).await
    }

    async fn run_command(
        &self,
        workdir: &Path,
        command: &str,
        args: &[String],
        output: Option<OutputCallback>,
    ) -> Result<AgentOutcome, AgentError> {
        let prompt = format!("/{command} {}", args.join(" "));
        self.run_session(workdir, &prompt, command, output).await
    }
}

struct CapturedRun {
    output: String,
    success: bool,
}

/// Final result payload, shared by the `json` output format and the
/// terminal `result` event of `stream-json`.
#[derive(Debug, Default, Deserialize)]
struct ResultPayload {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    num_turns: Option<u64>,
}

impl ResultPayload {
    fn into_outcome(self) -> AgentOutcome {
        AgentOutcome {
            success: !self.is_error,
            output: self.result,
            transcript_file: None,
            duration_ms: self.duration_ms,
            total_cost_usd: self.total_cost_usd,
            session_id: self.session_id,
            num_turns: self.num_turns,
        }
    }
}

/// Parses a completed run's output: either a single `json` document or a
/// `stream-json` transcript whose last `result` event carries the outcome.
/// Unparseable output from a zero-exit run is treated as success.
fn parse_outcome(output: &str) -> AgentOutcome {
    if let Ok(payload) = serde_json::from_str::<ResultPayload>(output) {
        return payload.into_outcome();
    }

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(payload) = serde_json::from_str::<ResultPayload>(line) {
            if payload.kind == "result" {
                return payload.into_outcome();
            }
        }
    }

    warn!("no result payload found in claude output");
    AgentOutcome {
        success: true,
        output: output.to_string(),
        ..AgentOutcome::default()
    }
}

/// Pulls displayable text out of one `stream-json` event line.
fn extract_text_delta(line: &str) -> Option<String> {
    let event: serde_json::Value = serde_json::from_str(line).ok()?;
    if event.get("type")?.as_str()? != "stream_event" {
        return None;
    }
    let inner = event.get("event")?;
    if inner.get("type")?.as_str()? != "content_block_delta" {
        return None;
    }
    let delta = inner.get("delta")?;
    if delta.get("type")?.as_str()? != "text_delta" {
        return None;
    }
    delta.get("text")?.as_str().map(ToString::to_string)
}

/// Buffers streamed text deltas and emits complete lines.
#[derive(Default)]
struct LineAssembler {
    buf: String,
}

impl LineAssembler {
    fn push(&mut self, text: &str, mut emit: impl FnMut(&str)) {
        self.buf.push_str(text);
        while let Some(idx) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=idx).collect();
            let line = line.trim_end_matches('\n');
            if !line.is_empty() {
                emit(line);
            }
        }
    }

    fn finish(self, mut emit: impl FnMut(&str)) {
        if !self.buf.is_empty() {
            emit(&self.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_outcome_parses() {
        let payload = r#"{
            "type": "result",
            "result": "done",
            "is_error": false,
            "duration_ms": 1234,
            "total_cost_usd": 0.42,
            "session_id": "sess-1",
            "num_turns": 7
        }"#;

        let outcome = parse_outcome(payload);
        assert!(outcome.success);
        assert_eq!(outcome.output, "done");
        assert_eq!(outcome.duration_ms, Some(1234));
        assert_eq!(outcome.total_cost_usd, Some(0.42));
        assert_eq!(outcome.session_id.as_deref(), Some("sess-1"));
        assert_eq!(outcome.num_turns, Some(7));
    }

    #[test]
    fn stream_outcome_uses_result_event() {
        let transcript = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}}"#,
            "\n",
            r#"{"type":"result","result":"all fixed","is_error":false,"duration_ms":10}"#,
            "\n",
        );

        let outcome = parse_outcome(transcript);
        assert!(outcome.success);
        assert_eq!(outcome.output, "all fixed");
        assert_eq!(outcome.duration_ms, Some(10));
    }

    #[test]
    fn error_result_is_unsuccessful() {
        let outcome = parse_outcome(r#"{"type":"result","result":"boom","is_error":true}"#);
        assert!(!outcome.success);
        assert_eq!(outcome.output, "boom");
    }

    #[test]
    fn unparseable_output_falls_back_to_success() {
        let outcome = parse_outcome("plain text from an older CLI");
        assert!(outcome.success);
        assert_eq!(outcome.output, "plain text from an older CLI");
    }

    #[test]
    fn text_delta_extraction() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"hello"}}}"#;
        assert_eq!(extract_text_delta(line).as_deref(), Some("hello"));

        assert_eq!(extract_text_delta(r#"{"type":"result"}"#), None);
        assert_eq!(extract_text_delta("not json"), None);
    }

    #[test]
    fn line_assembler_emits_complete_lines() {
        let mut emitted = Vec::new();
        let mut assembler = LineAssembler::default();
        assembler.push("partial", |l| emitted.push(l.to_string()));
        assert!(emitted.is_empty());

        assembler.push(" line\nsecond\nthird part", |l| {
            emitted.push(l.to_string());
        });
        assert_eq!(emitted, vec!["partial line".to_string(), "second".to_string()]);

        assembler.finish(|l| emitted.push(l.to_string()));
        assert_eq!(emitted.last().map(String::as_str), Some("third part"));
    }
}

//! Tracking of live agent sessions.
//!
//! The daemon keeps one [`AgentSession`] per running agent invocation so
//! the status view can show what Claude is doing right now. Sessions are
//! created when an action starts the agent, fed output lines while it
//! runs, and deleted when it ends. Output is kept in a bounded ring so a
//! chatty session cannot grow memory without limit.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::snapshot::SessionStatus;

/// Maximum output lines retained per session.
pub const OUTPUT_RING_CAPACITY: usize = 1000;

/// Bounded line buffer; when full, the oldest line is dropped.
#[derive(Debug)]
pub struct OutputRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputRing {
    /// Creates a ring holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(128)),
            capacity,
        }
    }

    /// Appends a line, dropping the oldest when at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Copies the retained lines out, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::new(OUTPUT_RING_CAPACITY)
    }
}

/// One live agent invocation.
#[derive(Debug)]
pub struct AgentSession {
    /// Repository the session works on, `owner/name` form.
    pub repo: String,
    /// Pull request number.
    pub pr_number: u64,
    /// Action verb that started the session.
    pub action: String,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    started: Instant,
    output: Mutex<OutputRing>,
}

impl AgentSession {
    fn new(repo: String, pr_number: u64, action: String) -> Self {
        Self {
            repo,
            pr_number,
            action,
            started_at: Utc::now(),
            started: Instant::now(),
            output: Mutex::new(OutputRing::default()),
        }
    }

    /// Time the session has been running.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    fn push_output(&self, line: String) {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    fn output_copy(&self) -> Vec<String> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }
}

/// Registry of live agent sessions, keyed by worker key
/// (`owner/name#number`).
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
}

impl SessionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an agent invocation.
    pub fn start(&self, key: &str, repo: &str, pr_number: u64, action: &str) {
        let session = Arc::new(AgentSession::new(
            repo.to_string(),
            pr_number,
            action.to_string(),
        ));
        self.lock().insert(key.to_string(), session);
    }

    /// Appends an output line to a session, if it is still live.
    pub fn append_output(&self, key: &str, line: &str) {
        let session = self.lock().get(key).cloned();
        if let Some(session) = session {
            session.push_output(line.to_string());
        }
    }

    /// Records the end of an agent invocation.
    pub fn end(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies all live sessions out for the status view. The returned
    /// values share nothing with the tracker.
    #[must_use]
    pub fn status(&self) -> Vec<SessionStatus> {
        let sessions: Vec<Arc<AgentSession>> = self.lock().values().cloned().collect();
        let mut status: Vec<SessionStatus> = sessions
            .iter()
            .map(|s| SessionStatus {
                repo: s.repo.clone(),
                pr_number: s.pr_number,
                action: s.action.clone(),
                started_at: s.started_at,
                elapsed: s.elapsed(),
                output: s.output_copy(),
            })
            .collect();
        status.sort_by(|a, b| (&a.repo, a.pr_number).cmp(&(&b.repo, b.pr_number)));
        status
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AgentSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

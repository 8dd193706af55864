//! Copy-out status snapshot.
//!
//! A [`Snapshot`] is a point-in-time view of everything the daemon knows:
//! monitored repositories, their open pull requests, which have workers,
//! and the live agent sessions. Snapshots own all of their data; mutating
//! one is never observable by the daemon, so the status view needs no
//! locks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classify::StatusTag;

/// Point-in-time view of the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Monitored repositories, in configuration order.
    pub repos: Vec<RepoStatus>,
    /// Live agent sessions.
    pub claude_sessions: Vec<SessionStatus>,
    /// Total live workers across all repositories.
    pub worker_count: usize,
}

impl Snapshot {
    /// Total open pull requests across all repositories.
    #[must_use]
    pub fn pr_count(&self) -> usize {
        self.repos.iter().map(|r| r.prs.len()).sum()
    }
}

/// One monitored repository.
#[derive(Debug, Clone, Serialize)]
pub struct RepoStatus {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub name: String,
    /// Live workers on this repository.
    pub workers: usize,
    /// Open PRs suppressed by a blocking label.
    pub blocked_prs: usize,
    /// Open, non-blocked pull requests.
    pub prs: Vec<PrStatus>,
}

impl RepoStatus {
    /// `owner/name` form.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// One open pull request.
#[derive(Debug, Clone, Serialize)]
pub struct PrStatus {
    /// Pull request number.
    pub number: u64,
    /// Title.
    pub title: String,
    /// Author login.
    pub author: String,
    /// Status tags, most significant first.
    pub states: Vec<StatusTag>,
    /// Whether a worker is currently assigned.
    pub has_worker: bool,
}

/// One live agent session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Repository, `owner/name` form.
    pub repo: String,
    /// Pull request number.
    pub pr_number: u64,
    /// Action verb that started the session.
    pub action: String,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Time the session has been running.
    #[serde(skip)]
    pub elapsed: Duration,
    /// Tail of the session output.
    pub output: Vec<String>,
}

//! Forge-facing pull request data shapes.
//!
//! Everything here is rebuilt from the forge on every poll; nothing is
//! persisted. Wire values the classifier branches on are modeled as enums
//! with an explicit catch-all so unrecognized forge values degrade to a
//! conservative state instead of a parse failure.

use serde::{Deserialize, Serialize};

/// Whether the forge considers the head branch mergeable into base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mergeable {
    /// Merges cleanly.
    Mergeable,
    /// Has merge conflicts with base.
    Conflicting,
    /// The forge has not computed mergeability yet.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Forge merge-state summary for a pull request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeState {
    /// Nothing blocks the merge.
    Clean,
    /// Blocked by branch protection requirements.
    Blocked,
    /// Head branch is behind base.
    Behind,
    /// Merge commit cannot be created cleanly.
    Dirty,
    /// Pull request is a draft.
    Draft,
    /// Mergeable with passing hooks pending.
    HasHooks,
    /// Mergeable with non-passing commit status.
    Unstable,
    /// State not reported or not recognized.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Aggregate review decision reported by the forge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    /// Required reviews are approving.
    Approved,
    /// At least one reviewer requested changes.
    ChangesRequested,
    /// Required reviews are missing.
    ReviewRequired,
    /// The repository does not require reviews (reported as an empty
    /// string on the wire).
    #[default]
    #[serde(other)]
    Unspecified,
}

/// One entry of a pull request's check rollup.
///
/// Status and conclusion stay as the forge-reported strings: the check
/// vocabulary is open (check runs, legacy commit statuses, third party
/// apps), and only two predicates matter to the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    /// Check name or legacy status context.
    pub name: String,
    /// Lifecycle status (`QUEUED`, `IN_PROGRESS`, `COMPLETED`, or empty).
    pub status: String,
    /// Outcome (`success`, `failure`, empty while running, others possible).
    pub conclusion: String,
}

impl Check {
    /// A check failed.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.conclusion == "failure"
    }

    /// A check has not produced an outcome yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.conclusion.is_empty() && self.status != "COMPLETED"
    }
}

/// Point-in-time view of an open pull request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Pull request number.
    pub number: u64,
    /// Title.
    pub title: String,
    /// Head branch name.
    pub head_ref: String,
    /// Base branch name.
    pub base_ref: String,
    /// Web URL.
    pub url: String,
    /// Whether the pull request is a draft.
    pub is_draft: bool,
    /// Author login.
    pub author: String,
    /// Mergeability against base.
    pub mergeable: Mergeable,
    /// Merge-state summary.
    pub merge_state: MergeState,
    /// Aggregate review decision.
    pub review_decision: ReviewDecision,
    /// Label names, in forge order.
    pub labels: Vec<String>,
    /// Check rollup, in forge order.
    pub checks: Vec<Check>,
}

impl PullRequest {
    /// Any check in the rollup failed.
    #[must_use]
    pub fn has_failing_checks(&self) -> bool {
        self.checks.iter().any(Check::is_failing)
    }

    /// Any check in the rollup is still running or queued.
    #[must_use]
    pub fn has_pending_checks(&self) -> bool {
        self.checks.iter().any(Check::is_pending)
    }

    /// Names of all failing checks, in rollup order.
    #[must_use]
    pub fn failing_check_names(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.is_failing())
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// State of a submitted (or pending) pull request review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    /// Approving review.
    Approved,
    /// Review requesting changes.
    ChangesRequested,
    /// Comment-only review.
    Commented,
    /// Draft review, not submitted.
    Pending,
    /// Review was dismissed.
    Dismissed,
    /// State not recognized.
    #[serde(other)]
    Other,
}

impl ReviewState {
    /// Whether the review counts as submitted (pending and dismissed
    /// reviews do not).
    #[must_use]
    pub const fn is_submitted(self) -> bool {
        !matches!(self, Self::Pending | Self::Dismissed)
    }
}

/// A top-level pull request review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    /// Reviewer login.
    pub author: String,
    /// Review state.
    pub state: ReviewState,
}

/// One comment inside a review thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadComment {
    /// Comment author login.
    pub author: String,
    /// Comment body.
    pub body: String,
}

/// An inline review discussion thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewThread {
    /// Opaque forge thread identifier.
    pub id: String,
    /// Whether the thread has been resolved.
    pub is_resolved: bool,
    /// Whether the code the thread refers to has changed since.
    pub is_outdated: bool,
    /// File path the thread anchors to.
    pub path: String,
    /// Line the thread anchors to, when still known.
    pub line: Option<u64>,
    /// Comments in thread order.
    pub comments: Vec<ThreadComment>,
}

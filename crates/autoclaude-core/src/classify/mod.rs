//! Pure pull request classification.
//!
//! Maps a pull request's observable state to exactly one actionable state.
//! No I/O happens here; the daemon fetches, this module decides. Evaluation
//! order matters and is fixed: draft, conflicts, failing checks, pending
//! checks, Copilot review gate, merge-state fallthrough.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::RepoConfig;
use crate::forge::{
    MergeState, Mergeable, PullRequest, Review, ReviewDecision, ReviewState, ReviewThread,
};

/// Default identities Copilot reviews appear under.
const COPILOT_AUTHORS: [&str; 4] = [
    "Copilot",
    "copilot",
    "github-copilot[bot]",
    "copilot-pull-request-reviewer",
];

/// Default identities of the dependency-update bot whose PRs bypass the
/// Copilot review gate.
const RENOVATE_AUTHORS: [&str; 4] = ["renovate", "renovate[bot]", "renovate-bot", "app/renovate"];

/// The one actionable state a worker dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    /// Draft PR; nothing to do.
    Draft,
    /// Head branch conflicts with base.
    Conflicting,
    /// At least one check failed.
    ChecksFailing,
    /// Checks or required reviews are still in flight; wait.
    ChecksPending,
    /// Review feedback needs to be addressed.
    ReviewsPending,
    /// Nothing blocks a merge attempt.
    Ready,
}

impl PrState {
    /// Snake-case tag used in logs and snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Conflicting => "conflicting",
            Self::ChecksFailing => "checks_failing",
            Self::ChecksPending => "checks_pending",
            Self::ReviewsPending => "reviews_pending",
            Self::Ready => "ready",
        }
    }
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author identity sets the classifier needs: who counts as the Copilot
/// reviewer, and which automation authors bypass the review gate.
///
/// Deployment constants by default; a custom set can be injected where a
/// deployment uses different bot identities. Matching is case-sensitive.
#[derive(Debug, Clone)]
pub struct ReviewerIdentities {
    copilot: BTreeSet<String>,
    renovate: BTreeSet<String>,
}

impl Default for ReviewerIdentities {
    fn default() -> Self {
        Self {
            copilot: COPILOT_AUTHORS.iter().map(ToString::to_string).collect(),
            renovate: RENOVATE_AUTHORS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ReviewerIdentities {
    /// Builds custom identity sets.
    pub fn new<I, J>(copilot: I, renovate: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        Self {
            copilot: copilot.into_iter().collect(),
            renovate: renovate.into_iter().collect(),
        }
    }

    /// Whether `author` is the Copilot reviewer.
    #[must_use]
    pub fn is_copilot(&self, author: &str) -> bool {
        self.copilot.contains(author)
    }

    /// Whether `author` is the dependency-update bot.
    #[must_use]
    pub fn is_renovate(&self, author: &str) -> bool {
        self.renovate.contains(author)
    }
}

/// Classifies a pull request into its single actionable state.
///
/// `reviews` and `threads` are only consulted when the policy gates merges
/// on Copilot review and the author is not the dependency bot; callers may
/// pass empty slices otherwise.
#[must_use]
pub fn classify(
    pr: &PullRequest,
    reviews: &[Review],
    threads: &[ReviewThread],
    policy: &RepoConfig,
    identities: &ReviewerIdentities,
) -> PrState {
    if pr.is_draft {
        return PrState::Draft;
    }

    if pr.mergeable == Mergeable::Conflicting {
        return PrState::Conflicting;
    }

    if pr.has_failing_checks() {
        return PrState::ChecksFailing;
    }

    if pr.has_pending_checks() {
        return PrState::ChecksPending;
    }

    if policy.require_copilot_review && !identities.is_renovate(&pr.author) {
        let last_submitted = reviews
            .iter()
            .filter(|r| identities.is_copilot(&r.author) && r.state.is_submitted())
            .next_back();

        // No submitted Copilot review yet: treat like a pending check and
        // wait for the reviewer to show up.
        let Some(last) = last_submitted else {
            return PrState::ChecksPending;
        };

        if has_unresolved_copilot_thread(threads, identities)
            || last.state != ReviewState::Approved
        {
            return PrState::ReviewsPending;
        }

        if pr.review_decision != ReviewDecision::Approved {
            return PrState::ReviewsPending;
        }
    }

    // BEHIND falls through to ready: the merge attempt triggers a
    // forge-side branch update.
    if pr.merge_state == MergeState::Behind {
        return PrState::Ready;
    }

    if pr.merge_state != MergeState::Clean {
        return PrState::ChecksPending;
    }

    PrState::Ready
}

/// Whether any live (unresolved, not outdated) thread contains a Copilot
/// comment.
#[must_use]
pub fn has_unresolved_copilot_thread(
    threads: &[ReviewThread],
    identities: &ReviewerIdentities,
) -> bool {
    threads.iter().any(|t| {
        !t.is_resolved && !t.is_outdated && t.comments.iter().any(|c| identities.is_copilot(&c.author))
    })
}

/// IDs of all live Copilot threads, in thread order.
#[must_use]
pub fn unresolved_copilot_thread_ids(
    threads: &[ReviewThread],
    identities: &ReviewerIdentities,
) -> Vec<String> {
    threads
        .iter()
        .filter(|t| {
            !t.is_resolved
                && !t.is_outdated
                && t.comments.iter().any(|c| identities.is_copilot(&c.author))
        })
        .map(|t| t.id.clone())
        .collect()
}

/// Descriptive status tags for the status view. Unlike [`classify`], a PR
/// can carry several tags at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTag {
    /// Draft PR.
    Draft,
    /// Conflicts with base.
    Conflicting,
    /// Failing checks.
    ChecksFailing,
    /// Checks in flight.
    ChecksPending,
    /// Waiting for a Copilot review.
    CopilotPending,
    /// Copilot threads being addressed.
    FixingReviews,
    /// Human review outstanding.
    ReviewsPending,
    /// Nothing blocking.
    Ready,
}

impl StatusTag {
    /// Snake-case tag string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Conflicting => "conflicting",
            Self::ChecksFailing => "checks_failing",
            Self::ChecksPending => "checks_pending",
            Self::CopilotPending => "copilot_pending",
            Self::FixingReviews => "fixing_reviews",
            Self::ReviewsPending => "reviews_pending",
            Self::Ready => "ready",
        }
    }
}

impl std::fmt::Display for StatusTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives the status-view tags for a PR from its snapshot plus the cached
/// Copilot review flags.
#[must_use]
pub fn status_tags(
    pr: &PullRequest,
    require_copilot: bool,
    has_copilot_review: bool,
    has_unresolved_copilot: bool,
) -> Vec<StatusTag> {
    if pr.is_draft {
        return vec![StatusTag::Draft];
    }

    let mut tags = Vec::new();

    if pr.mergeable == Mergeable::Conflicting {
        tags.push(StatusTag::Conflicting);
    }
    if pr.has_failing_checks() {
        tags.push(StatusTag::ChecksFailing);
    }
    if pr.has_pending_checks() {
        tags.push(StatusTag::ChecksPending);
    }

    if require_copilot {
        if !has_copilot_review {
            tags.push(StatusTag::CopilotPending);
        } else if has_unresolved_copilot {
            tags.push(StatusTag::FixingReviews);
        }
    }

    if pr.review_decision != ReviewDecision::Unspecified
        && pr.review_decision != ReviewDecision::Approved
    {
        tags.push(StatusTag::ReviewsPending);
    }

    if tags.is_empty() {
        tags.push(StatusTag::Ready);
    }

    tags
}

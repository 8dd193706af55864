//! Forge capability boundary.
//!
//! The daemon depends only on the [`Forge`] trait; the [`gh`] submodule
//! provides the GitHub implementation backed by the `gh` CLI. Nothing
//! outside that submodule encodes wire-level forge specifics.

use async_trait::async_trait;
use thiserror::Error;

pub mod gh;
pub mod types;

pub use types::{
    Check, MergeState, Mergeable, PullRequest, Review, ReviewDecision, ReviewState, ReviewThread,
    ThreadComment,
};

use crate::config::MergeMethod;

/// Merge rejection message the forge emits when base moved under the PR.
const BASE_BRANCH_MODIFIED: &str = "Base branch was modified";

/// Errors emitted by forge providers.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// The forge CLI could not be spawned.
    #[error("spawn {command}: {source}")]
    Spawn {
        /// Command line that failed to start.
        command: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The forge CLI exited unsuccessfully.
    #[error("{command}: exit status {status:?}\n{output}")]
    Command {
        /// Command line that failed.
        command: String,
        /// Exit status code, if the process was not killed by a signal.
        status: Option<i32>,
        /// Captured stderr/stdout.
        output: String,
    },

    /// A forge payload could not be decoded.
    #[error("parse {context}: {source}")]
    Parse {
        /// What was being decoded.
        context: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A forge payload decoded but lacked required data.
    #[error("{0}")]
    Payload(String),
}

impl ForgeError {
    /// Whether this error is the forge rejecting a merge because the base
    /// branch moved since checks ran. Recoverable by updating the branch.
    #[must_use]
    pub fn is_base_branch_modified(&self) -> bool {
        match self {
            Self::Command { output, .. } => output.contains(BASE_BRANCH_MODIFIED),
            _ => false,
        }
    }
}

/// Operations the orchestration engine needs from a code forge.
#[async_trait]
pub trait Forge: Send + Sync {
    /// Lists open pull requests for a repository (bounded, up to 100).
    ///
    /// # Errors
    ///
    /// Returns an error when the listing cannot be fetched or decoded.
    async fn list_open_prs(&self, owner: &str, name: &str)
    -> Result<Vec<PullRequest>, ForgeError>;

    /// Fetches the current state of one pull request.
    ///
    /// # Errors
    ///
    /// Returns an error when the pull request cannot be fetched or decoded.
    async fn pr_detail(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<PullRequest, ForgeError>;

    /// Fetches top-level reviews for a pull request.
    ///
    /// # Errors
    ///
    /// Returns an error when reviews cannot be fetched or decoded.
    async fn reviews(&self, owner: &str, name: &str, number: u64)
    -> Result<Vec<Review>, ForgeError>;

    /// Fetches all review threads for a pull request, following pagination.
    ///
    /// # Errors
    ///
    /// Returns an error when any page cannot be fetched or decoded.
    async fn review_threads(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<Vec<ReviewThread>, ForgeError>;

    /// Marks one review thread resolved.
    ///
    /// # Errors
    ///
    /// Returns an error when the mutation fails.
    async fn resolve_review_thread(&self, thread_id: &str) -> Result<(), ForgeError>;

    /// Asks the forge to update the PR branch onto its base.
    ///
    /// # Errors
    ///
    /// Returns an error when the update cannot be requested.
    async fn update_branch(&self, owner: &str, name: &str, number: u64) -> Result<(), ForgeError>;

    /// Merges a pull request with the given method.
    ///
    /// # Errors
    ///
    /// Returns an error when the merge is rejected; see
    /// [`ForgeError::is_base_branch_modified`] for the recoverable case.
    async fn merge_pr(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        method: MergeMethod,
    ) -> Result<(), ForgeError>;

    /// Posts a comment on a pull request.
    ///
    /// # Errors
    ///
    /// Returns an error when the comment cannot be posted.
    async fn post_comment(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ForgeError>;
}

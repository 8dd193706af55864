//! Per-PR worker.
//!
//! A worker advances one pull request by at most one action, then exits:
//! it acquires a worktree, refreshes the PR from the forge, classifies it,
//! dispatches the matching action, and releases the worktree. The daemon
//! re-evaluates on the next poll, so the worker never sleeps and carries
//! no retry budget of its own.
//!
//! Cancellation is cooperative: every external await races the worker's
//! cancellation token, and dropping an in-flight subprocess future kills
//! the child. Worktree removal runs after the action settles (success,
//! error, panic, or cancellation) on a timeout-bounded path that the
//! token cannot interrupt.

mod actions;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autoclaude_core::agent::{AgentError, AgentRunner};
use autoclaude_core::classify::{
    PrState, ReviewerIdentities, classify, has_unresolved_copilot_thread,
};
use autoclaude_core::config::RepoConfig;
use autoclaude_core::forge::{Forge, ForgeError, PullRequest, Review, ReviewThread};
use autoclaude_core::session::SessionTracker;
use autoclaude_core::workspace::{GitError, Workspace};
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::daemon::worker_key;

/// Transient forge failures tolerated while refreshing PR state before
/// the worker gives up and defers to the next poll.
const MAX_REFRESH_FAILURES: u32 = 3;

/// Upper bound on deferred worktree removal.
const WORKTREE_REMOVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors a worker run can end with.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker's cancellation token fired.
    #[error("worker cancelled")]
    Cancelled,

    /// A forge operation failed.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// A git or filesystem operation failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// The agent could not be executed.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// The agent ran but reported failure.
    #[error("agent failed during {action}:\n{output_tail}")]
    AgentFailed {
        /// Action that invoked the agent.
        action: &'static str,
        /// Tail of the captured agent output.
        output_tail: String,
    },

    /// The agent reported success but committed nothing.
    #[error("agent produced no commits during {action}")]
    NoCommitsProduced {
        /// Action that invoked the agent.
        action: &'static str,
    },

    /// The worker body panicked; recovered at the worker boundary.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Shared collaborators a worker needs, all injected by the daemon.
#[derive(Clone)]
pub struct WorkerContext {
    /// Forge capability.
    pub forge: Arc<dyn Forge>,
    /// Agent runner capability.
    pub agent: Arc<dyn AgentRunner>,
    /// Git workspace capability.
    pub workspace: Arc<dyn Workspace>,
    /// Reviewer identity sets.
    pub identities: Arc<ReviewerIdentities>,
    /// Live agent session registry.
    pub sessions: Arc<SessionTracker>,
    /// PRs that already received a review request comment this run.
    pub review_requested: Arc<Mutex<HashSet<String>>>,
}

/// Advances a single pull request by at most one action.
pub struct Worker {
    repo: RepoConfig,
    pr: PullRequest,
    key: String,
    ctx: WorkerContext,
    reviews: Vec<Review>,
    threads: Vec<ReviewThread>,
}

impl Worker {
    /// Creates a worker for one pull request.
    #[must_use]
    pub fn new(repo: RepoConfig, pr: PullRequest, ctx: WorkerContext) -> Self {
        let key = worker_key(&repo.owner, &repo.name, pr.number);
        Self {
            repo,
            pr,
            key,
            ctx,
            reviews: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// Runs the worker to completion.
    ///
    /// The created worktree is removed on every exit path, including
    /// cancellation and panic.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Cancelled`] when the token fires, or the
    /// error of whichever step failed. Errors are terminal for this run;
    /// the next poll starts fresh.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!(
            key = %self.key,
            title = %self.pr.title,
            head = %self.pr.head_ref,
            "worker started"
        );

        cancellable(
            &cancel,
            self.ctx.workspace.ensure_clone(&self.repo.owner, &self.repo.name),
        )
        .await??;

        let worktree = cancellable(
            &cancel,
            self.ctx.workspace.add_worktree(
                &self.repo.owner,
                &self.repo.name,
                &self.pr.head_ref,
                self.pr.number,
            ),
        )
        .await??;

        let outcome = AssertUnwindSafe(self.advance(&worktree, &cancel))
            .catch_unwind()
            .await;

        let removal =
            self.ctx
                .workspace
                .remove_worktree(&self.repo.owner, &self.repo.name, self.pr.number);
        if tokio::time::timeout(WORKTREE_REMOVAL_TIMEOUT, removal)
            .await
            .is_err()
        {
            warn!(key = %self.key, "worktree removal timed out");
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => Err(WorkerError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Refreshes PR state and dispatches exactly one action.
    async fn advance(
        &mut self,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut refresh_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }

            let detail = cancellable(
                cancel,
                self.ctx
                    .forge
                    .pr_detail(&self.repo.owner, &self.repo.name, self.pr.number),
            )
            .await?;
            match detail {
                Ok(pr) => self.pr = pr,
                Err(err) => {
                    refresh_failures += 1;
                    warn!(key = %self.key, %err, attempts = refresh_failures, "failed to get PR detail");
                    if refresh_failures >= MAX_REFRESH_FAILURES {
                        return Err(err.into());
                    }
                    continue;
                },
            }

            if self.repo.require_copilot_review && !self.ctx.identities.is_renovate(&self.pr.author)
            {
                let fetched = cancellable(cancel, self.fetch_review_state()).await?;
                if let Err(err) = fetched {
                    refresh_failures += 1;
                    warn!(key = %self.key, %err, attempts = refresh_failures, "failed to get review state");
                    if refresh_failures >= MAX_REFRESH_FAILURES {
                        return Err(err.into());
                    }
                    continue;
                }
            } else {
                self.reviews.clear();
                self.threads.clear();
            }

            let state = classify(
                &self.pr,
                &self.reviews,
                &self.threads,
                &self.repo,
                &self.ctx.identities,
            );
            info!(key = %self.key, state = %state, "evaluated state");

            return match state {
                PrState::Draft => {
                    info!(key = %self.key, "PR is draft, deferring");
                    Ok(())
                },
                PrState::ChecksPending => {
                    info!(key = %self.key, "checks pending, deferring");
                    Ok(())
                },
                PrState::Conflicting => self.resolve_conflicts(worktree, cancel).await,
                PrState::ChecksFailing => self.fix_checks(worktree, cancel).await,
                PrState::ReviewsPending => {
                    if has_unresolved_copilot_thread(&self.threads, &self.ctx.identities) {
                        self.fix_reviews(worktree, cancel).await
                    } else {
                        self.request_review(cancel).await
                    }
                },
                PrState::Ready => self.merge(cancel).await,
            };
        }
    }

    /// Fetches submitted reviews, and review threads when a submitted
    /// Copilot review exists. Caches both for the classifier and actions.
    async fn fetch_review_state(&mut self) -> Result<(), ForgeError> {
        let reviews = self
            .ctx
            .forge
            .reviews(&self.repo.owner, &self.repo.name, self.pr.number)
            .await?;

        let has_copilot_review = reviews
            .iter()
            .any(|r| self.ctx.identities.is_copilot(&r.author) && r.state.is_submitted());

        let threads = if has_copilot_review {
            self.ctx
                .forge
                .review_threads(&self.repo.owner, &self.repo.name, self.pr.number)
                .await?
        } else {
            Vec::new()
        };

        self.reviews = reviews;
        self.threads = threads;
        Ok(())
    }
}

/// Races a future against the cancellation token. Dropping the losing
/// future kills any subprocess it spawned (`kill_on_drop`).
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, WorkerError> {
    tokio::select! {
        () = cancel.cancelled() => Err(WorkerError::Cancelled),
        value = fut => Ok(value),
    }
}

/// Renders a panic payload for the log.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

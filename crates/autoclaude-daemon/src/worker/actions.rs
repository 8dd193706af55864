//! Worker actions.
//!
//! The three mutating actions share one shape: fetch, run the agent in
//! the worktree, verify it committed, push. `merge` and `request_review`
//! talk only to the forge.

use std::path::Path;
use std::sync::{Arc, PoisonError};

use autoclaude_core::agent::{AgentOutcome, OutputCallback};
use autoclaude_core::classify::unresolved_copilot_thread_ids;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Worker, WorkerError, cancellable};

/// Lines of agent output kept in an `agent_failed` error.
const FAILURE_TAIL_LINES: usize = 20;

/// The action verbs shown in logs and the session tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    ResolveConflicts,
    FixChecks,
    FixReviews,
}

impl Action {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ResolveConflicts => "resolve_conflicts",
            Self::FixChecks => "fix_checks",
            Self::FixReviews => "fix_reviews",
        }
    }
}

/// What to hand the agent runner.
enum Invocation {
    Prompt(String),
    Command {
        name: &'static str,
        args: Vec<String>,
    },
}

impl Worker {
    /// Resolves merge conflicts against the base branch.
    pub(super) async fn resolve_conflicts(
        &self,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        info!(key = %self.key, "resolving merge conflicts");

        cancellable(cancel, self.ctx.workspace.fetch(worktree)).await??;

        let base = &self.repo.base_branch;
        let prompt = format!(
            "This branch has conflicts with {base}. Run `git merge origin/{base}`, \
             resolve all conflicts, commit with -s -S flags, and push."
        );
        self.run_agent(worktree, Action::ResolveConflicts, Invocation::Prompt(prompt), cancel)
            .await?;

        self.verify_and_push(worktree, Action::ResolveConflicts, cancel)
            .await?;

        info!(key = %self.key, "conflicts resolved and pushed");
        Ok(())
    }

    /// Fixes failing CI checks.
    pub(super) async fn fix_checks(
        &self,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let failing = self.pr.failing_check_names().join(", ");
        info!(key = %self.key, checks = %failing, "fixing failing checks");

        cancellable(cancel, self.ctx.workspace.fetch(worktree)).await??;

        let prompt = format!(
            "CI checks failing: {failing}. Investigate failures, fix code, commit with \
             -s -S flags, run tests locally to verify, and push."
        );
        self.run_agent(worktree, Action::FixChecks, Invocation::Prompt(prompt), cancel)
            .await?;

        self.verify_and_push(worktree, Action::FixChecks, cancel)
            .await?;

        info!(key = %self.key, "checks fixed and pushed");
        Ok(())
    }

    /// Addresses unresolved Copilot review threads, then resolves each
    /// thread that was captured before the agent ran.
    pub(super) async fn fix_reviews(
        &self,
        worktree: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let thread_ids = unresolved_copilot_thread_ids(&self.threads, &self.ctx.identities);
        if thread_ids.is_empty() {
            info!(key = %self.key, "no unresolved copilot threads found");
            return Ok(());
        }
        info!(key = %self.key, count = thread_ids.len(), "fixing review comments");

        cancellable(cancel, self.ctx.workspace.fetch(worktree)).await??;

        self.run_agent(
            worktree,
            Action::FixReviews,
            Invocation::Command {
                name: "fix-review-auto",
                args: vec![self.pr.url.clone()],
            },
            cancel,
        )
        .await?;

        self.verify_and_push(worktree, Action::FixReviews, cancel)
            .await?;

        info!(key = %self.key, count = thread_ids.len(), "resolving copilot review threads");
        for thread_id in &thread_ids {
            let resolved =
                cancellable(cancel, self.ctx.forge.resolve_review_thread(thread_id)).await?;
            if let Err(err) = resolved {
                error!(key = %self.key, thread_id = %thread_id, %err, "failed to resolve thread");
            }
        }

        info!(key = %self.key, "reviews fixed, pushed, and resolved");
        Ok(())
    }

    /// Posts the policy-configured review request comment, once per PR
    /// per daemon run. A no-op when the policy does not configure it.
    pub(super) async fn request_review(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let Some(comment) = &self.repo.review_request_comment else {
            return Ok(());
        };
        if !comment.enabled {
            return Ok(());
        }

        let already_requested = self
            .ctx
            .review_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&self.key);
        if already_requested {
            return Ok(());
        }

        info!(key = %self.key, "posting review request comment");
        cancellable(
            cancel,
            self.ctx.forge.post_comment(
                &self.repo.owner,
                &self.repo.name,
                self.pr.number,
                &comment.message,
            ),
        )
        .await??;

        self.ctx
            .review_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.key.clone());
        Ok(())
    }

    /// Merges the pull request. A "base branch was modified" rejection is
    /// recovered by asking the forge to update the branch; the next poll
    /// retries the merge once checks clear.
    pub(super) async fn merge(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        info!(key = %self.key, "PR ready to merge");

        let merged = cancellable(
            cancel,
            self.ctx.forge.merge_pr(
                &self.repo.owner,
                &self.repo.name,
                self.pr.number,
                self.repo.merge_method,
            ),
        )
        .await?;

        match merged {
            Ok(()) => {
                info!(key = %self.key, "PR merged successfully");
                Ok(())
            },
            Err(err) if err.is_base_branch_modified() => {
                info!(key = %self.key, "base branch modified, updating PR branch");
                cancellable(
                    cancel,
                    self.ctx
                        .forge
                        .update_branch(&self.repo.owner, &self.repo.name, self.pr.number),
                )
                .await??;
                info!(key = %self.key, "PR branch updated, will retry merge next poll");
                Ok(())
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Runs the agent with session tracking and streamed output, and
    /// classifies an unsuccessful session as `agent_failed`.
    async fn run_agent(
        &self,
        worktree: &Path,
        action: Action,
        invocation: Invocation,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, WorkerError> {
        self.ctx.sessions.start(
            &self.key,
            &self.repo.full_name(),
            self.pr.number,
            action.as_str(),
        );

        let callback: OutputCallback = {
            let sessions = Arc::clone(&self.ctx.sessions);
            let key = self.key.clone();
            Arc::new(move |line: &str| sessions.append_output(&key, line))
        };

        let run = async {
            match invocation {
                Invocation::Prompt(prompt) => {
                    self.ctx.agent.run(worktree, &prompt, Some(callback)).await
                },
                Invocation::Command { name, args } => {
                    self.ctx
                        .agent
                        .run_command(worktree, name, &args, Some(callback))
                        .await
                },
            }
        };
        let result = cancellable(cancel, run).await;
        self.ctx.sessions.end(&self.key);

        let outcome = result??;
        if !outcome.success {
            return Err(WorkerError::AgentFailed {
                action: action.as_str(),
                output_tail: outcome.output_tail(FAILURE_TAIL_LINES),
            });
        }
        Ok(outcome)
    }

    /// Verifies the agent committed against the last fetched origin ref,
    /// then pushes the branch. Pushing is idempotent when the agent
    /// already pushed itself.
    async fn verify_and_push(
        &self,
        worktree: &Path,
        action: Action,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let has_commits = cancellable(
            cancel,
            self.ctx
                .workspace
                .has_unpushed_commits(worktree, &self.pr.head_ref),
        )
        .await??;

        if !has_commits {
            warn!(key = %self.key, action = action.as_str(), "agent completed without producing commits");
            return Err(WorkerError::NoCommitsProduced {
                action: action.as_str(),
            });
        }

        cancellable(cancel, self.ctx.workspace.push(worktree, &self.pr.head_ref)).await??;
        Ok(())
    }
}

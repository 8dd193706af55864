//! Daemon scheduling tests: worker reconciliation, the concurrency cap,
//! skip rules, cache semantics, and the copy-out snapshot.

mod common;

use std::sync::Arc;

use autoclaude_core::classify::{ReviewerIdentities, StatusTag};
use autoclaude_core::config::Config;
use autoclaude_core::forge::ReviewState;
use autoclaude_daemon::{Daemon, worker_key};
use common::{Harness, config_with, copilot_review, ready_pr, repo_config};
use tokio_util::sync::CancellationToken;

fn daemon_with(harness: &Harness, config: Config) -> Arc<Daemon> {
    let forge: Arc<dyn autoclaude_core::forge::Forge> =
        Arc::clone(&harness.forge) as Arc<dyn autoclaude_core::forge::Forge>;
    let agent: Arc<dyn autoclaude_core::agent::AgentRunner> =
        Arc::clone(&harness.agent) as Arc<dyn autoclaude_core::agent::AgentRunner>;
    let workspace: Arc<dyn autoclaude_core::workspace::Workspace> =
        Arc::clone(&harness.workspace) as Arc<dyn autoclaude_core::workspace::Workspace>;
    Arc::new(Daemon::new(
        Arc::new(config),
        forge,
        agent,
        workspace,
        Arc::new(ReviewerIdentities::default()),
    ))
}

fn stage_open_prs(harness: &Harness, prs: Vec<autoclaude_core::forge::PullRequest>) {
    common::lock(&harness.forge.state)
        .open_prs
        .insert("acme/api".to_string(), prs);
}

#[tokio::test]
async fn ready_pr_is_merged_and_disappears_next_poll() {
    let harness = Harness::new();
    stage_open_prs(&harness, vec![ready_pr(42)]);

    let daemon = daemon_with(&harness, config_with(vec![repo_config(false)]));
    let shutdown = CancellationToken::new();

    daemon.poll(&shutdown).await;
    common::wait_until(|| daemon.worker_count() == 0).await;

    {
        let forge = common::lock(&harness.forge.state);
        assert_eq!(forge.merged, vec!["acme/api#42".to_string()]);
    }
    {
        let calls = common::lock(&harness.workspace.calls);
        assert_eq!(calls.worktrees_removed, vec!["acme/api#42".to_string()]);
    }

    // Next poll: the merged PR is gone from the open list.
    stage_open_prs(&harness, Vec::new());
    daemon.poll(&shutdown).await;
    assert_eq!(daemon.worker_count(), 0);
    assert_eq!(daemon.snapshot().pr_count(), 0);
}

#[tokio::test]
async fn per_repo_concurrency_cap_is_enforced() {
    let harness = Harness::new();
    let prs: Vec<_> = (1..=5).map(ready_pr).collect();
    {
        let mut forge = common::lock(&harness.forge.state);
        for pr in &prs {
            forge.detail_hangs.insert(worker_key("acme", "api", pr.number));
        }
    }
    stage_open_prs(&harness, prs);

    let mut repo = repo_config(false);
    repo.max_concurrent_prs = 2;
    let daemon = daemon_with(&harness, config_with(vec![repo]));
    let shutdown = CancellationToken::new();

    daemon.poll(&shutdown).await;
    assert_eq!(daemon.worker_count(), 2);

    // Re-polling spawns no duplicates for PRs that already have workers.
    daemon.poll(&shutdown).await;
    assert_eq!(daemon.worker_count(), 2);

    shutdown.cancel();
    common::wait_until(|| daemon.worker_count() == 0).await;
}

#[tokio::test]
async fn excluded_draft_and_blocked_prs_get_no_worker() {
    let harness = Harness::new();

    let mut excluded = ready_pr(1);
    excluded.author = "dependabot".to_string();
    let mut draft = ready_pr(2);
    draft.is_draft = true;
    let mut blocked = ready_pr(3);
    blocked.labels = vec!["on-hold".to_string()];

    stage_open_prs(&harness, vec![excluded, draft, blocked]);

    let mut repo = repo_config(false);
    repo.exclude_authors = vec!["dependabot".to_string()];
    let daemon = daemon_with(&harness, config_with(vec![repo]));

    daemon.poll(&CancellationToken::new()).await;
    assert_eq!(daemon.worker_count(), 0);

    let snapshot = daemon.snapshot();
    // Blocked PRs are counted, not listed.
    assert_eq!(snapshot.repos[0].blocked_prs, 1);
    assert_eq!(snapshot.repos[0].prs.len(), 2);
}

#[tokio::test]
async fn closed_pr_cancels_its_worker() {
    let harness = Harness::new();
    common::lock(&harness.forge.state)
        .detail_hangs
        .insert(worker_key("acme", "api", 42));
    stage_open_prs(&harness, vec![ready_pr(42)]);

    let daemon = daemon_with(&harness, config_with(vec![repo_config(false)]));
    let shutdown = CancellationToken::new();

    daemon.poll(&shutdown).await;
    common::wait_until(|| daemon.worker_count() == 1).await;

    // The PR disappears between polls.
    stage_open_prs(&harness, Vec::new());
    daemon.poll(&shutdown).await;
    common::wait_until(|| daemon.worker_count() == 0).await;

    // The cancelled worker still runs its deferred worktree cleanup.
    common::wait_until(|| {
        common::lock(&harness.workspace.calls).worktrees_removed.len() == 1
    })
    .await;

    let forge = common::lock(&harness.forge.state);
    assert!(forge.merged.is_empty());
    let calls = common::lock(&harness.workspace.calls);
    assert_eq!(calls.worktrees_removed, vec!["acme/api#42".to_string()]);
}

#[tokio::test]
async fn copilot_prefetch_error_preserves_previous_flags() {
    let harness = Harness::new();
    let key = worker_key("acme", "api", 42);

    // Keep the PR away from workers so only the cache is exercised.
    let mut pr = ready_pr(42);
    pr.author = "dependabot".to_string();
    pr.review_decision = autoclaude_core::forge::ReviewDecision::Unspecified;
    stage_open_prs(&harness, vec![pr]);

    let mut repo = repo_config(true);
    repo.exclude_authors = vec!["dependabot".to_string()];
    let daemon = daemon_with(&harness, config_with(vec![repo]));
    let shutdown = CancellationToken::new();

    // First poll: the prefetch fails, so no flag is cached and the PR
    // reads as waiting for Copilot.
    common::lock(&harness.forge.state).reviews_fail.insert(key.clone());
    daemon.poll(&shutdown).await;
    let states = daemon.snapshot().repos[0].prs[0].states.clone();
    assert_eq!(states, vec![StatusTag::CopilotPending]);

    // Second poll: the prefetch succeeds and records the review.
    {
        let mut forge = common::lock(&harness.forge.state);
        forge.reviews_fail.clear();
        forge
            .reviews
            .insert(key.clone(), vec![copilot_review(ReviewState::Approved)]);
    }
    daemon.poll(&shutdown).await;
    let states = daemon.snapshot().repos[0].prs[0].states.clone();
    assert_eq!(states, vec![StatusTag::Ready]);

    // Third poll: the prefetch fails again; the cached flag survives
    // instead of resetting to "no review".
    common::lock(&harness.forge.state).reviews_fail.insert(key);
    daemon.poll(&shutdown).await;
    let states = daemon.snapshot().repos[0].prs[0].states.clone();
    assert_eq!(states, vec![StatusTag::Ready]);
}

#[tokio::test]
async fn snapshot_is_a_pure_copy() {
    let harness = Harness::new();
    stage_open_prs(&harness, vec![ready_pr(42)]);
    // Hold the worker so the snapshot sees it.
    common::lock(&harness.forge.state)
        .detail_hangs
        .insert(worker_key("acme", "api", 42));

    let daemon = daemon_with(&harness, config_with(vec![repo_config(false)]));
    let shutdown = CancellationToken::new();
    daemon.poll(&shutdown).await;

    let mut snapshot = daemon.snapshot();
    assert_eq!(snapshot.worker_count, 1);
    assert!(snapshot.repos[0].prs[0].has_worker);

    // Mutating the returned snapshot is never observable by the daemon.
    snapshot.repos.clear();
    snapshot.worker_count = 99;

    let fresh = daemon.snapshot();
    assert_eq!(fresh.repos.len(), 1);
    assert_eq!(fresh.worker_count, 1);
    assert_eq!(fresh.repos[0].prs[0].number, 42);

    shutdown.cancel();
    common::wait_until(|| daemon.worker_count() == 0).await;
}

#[tokio::test]
async fn repos_poll_independently_on_forge_failure() {
    let harness = Harness::new();
    // Listing the first repo fails; the second repo still polls and its
    // ready PR merges.
    let mut other = repo_config(false);
    other.name = "web".to_string();
    {
        let mut forge = common::lock(&harness.forge.state);
        forge.list_fails.insert("acme/api".to_string());
        forge
            .open_prs
            .insert("acme/web".to_string(), vec![ready_pr(7)]);
    }

    let daemon = daemon_with(&harness, config_with(vec![repo_config(false), other]));
    daemon.poll(&CancellationToken::new()).await;
    common::wait_until(|| daemon.worker_count() == 0).await;

    let forge = common::lock(&harness.forge.state);
    assert_eq!(forge.merged, vec!["acme/web#7".to_string()]);
}

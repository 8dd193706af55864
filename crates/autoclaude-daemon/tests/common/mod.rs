#![allow(dead_code)] // Not every test binary uses every helper.
//! Mock collaborators for daemon and worker tests.
//!
//! Each mock records the calls it receives behind a mutex and serves
//! scripted responses, so tests can drive the orchestration engine
//! end-to-end without a forge, an agent CLI, or git.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use autoclaude_core::agent::{AgentError, AgentOutcome, AgentRunner, OutputCallback};
use autoclaude_core::config::{Config, MergeMethod, RepoConfig};
use autoclaude_core::forge::{Forge, ForgeError, PullRequest, Review, ReviewThread};
use autoclaude_core::workspace::{GitError, Workspace};
use autoclaude_daemon::worker_key;

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Repository policy used by most tests.
pub fn repo_config(require_copilot_review: bool) -> RepoConfig {
    RepoConfig {
        owner: "acme".to_string(),
        name: "api".to_string(),
        base_branch: "main".to_string(),
        exclude_authors: Vec::new(),
        merge_method: MergeMethod::Squash,
        max_concurrent_prs: 3,
        require_copilot_review,
        review_request_comment: None,
    }
}

pub fn config_with(repos: Vec<RepoConfig>) -> Config {
    Config {
        repos,
        ..Config::default()
    }
}

/// A clean, approved, mergeable pull request.
pub fn ready_pr(number: u64) -> PullRequest {
    use autoclaude_core::forge::{Check, MergeState, Mergeable, ReviewDecision};

    PullRequest {
        number,
        title: format!("change #{number}"),
        head_ref: format!("feature/{number}"),
        base_ref: "main".to_string(),
        url: format!("https://github.com/acme/api/pull/{number}"),
        is_draft: false,
        author: "octocat".to_string(),
        mergeable: Mergeable::Mergeable,
        merge_state: MergeState::Clean,
        review_decision: ReviewDecision::Approved,
        labels: Vec::new(),
        checks: vec![Check {
            name: "ci".to_string(),
            status: "COMPLETED".to_string(),
            conclusion: "success".to_string(),
        }],
    }
}

#[derive(Default)]
pub struct ForgeState {
    /// Open PRs per `owner/name`.
    pub open_prs: HashMap<String, Vec<PullRequest>>,
    /// Repositories (`owner/name`) whose listing fails.
    pub list_fails: HashSet<String>,
    /// PR detail per worker key; falls back to the open list.
    pub details: HashMap<String, PullRequest>,
    /// Worker keys whose `pr_detail` never completes.
    pub detail_hangs: HashSet<String>,
    /// Reviews per worker key.
    pub reviews: HashMap<String, Vec<Review>>,
    /// Worker keys whose `reviews` call fails.
    pub reviews_fail: HashSet<String>,
    /// Review threads per worker key.
    pub threads: HashMap<String, Vec<ReviewThread>>,
    /// Merge rejection output per worker key; consumed on first use.
    pub merge_rejections: HashMap<String, String>,
    /// Worker keys merged, in order.
    pub merged: Vec<String>,
    /// Thread ids resolved, in order.
    pub resolved_threads: Vec<String>,
    /// Worker keys whose branch was updated.
    pub updated_branches: Vec<String>,
    /// `(worker key, body)` of posted comments.
    pub comments: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MockForge {
    pub state: Mutex<ForgeState>,
}

impl MockForge {
    pub fn command_error(output: &str) -> ForgeError {
        ForgeError::Command {
            command: "gh".to_string(),
            status: Some(1),
            output: output.to_string(),
        }
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn list_open_prs(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<PullRequest>, ForgeError> {
        let key = format!("{owner}/{name}");
        let state = lock(&self.state);
        if state.list_fails.contains(&key) {
            return Err(Self::command_error("api unavailable"));
        }
        Ok(state.open_prs.get(&key).cloned().unwrap_or_default())
    }

    async fn pr_detail(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<PullRequest, ForgeError> {
        let key = worker_key(owner, name, number);
        let hang = lock(&self.state).detail_hangs.contains(&key);
        if hang {
            std::future::pending::<()>().await;
        }

        let state = lock(&self.state);
        if let Some(pr) = state.details.get(&key) {
            return Ok(pr.clone());
        }
        state
            .open_prs
            .get(&format!("{owner}/{name}"))
            .and_then(|prs| prs.iter().find(|pr| pr.number == number))
            .cloned()
            .ok_or_else(|| ForgeError::Payload(format!("{key} not found")))
    }

    async fn reviews(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<Vec<Review>, ForgeError> {
        let key = worker_key(owner, name, number);
        let state = lock(&self.state);
        if state.reviews_fail.contains(&key) {
            return Err(Self::command_error("api unavailable"));
        }
        Ok(state.reviews.get(&key).cloned().unwrap_or_default())
    }

    async fn review_threads(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<Vec<ReviewThread>, ForgeError> {
        let key = worker_key(owner, name, number);
        Ok(lock(&self.state).threads.get(&key).cloned().unwrap_or_default())
    }

    async fn resolve_review_thread(&self, thread_id: &str) -> Result<(), ForgeError> {
        lock(&self.state).resolved_threads.push(thread_id.to_string());
        Ok(())
    }

    async fn update_branch(&self, owner: &str, name: &str, number: u64) -> Result<(), ForgeError> {
        let key = worker_key(owner, name, number);
        lock(&self.state).updated_branches.push(key);
        Ok(())
    }

    async fn merge_pr(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        _method: MergeMethod,
    ) -> Result<(), ForgeError> {
        let key = worker_key(owner, name, number);
        let mut state = lock(&self.state);
        if let Some(output) = state.merge_rejections.remove(&key) {
            return Err(Self::command_error(&output));
        }
        state.merged.push(key);
        Ok(())
    }

    async fn post_comment(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ForgeError> {
        let key = worker_key(owner, name, number);
        lock(&self.state).comments.push((key, body.to_string()));
        Ok(())
    }
}

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub prompt: String,
    pub command: Option<String>,
}

#[derive(Default)]
pub struct MockAgent {
    /// Scripted outcomes, consumed front to back; defaults to success.
    pub outcomes: Mutex<VecDeque<AgentOutcome>>,
    pub calls: Mutex<Vec<AgentCall>>,
}

impl MockAgent {
    pub fn push_outcome(&self, outcome: AgentOutcome) {
        lock(&self.outcomes).push_back(outcome);
    }

    pub fn failure(output: &str) -> AgentOutcome {
        AgentOutcome {
            success: false,
            output: output.to_string(),
            ..AgentOutcome::default()
        }
    }

    fn next_outcome(&self) -> AgentOutcome {
        lock(&self.outcomes).pop_front().unwrap_or(AgentOutcome {
            success: true,
            output: "done".to_string(),
            ..AgentOutcome::default()
        })
    }
}

#[async_trait]
impl AgentRunner for MockAgent {
    async fn run(
        &self,
        _workdir: &Path,
        prompt: &str,
        output: Option<OutputCallback>,
    ) -> Result<AgentOutcome, AgentError> {
        lock(&self.calls).push(AgentCall {
            prompt: prompt.to_string(),
            command: None,
        });
        if let Some(callback) = output {
            callback("working");
        }
        Ok(self.next_outcome())
    }

    async fn run_command(
        &self,
        _workdir: &Path,
        command: &str,
        args: &[String],
        output: Option<OutputCallback>,
    ) -> Result<AgentOutcome, AgentError> {
        lock(&self.calls).push(AgentCall {
            prompt: args.join(" "),
            command: Some(command.to_string()),
        });
        if let Some(callback) = output {
            callback("reviewing");
        }
        Ok(self.next_outcome())
    }
}

#[derive(Default)]
pub struct WorkspaceCalls {
    pub ensured: Vec<String>,
    pub worktrees_added: Vec<String>,
    pub worktrees_removed: Vec<String>,
    pub fetches: usize,
    pub pushes: Vec<String>,
}

/// Workspace stub backed by a temp directory; `has_unpushed` scripts the
/// commit check.
pub struct MockWorkspace {
    root: tempfile::TempDir,
    pub has_unpushed: Mutex<bool>,
    pub calls: Mutex<WorkspaceCalls>,
}

impl Default for MockWorkspace {
    fn default() -> Self {
        Self {
            root: tempfile::TempDir::new().expect("temp workspace"),
            has_unpushed: Mutex::new(true),
            calls: Mutex::new(WorkspaceCalls::default()),
        }
    }
}

impl MockWorkspace {
    pub fn set_has_unpushed(&self, value: bool) {
        *lock(&self.has_unpushed) = value;
    }

    pub fn worktree_path(&self, owner: &str, name: &str, number: u64) -> PathBuf {
        self.root
            .path()
            .join("worktrees")
            .join(format!("{owner}-{name}"))
            .join(format!("pr-{number}"))
    }
}

#[async_trait]
impl Workspace for MockWorkspace {
    async fn ensure_clone(&self, owner: &str, name: &str) -> Result<(), GitError> {
        lock(&self.calls).ensured.push(format!("{owner}/{name}"));
        Ok(())
    }

    async fn add_worktree(
        &self,
        owner: &str,
        name: &str,
        _branch: &str,
        number: u64,
    ) -> Result<PathBuf, GitError> {
        let path = self.worktree_path(owner, name, number);
        std::fs::create_dir_all(&path).map_err(|source| GitError::Io {
            context: format!("create {}", path.display()),
            source,
        })?;
        lock(&self.calls)
            .worktrees_added
            .push(worker_key(owner, name, number));
        Ok(path)
    }

    async fn remove_worktree(&self, owner: &str, name: &str, number: u64) {
        let path = self.worktree_path(owner, name, number);
        let _ = std::fs::remove_dir_all(&path);
        lock(&self.calls)
            .worktrees_removed
            .push(worker_key(owner, name, number));
    }

    async fn fetch(&self, _dir: &Path) -> Result<(), GitError> {
        lock(&self.calls).fetches += 1;
        Ok(())
    }

    async fn push(&self, _dir: &Path, branch: &str) -> Result<(), GitError> {
        lock(&self.calls).pushes.push(branch.to_string());
        Ok(())
    }

    async fn has_unpushed_commits(&self, _dir: &Path, _branch: &str) -> Result<bool, GitError> {
        Ok(*lock(&self.has_unpushed))
    }
}

/// Builds a review from the Copilot reviewer.
pub fn copilot_review(state: autoclaude_core::forge::ReviewState) -> Review {
    Review {
        author: "Copilot".to_string(),
        state,
    }
}

/// Builds a review thread with a single Copilot comment.
pub fn copilot_thread(id: &str, resolved: bool, outdated: bool) -> ReviewThread {
    use autoclaude_core::forge::ThreadComment;

    ReviewThread {
        id: id.to_string(),
        is_resolved: resolved,
        is_outdated: outdated,
        path: "src/lib.rs".to_string(),
        line: Some(3),
        comments: vec![ThreadComment {
            author: "Copilot".to_string(),
            body: "consider a rename".to_string(),
        }],
    }
}

/// Polls `predicate` until it holds or the timeout elapses.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !predicate() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not reached within timeout"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// Convenience bundle shared by most tests.
pub struct Harness {
    pub forge: Arc<MockForge>,
    pub agent: Arc<MockAgent>,
    pub workspace: Arc<MockWorkspace>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            forge: Arc::new(MockForge::default()),
            agent: Arc::new(MockAgent::default()),
            workspace: Arc::new(MockWorkspace::default()),
        }
    }
}

//! Daemon scheduler.
//!
//! One task runs the poll loop: every tick it lists open pull requests
//! per repository, refreshes the caches behind the status snapshot, and
//! reconciles the worker set - spawning workers for actionable PRs up to
//! the per-repository concurrency cap and cancelling workers whose PR is
//! no longer open. A second, faster ticker logs the live agent sessions.
//!
//! Locking is split into three regions (workers, sessions, PR caches),
//! none of which is ever held across an await of an external call.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use autoclaude_core::agent::AgentRunner;
use autoclaude_core::classify::{ReviewerIdentities, has_unresolved_copilot_thread, status_tags};
use autoclaude_core::config::{Config, RepoConfig};
use autoclaude_core::forge::{Forge, ForgeError, PullRequest};
use autoclaude_core::session::SessionTracker;
use autoclaude_core::snapshot::{PrStatus, RepoStatus, Snapshot};
use autoclaude_core::workspace::Workspace;
use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::worker::{Worker, WorkerContext, WorkerError, panic_message};

/// Interval of the active-session log line.
const SESSION_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Labels that suppress all worker actions on a pull request.
const BLOCKING_LABELS: [&str; 2] = ["blocked", "on-hold"];

/// Canonical worker key: `owner/name#number`.
#[must_use]
pub fn worker_key(owner: &str, name: &str, number: u64) -> String {
    format!("{owner}/{name}#{number}")
}

fn has_blocking_label(pr: &PullRequest) -> bool {
    pr.labels
        .iter()
        .any(|label| BLOCKING_LABELS.contains(&label.as_str()))
}

/// Poll caches feeding the status snapshot, replaced atomically per poll.
#[derive(Debug, Default)]
struct PrCache {
    /// Open PRs per repository (`owner/name` key).
    open_prs: HashMap<String, Vec<PullRequest>>,
    /// Whether a submitted Copilot review exists, per worker key.
    copilot_reviewed: HashMap<String, bool>,
    /// Whether a live Copilot thread exists, per worker key.
    copilot_unresolved: HashMap<String, bool>,
}

/// The orchestration daemon.
pub struct Daemon {
    config: Arc<Config>,
    forge: Arc<dyn Forge>,
    agent: Arc<dyn AgentRunner>,
    workspace: Arc<dyn Workspace>,
    identities: Arc<ReviewerIdentities>,
    sessions: Arc<SessionTracker>,
    workers: Mutex<HashMap<String, CancellationToken>>,
    tasks: TaskTracker,
    cache: Mutex<PrCache>,
    review_requested: Arc<Mutex<HashSet<String>>>,
}

impl Daemon {
    /// Creates a daemon over the given collaborators.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        forge: Arc<dyn Forge>,
        agent: Arc<dyn AgentRunner>,
        workspace: Arc<dyn Workspace>,
        identities: Arc<ReviewerIdentities>,
    ) -> Self {
        Self {
            config,
            forge,
            agent,
            workspace,
            identities,
            sessions: Arc::new(SessionTracker::new()),
            workers: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            cache: Mutex::new(PrCache::default()),
            review_requested: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs the poll loop until `shutdown` fires, then cancels all
    /// workers and waits for them to finish.
    pub async fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        info!(
            poll_interval = %humantime::format_duration(self.config.poll_interval),
            repos = self.config.repos.len(),
            "daemon started"
        );

        // Initial poll before the first tick.
        self.poll(&shutdown).await;

        let mut poll_tick = tokio::time::interval(self.config.poll_interval);
        let mut status_tick = tokio::time::interval(SESSION_LOG_INTERVAL);
        // An interval's first tick fires immediately; consume both.
        poll_tick.tick().await;
        status_tick.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutting down, waiting for workers");
                    self.cancel_all_workers();
                    self.tasks.close();
                    self.tasks.wait().await;
                    info!("all workers stopped");
                    return;
                }
                _ = poll_tick.tick() => self.poll(&shutdown).await,
                _ = status_tick.tick() => self.log_session_status(),
            }
        }
    }

    /// Polls every configured repository once. Per-repository failures
    /// are logged; remaining repositories still poll.
    pub async fn poll(self: &Arc<Self>, shutdown: &CancellationToken) {
        for repo in &self.config.repos {
            if let Err(err) = self.poll_repo(repo, shutdown).await {
                error!(repo = %repo.full_name(), %err, "poll repo failed");
            }
        }
    }

    async fn poll_repo(
        self: &Arc<Self>,
        repo: &RepoConfig,
        shutdown: &CancellationToken,
    ) -> Result<(), ForgeError> {
        let prs = self.forge.list_open_prs(&repo.owner, &repo.name).await?;
        let repo_key = repo.full_name();

        // Prefetch Copilot review flags outside the cache lock. A failed
        // prefetch for one PR keeps that PR's previous cached value; it is
        // never reset to false on error.
        let mut copilot_flags: Vec<(String, bool, bool)> = Vec::new();
        if repo.require_copilot_review {
            for pr in &prs {
                let key = worker_key(&repo.owner, &repo.name, pr.number);

                if self.identities.is_renovate(&pr.author) {
                    copilot_flags.push((key, false, false));
                    continue;
                }

                let reviews = match self.forge.reviews(&repo.owner, &repo.name, pr.number).await {
                    Ok(reviews) => reviews,
                    Err(err) => {
                        warn!(pr = pr.number, %err, "failed to get reviews for copilot status");
                        continue;
                    },
                };
                let has_review = reviews
                    .iter()
                    .any(|r| self.identities.is_copilot(&r.author) && r.state.is_submitted());

                let mut has_unresolved = false;
                if has_review {
                    match self
                        .forge
                        .review_threads(&repo.owner, &repo.name, pr.number)
                        .await
                    {
                        Ok(threads) => {
                            has_unresolved =
                                has_unresolved_copilot_thread(&threads, &self.identities);
                        },
                        Err(err) => {
                            warn!(pr = pr.number, %err, "failed to get review threads for copilot status");
                            continue;
                        },
                    }
                }

                copilot_flags.push((key, has_review, has_unresolved));
            }
        }

        {
            let mut cache = lock(&self.cache);
            cache.open_prs.insert(repo_key.clone(), prs.clone());
            for (key, reviewed, unresolved) in copilot_flags {
                cache.copilot_reviewed.insert(key.clone(), reviewed);
                cache.copilot_unresolved.insert(key, unresolved);
            }
        }

        info!(repo = %repo_key, open_prs = prs.len(), "polled repo");

        let open_keys: HashSet<String> = prs
            .iter()
            .map(|pr| worker_key(&repo.owner, &repo.name, pr.number))
            .collect();

        let mut active = self.active_workers_for(&repo_key);
        for pr in &prs {
            let key = worker_key(&repo.owner, &repo.name, pr.number);

            if repo.exclude_authors.contains(&pr.author) {
                continue;
            }
            if pr.is_draft {
                continue;
            }
            if has_blocking_label(pr) {
                continue;
            }
            if lock(&self.workers).contains_key(&key) {
                continue;
            }
            if active >= repo.max_concurrent_prs as usize {
                debug!(repo = %repo_key, "max concurrent PRs reached");
                break;
            }

            self.spawn_worker(repo, pr, shutdown);
            active += 1;
        }

        // Cancel workers whose PR is no longer open.
        let prefix = format!("{repo_key}#");
        let mut workers = lock(&self.workers);
        workers.retain(|key, cancel| {
            if key.starts_with(&prefix) && !open_keys.contains(key) {
                info!(key = %key, "PR closed externally, cancelling worker");
                cancel.cancel();
                false
            } else {
                true
            }
        });

        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, repo: &RepoConfig, pr: &PullRequest, shutdown: &CancellationToken) {
        let key = worker_key(&repo.owner, &repo.name, pr.number);
        let cancel = shutdown.child_token();

        {
            let mut workers = lock(&self.workers);
            if workers.contains_key(&key) {
                return;
            }
            workers.insert(key.clone(), cancel.clone());
        }

        let worker = Worker::new(
            repo.clone(),
            pr.clone(),
            WorkerContext {
                forge: Arc::clone(&self.forge),
                agent: Arc::clone(&self.agent),
                workspace: Arc::clone(&self.workspace),
                identities: Arc::clone(&self.identities),
                sessions: Arc::clone(&self.sessions),
                review_requested: Arc::clone(&self.review_requested),
            },
        );

        let daemon = Arc::clone(self);
        let title = pr.title.clone();
        self.tasks.spawn(async move {
            info!(key = %key, title = %title, "starting worker");

            // Recover panics here so a crashing worker never takes the
            // worker map entry with it.
            let result = AssertUnwindSafe(worker.run(cancel)).catch_unwind().await;
            match result {
                Ok(Ok(())) => {},
                Ok(Err(WorkerError::Cancelled)) => debug!(key = %key, "worker cancelled"),
                Ok(Err(err)) => error!(key = %key, %err, "worker failed"),
                Err(payload) => {
                    error!(key = %key, panic = %panic_message(payload.as_ref()), "worker panicked");
                },
            }

            lock(&daemon.workers).remove(&key);
        });
    }

    fn cancel_all_workers(&self) {
        for (key, cancel) in lock(&self.workers).iter() {
            debug!(key = %key, "cancelling worker");
            cancel.cancel();
        }
    }

    fn active_workers_for(&self, repo_key: &str) -> usize {
        let prefix = format!("{repo_key}#");
        lock(&self.workers)
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .count()
    }

    /// Number of live workers across all repositories.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    fn log_session_status(&self) {
        let sessions = self.sessions.status();
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "active claude sessions");
        for session in &sessions {
            let elapsed = Duration::from_secs(session.elapsed.as_secs());
            info!(
                repo = %session.repo,
                pr = session.pr_number,
                action = %session.action,
                duration = %humantime::format_duration(elapsed),
                "claude session"
            );
        }
    }

    /// Builds a point-in-time status snapshot.
    ///
    /// Each lock is taken in turn, the relevant data copied out, and the
    /// snapshot assembled without holding any lock. The returned value
    /// owns everything it contains.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let worker_keys: HashSet<String> = lock(&self.workers).keys().cloned().collect();
        let worker_count = worker_keys.len();

        let claude_sessions = self.sessions.status();

        let (open_prs, copilot_reviewed, copilot_unresolved) = {
            let cache = lock(&self.cache);
            (
                cache.open_prs.clone(),
                cache.copilot_reviewed.clone(),
                cache.copilot_unresolved.clone(),
            )
        };

        let repos = self
            .config
            .repos
            .iter()
            .map(|repo| {
                let repo_key = repo.full_name();
                let prs = open_prs.get(&repo_key).cloned().unwrap_or_default();

                let mut blocked_prs = 0;
                let mut repo_workers = 0;
                let mut statuses = Vec::with_capacity(prs.len());
                for pr in &prs {
                    let key = worker_key(&repo.owner, &repo.name, pr.number);
                    let has_worker = worker_keys.contains(&key);
                    if has_worker {
                        repo_workers += 1;
                    }
                    if has_blocking_label(pr) {
                        blocked_prs += 1;
                        continue;
                    }

                    let require_copilot =
                        repo.require_copilot_review && !self.identities.is_renovate(&pr.author);
                    statuses.push(PrStatus {
                        number: pr.number,
                        title: pr.title.clone(),
                        author: pr.author.clone(),
                        states: status_tags(
                            pr,
                            require_copilot,
                            copilot_reviewed.get(&key).copied().unwrap_or(false),
                            copilot_unresolved.get(&key).copied().unwrap_or(false),
                        ),
                        has_worker,
                    });
                }

                RepoStatus {
                    owner: repo.owner.clone(),
                    name: repo.name.clone(),
                    workers: repo_workers,
                    blocked_prs,
                    prs: statuses,
                }
            })
            .collect();

        Snapshot {
            timestamp: Utc::now(),
            repos,
            claude_sessions,
            worker_count,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Git workspace manager.
//!
//! Owns the on-disk layout of per-repository clones and per-PR worktrees:
//!
//! ```text
//! {root}/clones/{owner}-{name}/           persistent clone
//! {root}/worktrees/{owner}-{name}/pr-{n}/ transient worktree
//! ```
//!
//! Git operations that touch a shared clone are serialized by a per-clone
//! async mutex, so concurrent workers on the same repository never run
//! conflicting clone/fetch/worktree commands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Host all clones are fetched from.
const FORGE_HOST: &str = "github.com";

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Filesystem setup failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A git command could not be spawned.
    #[error("spawn {command}: {source}")]
    Spawn {
        /// Command line that failed to start.
        command: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A git command exited unsuccessfully.
    #[error("{command}: exit status {status:?}\n{output}")]
    Command {
        /// Command line that failed.
        command: String,
        /// Exit status code, if the process was not killed by a signal.
        status: Option<i32>,
        /// Combined stdout and stderr.
        output: String,
    },
}

/// Filesystem workspace capability used by workers.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Ensures a valid, freshly fetched clone of the repository exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the clone cannot be created or refreshed.
    async fn ensure_clone(&self, owner: &str, name: &str) -> Result<(), GitError>;

    /// Creates (or re-creates) the worktree for one pull request, checked
    /// out to a local `branch` tracking `origin/branch`.
    ///
    /// # Errors
    ///
    /// Returns an error when the worktree cannot be set up.
    async fn add_worktree(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
        number: u64,
    ) -> Result<PathBuf, GitError>;

    /// Removes the worktree for one pull request. Best effort: failures
    /// are logged and the directory is deleted directly as a fallback.
    async fn remove_worktree(&self, owner: &str, name: &str, number: u64);

    /// Fetches `origin` in the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the fetch fails.
    async fn fetch(&self, dir: &Path) -> Result<(), GitError>;

    /// Pushes `branch` to `origin` from the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the push fails.
    async fn push(&self, dir: &Path, branch: &str) -> Result<(), GitError>;

    /// Whether `branch` has local commits that `origin/branch` lacks.
    ///
    /// # Errors
    ///
    /// Returns an error when the commit count cannot be computed.
    async fn has_unpushed_commits(&self, dir: &Path, branch: &str) -> Result<bool, GitError>;
}

/// [`Workspace`] implementation over the `git` CLI.
#[derive(Debug)]
pub struct GitWorkspace {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, std::sync::Arc<tokio::sync::Mutex<()>>>>,
}

impl GitWorkspace {
    /// Creates a workspace rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Clone directory for a repository.
    #[must_use]
    pub fn clone_dir(&self, owner: &str, name: &str) -> PathBuf {
        self.root.join("clones").join(format!("{owner}-{name}"))
    }

    /// Worktree directory for one pull request.
    #[must_use]
    pub fn worktree_dir(&self, owner: &str, name: &str, number: u64) -> PathBuf {
        self.root
            .join("worktrees")
            .join(format!("{owner}-{name}"))
            .join(format!("pr-{number}"))
    }

    fn clone_lock(&self, dir: &Path) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        std::sync::Arc::clone(
            locks
                .entry(dir.to_path_buf())
                .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn remote_url(owner: &str, name: &str) -> String {
        format!("https://{FORGE_HOST}/{owner}/{name}.git")
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn ensure_clone(&self, owner: &str, name: &str) -> Result<(), GitError> {
        let dir = self.clone_dir(owner, name);
        let lock = self.clone_lock(&dir);
        let _guard = lock.lock().await;

        if dir.exists() {
            if dir.join(".git").join("HEAD").exists() {
                // The fetch refspec may be missing after an interrupted
                // clone; restore it before fetching.
                let _ = run_git(
                    Some(&dir),
                    &[
                        "config",
                        "remote.origin.fetch",
                        "+refs/heads/*:refs/remotes/origin/*",
                    ],
                )
                .await;

                debug!(dir = %dir.display(), "fetching existing clone");
                match run_git(Some(&dir), &["fetch", "--all", "--prune"]).await {
                    Ok(_) => return Ok(()),
                    Err(err) => {
                        warn!(dir = %dir.display(), %err, "fetch failed, removing clone");
                        remove_dir(&dir)?;
                    },
                }
            } else {
                warn!(dir = %dir.display(), "clone missing HEAD marker, removing");
                remove_dir(&dir)?;
            }
        }

        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::Io {
                context: format!("create {}", parent.display()),
                source,
            })?;
        }

        let url = Self::remote_url(owner, name);
        info!(url, dir = %dir.display(), "cloning repo");
        run_git(None, &["clone", &url, &dir.display().to_string()]).await?;
        Ok(())
    }

    async fn add_worktree(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
        number: u64,
    ) -> Result<PathBuf, GitError> {
        let clone = self.clone_dir(owner, name);
        let worktree = self.worktree_dir(owner, name, number);
        let lock = self.clone_lock(&clone);
        let _guard = lock.lock().await;

        if let Some(parent) = worktree.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::Io {
                context: format!("create {}", parent.display()),
                source,
            })?;
        }

        let worktree_str = worktree.display().to_string();
        if worktree.exists() {
            if let Err(err) = run_git(
                Some(&clone),
                &["worktree", "remove", "--force", &worktree_str],
            )
            .await
            {
                debug!(%err, "structured worktree removal failed, deleting directory");
                let _ = std::fs::remove_dir_all(&worktree);
            }
        }

        let origin_branch = format!("origin/{branch}");
        info!(branch, dir = %worktree.display(), "adding worktree");
        run_git(Some(&clone), &["worktree", "add", &worktree_str, &origin_branch]).await?;
        run_git(Some(&worktree), &["checkout", "-B", branch, &origin_branch]).await?;

        let upstream = format!("--set-upstream-to={origin_branch}");
        let _ = run_git(Some(&worktree), &["branch", &upstream, branch]).await;

        // Detach the main clone so another worktree can later claim the
        // same branch. Non-fatal when it fails.
        if run_git(Some(&clone), &["rev-parse", "HEAD"]).await.is_ok() {
            if let Err(err) = run_git(Some(&clone), &["checkout", "--detach"]).await {
                warn!(%err, "failed to detach clone head");
            }
        }

        Ok(worktree)
    }

    async fn remove_worktree(&self, owner: &str, name: &str, number: u64) {
        let clone = self.clone_dir(owner, name);
        let worktree = self.worktree_dir(owner, name, number);
        let lock = self.clone_lock(&clone);
        let _guard = lock.lock().await;

        debug!(dir = %worktree.display(), "removing worktree");
        let worktree_str = worktree.display().to_string();
        if let Err(err) = run_git(
            Some(&clone),
            &["worktree", "remove", "--force", &worktree_str],
        )
        .await
        {
            debug!(%err, "structured worktree removal failed, deleting directory");
            if let Err(err) = std::fs::remove_dir_all(&worktree) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %worktree.display(), %err, "failed to delete worktree");
                }
            }
        }
    }

    async fn fetch(&self, dir: &Path) -> Result<(), GitError> {
        run_git(Some(dir), &["fetch", "origin"]).await.map(|_| ())
    }

    async fn push(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        run_git(Some(dir), &["push", "origin", branch])
            .await
            .map(|_| ())
    }

    async fn has_unpushed_commits(&self, dir: &Path, branch: &str) -> Result<bool, GitError> {
        let range = format!("origin/{branch}..{branch}");
        let out = run_git(Some(dir), &["rev-list", "--count", &range]).await?;
        Ok(out.trim() != "0")
    }
}

fn remove_dir(dir: &Path) -> Result<(), GitError> {
    std::fs::remove_dir_all(dir).map_err(|source| GitError::Io {
        context: format!("remove {}", dir.display()),
        source,
    })
}

/// Runs a git command, capturing combined output. The child is killed if
/// the future is dropped, so cancellation aborts in-flight operations.
async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let command_line = format!("git {}", args.join(" "));
    debug!(command = %command_line, dir = ?dir, "exec");

    let mut command = tokio::process::Command::new("git");
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    let output = command.output().await.map_err(|source| GitError::Spawn {
        command: command_line.clone(),
        source,
    })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        Err(GitError::Command {
            command: command_line,
            status: output.status.code(),
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    fn commit_file(dir: &Path, file: &str, message: &str) {
        std::fs::write(dir.join(file), message).unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", message]);
    }

    /// Builds a local "origin" with `main` and `feature` branches, plus a
    /// workspace whose clone directory already points at it.
    fn fixture(owner: &str, name: &str) -> (tempfile::TempDir, GitWorkspace) {
        let tmp = tempfile::TempDir::new().unwrap();
        let origin = tmp.path().join("origin.git");
        std::fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init", "--bare", "--initial-branch=main", "."]);

        let seed = tmp.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "--initial-branch=main", "."]);
        git(&seed, &["config", "user.email", "test@example.com"]);
        git(&seed, &["config", "user.name", "test"]);
        commit_file(&seed, "README.md", "initial");
        git(&seed, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git(&seed, &["push", "-u", "origin", "main"]);
        git(&seed, &["checkout", "-b", "feature"]);
        commit_file(&seed, "feature.txt", "feature work");
        git(&seed, &["push", "-u", "origin", "feature"]);

        let root = tmp.path().join("workdir");
        let workspace = GitWorkspace::new(root);

        let clone = workspace.clone_dir(owner, name);
        std::fs::create_dir_all(clone.parent().unwrap()).unwrap();
        git(
            tmp.path(),
            &["clone", origin.to_str().unwrap(), clone.to_str().unwrap()],
        );
        git(&clone, &["config", "user.email", "test@example.com"]);
        git(&clone, &["config", "user.name", "test"]);

        (tmp, workspace)
    }

    #[test]
    fn directory_layout() {
        let workspace = GitWorkspace::new(PathBuf::from("/tmp/auto-claude"));
        assert_eq!(
            workspace.clone_dir("acme", "api"),
            PathBuf::from("/tmp/auto-claude/clones/acme-api")
        );
        assert_eq!(
            workspace.worktree_dir("acme", "api", 42),
            PathBuf::from("/tmp/auto-claude/worktrees/acme-api/pr-42")
        );
    }

    #[test]
    fn remote_url_shape() {
        assert_eq!(
            GitWorkspace::remote_url("acme", "api"),
            "https://github.com/acme/api.git"
        );
    }

    #[tokio::test]
    async fn ensure_clone_fetches_existing_valid_clone() {
        let (_tmp, workspace) = fixture("acme", "api");
        workspace.ensure_clone("acme", "api").await.unwrap();
        // Idempotent: a second run converges to the same state.
        workspace.ensure_clone("acme", "api").await.unwrap();
        assert!(workspace.clone_dir("acme", "api").join(".git/HEAD").exists());
    }

    #[tokio::test]
    async fn worktree_lifecycle() {
        let (_tmp, workspace) = fixture("acme", "api");

        let worktree = workspace
            .add_worktree("acme", "api", "feature", 5)
            .await
            .unwrap();
        assert!(worktree.join("feature.txt").exists());

        let head = run_git(Some(&worktree), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert_eq!(head.trim(), "feature");

        // Stale worktrees are replaced, not reused.
        let again = workspace
            .add_worktree("acme", "api", "feature", 5)
            .await
            .unwrap();
        assert_eq!(worktree, again);

        workspace.remove_worktree("acme", "api", 5).await;
        assert!(!worktree.exists());
    }

    #[tokio::test]
    async fn unpushed_commits_roundtrip() {
        let (_tmp, workspace) = fixture("acme", "api");
        let worktree = workspace
            .add_worktree("acme", "api", "feature", 7)
            .await
            .unwrap();

        git(&worktree, &["config", "user.email", "test@example.com"]);
        git(&worktree, &["config", "user.name", "test"]);

        assert!(
            !workspace
                .has_unpushed_commits(&worktree, "feature")
                .await
                .unwrap()
        );

        commit_file(&worktree, "fix.txt", "local fix");
        assert!(
            workspace
                .has_unpushed_commits(&worktree, "feature")
                .await
                .unwrap()
        );

        workspace.push(&worktree, "feature").await.unwrap();
        workspace.fetch(&worktree).await.unwrap();
        assert!(
            !workspace
                .has_unpushed_commits(&worktree, "feature")
                .await
                .unwrap()
        );

        workspace.remove_worktree("acme", "api", 7).await;
    }
}

//! GitHub forge provider backed by the `gh` CLI.
//!
//! All REST-shaped reads go through `gh pr …` with `--json` field lists;
//! review threads, thread resolution, and branch updates use the GraphQL
//! API through `gh api graphql`. Subprocesses are killed when the calling
//! future is dropped, so worker cancellation aborts in-flight calls.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::types::{
    Check, MergeState, Mergeable, PullRequest, Review, ReviewDecision, ReviewState, ReviewThread,
    ThreadComment,
};
use super::{Forge, ForgeError};
use crate::config::MergeMethod;

/// JSON fields requested for every pull request read.
const PR_FIELDS: &str = "number,title,headRefName,baseRefName,url,isDraft,author,mergeable,\
                         mergeStateStatus,reviewDecision,labels,statusCheckRollup";

const REVIEW_THREADS_QUERY: &str = r"query($owner: String!, $repo: String!, $pr: Int!, $cursor: String) {
  repository(owner: $owner, name: $repo) {
    pullRequest(number: $pr) {
      reviewThreads(first: 100, after: $cursor) {
        pageInfo {
          hasNextPage
          endCursor
        }
        nodes {
          id
          isResolved
          isOutdated
          path
          line
          comments(first: 100) {
            nodes {
              author { login }
              body
            }
          }
        }
      }
    }
  }
}";

const RESOLVE_THREAD_MUTATION: &str = r"mutation($threadID: ID!) {
  resolveReviewThread(input: {threadId: $threadID}) {
    thread {
      id
      isResolved
    }
  }
}";

const PR_ID_QUERY: &str = r"query($owner: String!, $repo: String!, $num: Int!) {
  repository(owner: $owner, name: $repo) {
    pullRequest(number: $num) {
      id
    }
  }
}";

const UPDATE_BRANCH_MUTATION: &str = r"mutation($prID: ID!) {
  updatePullRequestBranch(input: {pullRequestId: $prID}) {
    pullRequest {
      id
    }
  }
}";

/// GitHub implementation of [`Forge`].
#[derive(Debug, Default)]
pub struct GhForge {
    _private: (),
}

impl GhForge {
    /// Creates a provider. Authentication is whatever `gh auth` has set up.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    async fn gh(&self, args: &[&str]) -> Result<Vec<u8>, ForgeError> {
        let command = format!("gh {}", args.join(" "));
        debug!(command = %command, "running gh");

        let output = tokio::process::Command::new("gh")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ForgeError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let mut captured = String::from_utf8_lossy(&output.stderr).into_owned();
            if captured.trim().is_empty() {
                captured = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            return Err(ForgeError::Command {
                command,
                status: output.status.code(),
                output: captured,
            });
        }

        Ok(output.stdout)
    }

    fn parse<T: for<'de> Deserialize<'de>>(
        context: &str,
        payload: &[u8],
    ) -> Result<T, ForgeError> {
        serde_json::from_slice(payload).map_err(|source| ForgeError::Parse {
            context: context.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Forge for GhForge {
    async fn list_open_prs(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Vec<PullRequest>, ForgeError> {
        let repo = format!("{owner}/{name}");
        let out = self
            .gh(&[
                "pr", "list", "-R", &repo, "--json", PR_FIELDS, "--limit", "100",
            ])
            .await?;

        let raw: Vec<RawPullRequest> = Self::parse("pr list", &out)?;
        Ok(raw.into_iter().map(RawPullRequest::normalize).collect())
    }

    async fn pr_detail(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<PullRequest, ForgeError> {
        let repo = format!("{owner}/{name}");
        let number = number.to_string();
        let out = self
            .gh(&["pr", "view", &number, "-R", &repo, "--json", PR_FIELDS])
            .await?;

        let raw: RawPullRequest = Self::parse("pr view", &out)?;
        Ok(raw.normalize())
    }

    async fn reviews(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<Vec<Review>, ForgeError> {
        let repo = format!("{owner}/{name}");
        let number = number.to_string();
        let out = self
            .gh(&["pr", "view", &number, "-R", &repo, "--json", "reviews"])
            .await?;

        let raw: RawReviews = Self::parse("pr reviews", &out)?;
        Ok(raw
            .reviews
            .into_iter()
            .map(|r| Review {
                author: r.author.map(|a| a.login).unwrap_or_default(),
                state: r.state,
            })
            .collect())
    }

    async fn review_threads(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<Vec<ReviewThread>, ForgeError> {
        let pr_arg = format!("pr={number}");
        let owner_arg = format!("owner={owner}");
        let repo_arg = format!("repo={name}");
        let query_arg = format!("query={REVIEW_THREADS_QUERY}");

        let mut threads = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut args = vec![
                "api",
                "graphql",
                "-f",
                &owner_arg,
                "-f",
                &repo_arg,
                "-F",
                &pr_arg,
                "-f",
                &query_arg,
            ];
            let cursor_arg = cursor.as_ref().map(|c| format!("cursor={c}"));
            if let Some(cursor_arg) = &cursor_arg {
                args.push("-f");
                args.push(cursor_arg);
            }

            let out = self.gh(&args).await?;
            let page: ThreadsResponse = Self::parse("review threads", &out)?;
            let connection = page.data.repository.pull_request.review_threads;

            for node in connection.nodes {
                threads.push(ReviewThread {
                    id: node.id,
                    is_resolved: node.is_resolved,
                    is_outdated: node.is_outdated,
                    path: node.path,
                    line: node.line,
                    comments: node
                        .comments
                        .nodes
                        .into_iter()
                        .map(|c| ThreadComment {
                            author: c.author.map(|a| a.login).unwrap_or_default(),
                            body: c.body,
                        })
                        .collect(),
                });
            }

            if !connection.page_info.has_next_page {
                break;
            }
            cursor = Some(connection.page_info.end_cursor.unwrap_or_default());
        }

        Ok(threads)
    }

    async fn resolve_review_thread(&self, thread_id: &str) -> Result<(), ForgeError> {
        let thread_arg = format!("threadID={thread_id}");
        let query_arg = format!("query={RESOLVE_THREAD_MUTATION}");
        self.gh(&["api", "graphql", "-f", &thread_arg, "-f", &query_arg])
            .await?;
        Ok(())
    }

    async fn update_branch(&self, owner: &str, name: &str, number: u64) -> Result<(), ForgeError> {
        let owner_arg = format!("owner={owner}");
        let repo_arg = format!("repo={name}");
        let num_arg = format!("num={number}");
        let query_arg = format!("query={PR_ID_QUERY}");

        let out = self
            .gh(&[
                "api", "graphql", "-f", &owner_arg, "-f", &repo_arg, "-F", &num_arg, "-f",
                &query_arg,
            ])
            .await?;

        let response: PrIdResponse = Self::parse("pr id", &out)?;
        let pr_id = response.data.repository.pull_request.id;
        if pr_id.is_empty() {
            return Err(ForgeError::Payload(format!(
                "pull request id not found for {owner}/{name}#{number}"
            )));
        }

        let id_arg = format!("prID={pr_id}");
        let mutation_arg = format!("query={UPDATE_BRANCH_MUTATION}");
        self.gh(&["api", "graphql", "-f", &id_arg, "-f", &mutation_arg])
            .await?;
        Ok(())
    }

    async fn merge_pr(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        method: MergeMethod,
    ) -> Result<(), ForgeError> {
        let repo = format!("{owner}/{name}");
        let number = number.to_string();
        let method_flag = match method {
            MergeMethod::Squash => "--squash",
            MergeMethod::Merge => "--merge",
        };
        self.gh(&[
            "pr",
            "merge",
            &number,
            "-R",
            &repo,
            "--delete-branch",
            method_flag,
        ])
        .await?;
        Ok(())
    }

    async fn post_comment(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ForgeError> {
        let repo = format!("{owner}/{name}");
        let number = number.to_string();
        self.gh(&["pr", "comment", &number, "-R", &repo, "-b", body])
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawActor {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    #[serde(default)]
    name: String,
}

/// One node of `statusCheckRollup`: either a check run
/// (`name`/`status`/`conclusion`) or a legacy commit status
/// (`context`/`state`).
#[derive(Debug, Default, Deserialize)]
struct RawCheckNode {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    conclusion: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    state: String,
}

impl RawCheckNode {
    fn normalize(self) -> Check {
        let name = if self.name.is_empty() {
            self.context
        } else {
            self.name
        };
        let status = if self.status.is_empty() {
            self.state.clone()
        } else {
            self.status
        };
        let mut conclusion = self.conclusion;
        if conclusion.is_empty() && self.state == "SUCCESS" {
            conclusion = "success".to_string();
        }
        if conclusion.is_empty() && self.state == "FAILURE" {
            conclusion = "failure".to_string();
        }

        Check {
            name,
            status: status.to_uppercase(),
            conclusion: conclusion.to_lowercase(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    head_ref_name: String,
    #[serde(default)]
    base_ref_name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    author: Option<RawActor>,
    #[serde(default)]
    mergeable: Mergeable,
    #[serde(default)]
    merge_state_status: MergeState,
    #[serde(default)]
    review_decision: ReviewDecision,
    #[serde(default)]
    labels: Option<Vec<RawLabel>>,
    #[serde(default)]
    status_check_rollup: Option<Vec<RawCheckNode>>,
}

impl RawPullRequest {
    fn normalize(self) -> PullRequest {
        PullRequest {
            number: self.number,
            title: self.title,
            head_ref: self.head_ref_name,
            base_ref: self.base_ref_name,
            url: self.url,
            is_draft: self.is_draft,
            author: self.author.map(|a| a.login).unwrap_or_default(),
            mergeable: self.mergeable,
            merge_state: self.merge_state_status,
            review_decision: self.review_decision,
            labels: self
                .labels
                .unwrap_or_default()
                .into_iter()
                .map(|l| l.name)
                .collect(),
            checks: self
                .status_check_rollup
                .unwrap_or_default()
                .into_iter()
                .map(RawCheckNode::normalize)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawReviews {
    #[serde(default)]
    reviews: Vec<RawReview>,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    #[serde(default)]
    author: Option<RawActor>,
    state: ReviewState,
}

#[derive(Debug, Deserialize)]
struct ThreadsResponse {
    data: ThreadsData,
}

#[derive(Debug, Deserialize)]
struct ThreadsData {
    repository: ThreadsRepository,
}

#[derive(Debug, Deserialize)]
struct ThreadsRepository {
    #[serde(rename = "pullRequest")]
    pull_request: ThreadsPullRequest,
}

#[derive(Debug, Deserialize)]
struct ThreadsPullRequest {
    #[serde(rename = "reviewThreads")]
    review_threads: ThreadConnection,
}

#[derive(Debug, Deserialize)]
struct ThreadConnection {
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<ThreadNode>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor", default)]
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadNode {
    id: String,
    #[serde(default)]
    is_resolved: bool,
    #[serde(default)]
    is_outdated: bool,
    #[serde(default)]
    path: String,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    comments: CommentConnection,
}

#[derive(Debug, Default, Deserialize)]
struct CommentConnection {
    #[serde(default)]
    nodes: Vec<CommentNode>,
}

#[derive(Debug, Deserialize)]
struct CommentNode {
    #[serde(default)]
    author: Option<RawActor>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct PrIdResponse {
    data: PrIdData,
}

#[derive(Debug, Deserialize)]
struct PrIdData {
    repository: PrIdRepository,
}

#[derive(Debug, Deserialize)]
struct PrIdRepository {
    #[serde(rename = "pullRequest")]
    pull_request: PrIdNode,
}

#[derive(Debug, Deserialize)]
struct PrIdNode {
    #[serde(default)]
    id: String,
}

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use octocrab::{models::IssueState, params, Octocrab, OctocrabBuilder};
use tracing::{info, warn};

use crate::{
    error::HostingError,
    types::{Branch, Comment, CompareResult, CreatePullRequest, Issue, ListPullsFilter, PullRequest, ReviewComment},
};

fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(3)
        .with_jitter()
}

/// Capability interface for the hosting service (§9): implemented against a real GitHub-shaped
/// REST client in production and by an in-memory double in worker/poller unit tests.
#[async_trait]
pub trait HostingService: Send + Sync {
    async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue, HostingError>;
    /// Pages through all open issues carrying `label`, pulls excluded.
    async fn list_issues_with_label(&self, owner: &str, repo: &str, label: &str) -> Result<Vec<Issue>, HostingError>;
    async fn list_issue_comments(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<Comment>, HostingError>;
    async fn list_review_comments(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<ReviewComment>, HostingError>;
    async fn list_open_pulls(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>, HostingError>;
    async fn get_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<Branch, HostingError>;
    async fn compare_refs(&self, owner: &str, repo: &str, base: &str, head: &str) -> Result<CompareResult, HostingError>;
    async fn create_pull(&self, owner: &str, repo: &str, req: CreatePullRequest) -> Result<PullRequest, HostingError>;
    async fn list_pulls(&self, owner: &str, repo: &str, filter: ListPullsFilter) -> Result<Vec<PullRequest>, HostingError>;
    async fn add_labels(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), HostingError>;
    async fn remove_label(&self, owner: &str, repo: &str, number: i64, label: &str) -> Result<(), HostingError>;
    async fn set_labels(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), HostingError>;
    async fn add_comment(&self, owner: &str, repo: &str, number: i64, body: &str) -> Result<(), HostingError>;

    /// Current auth token, plus a sync refresh callback the Clone/Worktree Store's push path can
    /// call once on an authentication failure.
    fn token_refresher(&self) -> Box<dyn Fn() -> String + Send + Sync>;

    async fn add_label_if_absent(&self, owner: &str, repo: &str, number: i64, label: &str) -> Result<(), HostingError> {
        let issue = self.get_issue(owner, repo, number).await?;
        if issue.labels.iter().any(|l| l == label) {
            return Ok(());
        }
        self.add_labels(owner, repo, number, std::slice::from_ref(&label.to_string())).await
    }

    async fn remove_label_if_present(&self, owner: &str, repo: &str, number: i64, label: &str) -> Result<(), HostingError> {
        let issue = self.get_issue(owner, repo, number).await?;
        if !issue.labels.iter().any(|l| l == label) {
            return Ok(());
        }
        self.remove_label(owner, repo, number, label).await
    }

    /// Appends `<!-- idempotency-key: <key> -->` to `body`; before posting, paginates existing
    /// comments to detect a prior post carrying the same marker and skips if found.
    async fn add_comment_with_idempotency_key(&self, owner: &str, repo: &str, number: i64, key: &str, body: &str) -> Result<(), HostingError> {
        let marker = idempotency_marker(key);
        let existing = self.list_issue_comments(owner, repo, number).await?;
        if existing.iter().any(|c| c.body.contains(&marker)) {
            return Ok(());
        }
        self.add_comment(owner, repo, number, &format!("{body}\n\n{marker}")).await
    }
}

pub fn idempotency_marker(key: &str) -> String {
    format!("<!-- idempotency-key: {key} -->")
}

#[derive(Clone)]
pub struct GitHubHosting {
    client: Octocrab,
    token: Arc<RwLock<String>>,
}

impl GitHubHosting {
    pub fn new(token: &str) -> Result<Self, HostingError> {
        let client = OctocrabBuilder::new().personal_token(token.to_string()).build()?;
        Ok(GitHubHosting { client, token: Arc::new(RwLock::new(token.to_string())) })
    }

    async fn call<F, Fut, T>(&self, op: F) -> Result<T, HostingError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, HostingError>>,
    {
        (op)
            .retry(&retry_policy())
            .when(|e: &HostingError| e.is_retryable())
            .notify(|err: &HostingError, dur: Duration| {
                warn!("hosting API call failed, retrying after {:.2}s: {err}", dur.as_secs_f64());
            })
            .await
    }
}

#[async_trait]
impl HostingService for GitHubHosting {
    async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue, HostingError> {
        self.call(|| async {
            let issue = self.client.issues(owner, repo).get(number as u64).await?;
            Ok(Issue {
                number: issue.number as i64,
                title: issue.title,
                body: issue.body,
                labels: issue.labels.into_iter().map(|l| l.name).collect(),
                author: issue.user.login,
            })
        })
        .await
    }

    async fn list_issues_with_label(&self, owner: &str, repo: &str, label: &str) -> Result<Vec<Issue>, HostingError> {
        self.call(|| async {
            let mut page = self
                .client
                .issues(owner, repo)
                .list()
                .labels(&[label.to_string()])
                .state(params::State::Open)
                .per_page(100)
                .send()
                .await?;
            let mut issues = Vec::new();
            loop {
                issues.extend(page.items.iter().filter(|i| i.pull_request.is_none()).map(|issue| Issue {
                    number: issue.number as i64,
                    title: issue.title.clone(),
                    body: issue.body.clone(),
                    labels: issue.labels.iter().map(|l| l.name.clone()).collect(),
                    author: issue.user.login.clone(),
                }));
                page = match self.client.get_page(&page.next).await? {
                    Some(next) => next,
                    None => break,
                };
            }
            Ok(issues)
        })
        .await
    }

    async fn list_issue_comments(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<Comment>, HostingError> {
        self.call(|| async {
            let page = self.client.issues(owner, repo).list_comments(number as u64).send().await?;
            Ok(page
                .items
                .into_iter()
                .map(|c| Comment {
                    id: c.id.0 as i64,
                    author: c.user.login,
                    body: c.body.unwrap_or_default(),
                    created_at: c.created_at,
                })
                .collect())
        })
        .await
    }

    async fn list_review_comments(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<ReviewComment>, HostingError> {
        self.call(|| async {
            let page = self.client.pulls(owner, repo).list_comments(Some(pr_number as u64)).send().await?;
            Ok(page
                .items
                .into_iter()
                .map(|c| ReviewComment {
                    id: c.id.0 as i64,
                    author: c.user.login,
                    body: c.body.unwrap_or_default(),
                    path: c.path,
                    line: c.line.map(|l| l as i64),
                    created_at: c.created_at,
                })
                .collect())
        })
        .await
    }

    async fn list_open_pulls(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>, HostingError> {
        self.list_pulls(owner, repo, ListPullsFilter { head: None, state: Some("open".to_string()) }).await
    }

    async fn get_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<Branch, HostingError> {
        self.call(|| async {
            let r#ref = self
                .client
                .repos(owner, repo)
                .get_ref(&params::repos::Reference::Branch(branch.to_string()))
                .await
                .map_err(|e| HostingError::Branch(format!("branch '{branch}' not found: {e}")))?;
            let sha = match r#ref.object {
                octocrab::models::repos::Object::Commit { sha, .. } => sha,
                octocrab::models::repos::Object::Tag { sha, .. } => sha,
                _ => String::new(),
            };
            Ok(Branch { name: branch.to_string(), sha })
        })
        .await
    }

    async fn compare_refs(&self, owner: &str, repo: &str, base: &str, head: &str) -> Result<CompareResult, HostingError> {
        self.call(|| async {
            let route = format!("/repos/{owner}/{repo}/compare/{base}...{head}");
            let compare: serde_json::Value = self
                .client
                .get(route, None::<&()>)
                .await
                .map_err(|e| HostingError::Branch(format!("compare {base}...{head} failed: {e}")))?;
            let ahead_by = compare.get("ahead_by").and_then(|v| v.as_i64()).unwrap_or(0);
            let behind_by = compare.get("behind_by").and_then(|v| v.as_i64()).unwrap_or(0);
            let files_changed = compare
                .get("files")
                .and_then(|v| v.as_array())
                .map(|files| {
                    files.iter().filter_map(|f| f.get("filename").and_then(|n| n.as_str()).map(str::to_string)).collect()
                })
                .unwrap_or_default();
            Ok(CompareResult { ahead_by, behind_by, files_changed })
        })
        .await
    }

    async fn create_pull(&self, owner: &str, repo: &str, req: CreatePullRequest) -> Result<PullRequest, HostingError> {
        self.call(|| async {
            let pr = self
                .client
                .pulls(owner, repo)
                .create(&req.title, &req.head_branch, &req.base_branch)
                .body(req.body.as_deref().unwrap_or(""))
                .send()
                .await
                .map_err(|e| HostingError::PullRequest(format!("failed to create PR: {e}")))?;
            info!(%owner, %repo, number = pr.number, "created pull request");
            Ok(PullRequest {
                number: pr.number as i64,
                url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
                head_branch: req.head_branch.clone(),
                base_branch: req.base_branch.clone(),
                status: "open".to_string(),
                merged: false,
                author: pr.user.map(|u| u.login).unwrap_or_default(),
                labels: Vec::new(),
            })
        })
        .await
    }

    async fn list_pulls(&self, owner: &str, repo: &str, filter: ListPullsFilter) -> Result<Vec<PullRequest>, HostingError> {
        self.call(|| async {
            let state = match filter.state.as_deref() {
                Some("closed") => params::State::Closed,
                Some("all") => params::State::All,
                _ => params::State::Open,
            };
            let page = self.client.pulls(owner, repo).list().state(state).send().await?;
            Ok(page
                .items
                .into_iter()
                .filter(|pr| filter.head.as_deref().map(|h| pr.head.ref_field == h).unwrap_or(true))
                .map(|pr| PullRequest {
                    number: pr.number as i64,
                    url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
                    head_branch: pr.head.ref_field,
                    base_branch: pr.base.ref_field,
                    status: match pr.state {
                        Some(IssueState::Open) => "open".to_string(),
                        Some(IssueState::Closed) if pr.merged_at.is_some() => "merged".to_string(),
                        Some(IssueState::Closed) => "closed".to_string(),
                        _ => "unknown".to_string(),
                    },
                    merged: pr.merged_at.is_some(),
                    author: pr.user.map(|u| u.login).unwrap_or_default(),
                    labels: pr.labels.unwrap_or_default().into_iter().map(|l| l.name).collect(),
                })
                .collect())
        })
        .await
    }

    async fn add_labels(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), HostingError> {
        self.call(|| async {
            self.client.issues(owner, repo).add_labels(number as u64, labels).await?;
            Ok(())
        })
        .await
    }

    async fn remove_label(&self, owner: &str, repo: &str, number: i64, label: &str) -> Result<(), HostingError> {
        self.call(|| async {
            match self.client.issues(owner, repo).remove_label(number as u64, label).await {
                Ok(_) => Ok(()),
                Err(octocrab::Error::GitHub { source, .. }) if source.status_code.as_u16() == 404 => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn set_labels(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), HostingError> {
        self.call(|| async {
            self.client.issues(owner, repo).update(number as u64).labels(labels).send().await?;
            Ok(())
        })
        .await
    }

    async fn add_comment(&self, owner: &str, repo: &str, number: i64, body: &str) -> Result<(), HostingError> {
        self.call(|| async {
            self.client.issues(owner, repo).create_comment(number as u64, body).await?;
            Ok(())
        })
        .await
    }

    fn token_refresher(&self) -> Box<dyn Fn() -> String + Send + Sync> {
        let token = self.token.clone();
        Box::new(move || token.read().expect("token lock poisoned").clone())
    }
}

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    error::HostingError,
    service::HostingService,
    types::{Branch, Comment, CompareResult, CreatePullRequest, Issue, ListPullsFilter, PullRequest, ReviewComment},
};

/// In-memory `HostingService` double, used by worker/poller unit tests so they never touch the
/// network. Keyed by `"owner/repo"`.
#[derive(Default)]
pub struct InMemoryHosting {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    issues: HashMap<(String, String, i64), Issue>,
    comments: HashMap<(String, String, i64), Vec<Comment>>,
    review_comments: HashMap<(String, String, i64), Vec<ReviewComment>>,
    pulls: HashMap<(String, String), Vec<PullRequest>>,
    branches: HashMap<(String, String, String), Branch>,
    next_comment_id: i64,
    next_pr_number: i64,
}

impl InMemoryHosting {
    pub fn new() -> Self {
        InMemoryHosting { inner: Mutex::new(Inner { next_comment_id: 1, next_pr_number: 1, ..Default::default() }) }
    }

    pub fn seed_issue(&self, owner: &str, repo: &str, issue: Issue) {
        self.inner.lock().unwrap().issues.insert((owner.to_string(), repo.to_string(), issue.number), issue);
    }

    pub fn seed_branch(&self, owner: &str, repo: &str, branch: Branch) {
        self.inner.lock().unwrap().branches.insert((owner.to_string(), repo.to_string(), branch.name.clone()), branch);
    }

    pub fn seed_pull(&self, owner: &str, repo: &str, pr: PullRequest) {
        self.inner.lock().unwrap().pulls.entry((owner.to_string(), repo.to_string())).or_default().push(pr);
    }

    pub fn seed_comment(&self, owner: &str, repo: &str, number: i64, comment: Comment) {
        self.inner.lock().unwrap().comments.entry((owner.to_string(), repo.to_string(), number)).or_default().push(comment);
    }

    pub fn comments_for(&self, owner: &str, repo: &str, number: i64) -> Vec<Comment> {
        self.inner.lock().unwrap().comments.get(&(owner.to_string(), repo.to_string(), number)).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl HostingService for InMemoryHosting {
    async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue, HostingError> {
        self.inner
            .lock()
            .unwrap()
            .issues
            .get(&(owner.to_string(), repo.to_string(), number))
            .cloned()
            .ok_or_else(|| HostingError::Issue(format!("no such issue {owner}/{repo}#{number}")))
    }

    async fn list_issues_with_label(&self, owner: &str, repo: &str, label: &str) -> Result<Vec<Issue>, HostingError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .issues
            .iter()
            .filter(|((o, r, _), _)| o == owner && r == repo)
            .map(|(_, issue)| issue.clone())
            .filter(|issue| issue.labels.iter().any(|l| l == label))
            .collect())
    }

    async fn list_issue_comments(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<Comment>, HostingError> {
        Ok(self.comments_for(owner, repo, number))
    }

    async fn list_review_comments(&self, owner: &str, repo: &str, pr_number: i64) -> Result<Vec<ReviewComment>, HostingError> {
        Ok(self.inner.lock().unwrap().review_comments.get(&(owner.to_string(), repo.to_string(), pr_number)).cloned().unwrap_or_default())
    }

    async fn list_open_pulls(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>, HostingError> {
        self.list_pulls(owner, repo, ListPullsFilter { head: None, state: Some("open".to_string()) }).await
    }

    async fn get_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<Branch, HostingError> {
        self.inner
            .lock()
            .unwrap()
            .branches
            .get(&(owner.to_string(), repo.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| HostingError::Branch(format!("no such branch {branch}")))
    }

    async fn compare_refs(&self, _owner: &str, _repo: &str, _base: &str, _head: &str) -> Result<CompareResult, HostingError> {
        Ok(CompareResult { ahead_by: 0, behind_by: 0, files_changed: Vec::new() })
    }

    async fn create_pull(&self, owner: &str, repo: &str, req: CreatePullRequest) -> Result<PullRequest, HostingError> {
        let mut inner = self.inner.lock().unwrap();
        let number = inner.next_pr_number;
        inner.next_pr_number += 1;
        let pr = PullRequest {
            number,
            url: format!("https://example.invalid/{owner}/{repo}/pull/{number}"),
            head_branch: req.head_branch,
            base_branch: req.base_branch,
            status: "open".to_string(),
            merged: false,
            author: "gitfix-bot".to_string(),
            labels: Vec::new(),
        };
        inner.pulls.entry((owner.to_string(), repo.to_string())).or_default().push(pr.clone());
        Ok(pr)
    }

    async fn list_pulls(&self, owner: &str, repo: &str, filter: ListPullsFilter) -> Result<Vec<PullRequest>, HostingError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pulls
            .get(&(owner.to_string(), repo.to_string()))
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|pr| filter.head.as_deref().map(|h| pr.head_branch == h).unwrap_or(true))
            .filter(|pr| filter.state.as_deref().map(|s| pr.status == s).unwrap_or(true))
            .collect())
    }

    async fn add_labels(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), HostingError> {
        let mut inner = self.inner.lock().unwrap();
        let mut touched = false;
        if let Some(issue) = inner.issues.get_mut(&(owner.to_string(), repo.to_string(), number)) {
            for l in labels {
                if !issue.labels.contains(l) {
                    issue.labels.push(l.clone());
                }
            }
            touched = true;
        }
        if let Some(prs) = inner.pulls.get_mut(&(owner.to_string(), repo.to_string())) {
            if let Some(pr) = prs.iter_mut().find(|pr| pr.number == number) {
                for l in labels {
                    if !pr.labels.contains(l) {
                        pr.labels.push(l.clone());
                    }
                }
                touched = true;
            }
        }
        if touched {
            Ok(())
        } else {
            Err(HostingError::Issue("no such issue".to_string()))
        }
    }

    async fn remove_label(&self, owner: &str, repo: &str, number: i64, label: &str) -> Result<(), HostingError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(issue) = inner.issues.get_mut(&(owner.to_string(), repo.to_string(), number)) {
            issue.labels.retain(|l| l != label);
        }
        if let Some(prs) = inner.pulls.get_mut(&(owner.to_string(), repo.to_string())) {
            if let Some(pr) = prs.iter_mut().find(|pr| pr.number == number) {
                pr.labels.retain(|l| l != label);
            }
        }
        Ok(())
    }

    async fn set_labels(&self, owner: &str, repo: &str, number: i64, labels: &[String]) -> Result<(), HostingError> {
        let mut inner = self.inner.lock().unwrap();
        let issue = inner
            .issues
            .get_mut(&(owner.to_string(), repo.to_string(), number))
            .ok_or_else(|| HostingError::Issue("no such issue".to_string()))?;
        issue.labels = labels.to_vec();
        Ok(())
    }

    async fn add_comment(&self, owner: &str, repo: &str, number: i64, body: &str) -> Result<(), HostingError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_comment_id;
        inner.next_comment_id += 1;
        inner.comments.entry((owner.to_string(), repo.to_string(), number)).or_default().push(Comment {
            id,
            author: "gitfix-bot".to_string(),
            body: body.to_string(),
            created_at: chrono::Utc::now(),
        });
        Ok(())
    }

    fn token_refresher(&self) -> Box<dyn Fn() -> String + Send + Sync> {
        Box::new(|| "test-token".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_comment_with_idempotency_key_deduplicates() {
        let hosting = InMemoryHosting::new();
        hosting.seed_issue("acme", "widgets", Issue { number: 1, title: "t".into(), body: None, labels: vec![], author: "a".into() });

        hosting.add_comment_with_idempotency_key("acme", "widgets", 1, "abcd1234", "hello").await.unwrap();
        hosting.add_comment_with_idempotency_key("acme", "widgets", 1, "abcd1234", "hello again").await.unwrap();

        assert_eq!(hosting.comments_for("acme", "widgets", 1).len(), 1);
    }

    #[tokio::test]
    async fn add_label_if_absent_is_idempotent() {
        let hosting = InMemoryHosting::new();
        hosting.seed_issue("acme", "widgets", Issue { number: 1, title: "t".into(), body: None, labels: vec![], author: "a".into() });

        hosting.add_label_if_absent("acme", "widgets", 1, "AI-processing").await.unwrap();
        hosting.add_label_if_absent("acme", "widgets", 1, "AI-processing").await.unwrap();

        let issue = hosting.get_issue("acme", "widgets", 1).await.unwrap();
        assert_eq!(issue.labels.iter().filter(|l| *l == "AI-processing").count(), 1);
    }
}

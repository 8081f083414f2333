use std::sync::Arc;

use hosting::service::HostingService;
use queue::{EnqueueOptions, Queue};
use regex::Regex;
use tracing::{error, info, warn};

use crate::{activity::ActivityLog, config::PollerConfig, error::PollerError};

/// Periodic repository scanner (§4.6): one job per labelled issue/model pair, one batch job per
/// PR carrying unprocessed follow-up comments. Per-repo failures are isolated so one broken
/// repository never stalls the rest of the sweep.
pub struct Poller {
    hosting: Arc<dyn HostingService>,
    queue: Arc<Queue>,
    config: PollerConfig,
    activity: Arc<ActivityLog>,
}

impl Poller {
    pub fn new(hosting: Arc<dyn HostingService>, queue: Arc<Queue>, config: PollerConfig, activity: Arc<ActivityLog>) -> Self {
        Poller { hosting, queue, config, activity }
    }

    pub fn activity_log(&self) -> Arc<ActivityLog> {
        self.activity.clone()
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.config.poll_interval, "starting poller");
            let mut interval = tokio::time::interval(self.config.poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("poller shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn sweep(&self) {
        for repo in &self.config.repos {
            if let Err(e) = self.sweep_repo(&repo.owner, &repo.repo).await {
                error!(owner = %repo.owner, repo = %repo.repo, "sweep failed for repository: {e}");
                self.activity.record(format!("{}/{}: sweep error: {e}", repo.owner, repo.repo));
            }
        }
    }

    async fn sweep_repo(&self, owner: &str, repo: &str) -> Result<(), PollerError> {
        self.sweep_issues(owner, repo).await?;
        if !self.config.pr_followup_trigger_keywords.is_empty() {
            self.sweep_pr_followups(owner, repo).await?;
        }
        Ok(())
    }

    async fn sweep_issues(&self, owner: &str, repo: &str) -> Result<(), PollerError> {
        let model_pattern = Regex::new(&self.config.model_label_pattern)?;

        let candidates = self.hosting.list_issues_with_label(owner, repo, &self.config.primary_tag).await?;
        let eligible = candidates
            .into_iter()
            .filter(|i| !i.labels.iter().any(|l| l == &self.config.processing_tag))
            .filter(|i| !i.labels.iter().any(|l| l == &self.config.done_tag));

        for issue in eligible {
            let models = self.resolve_target_models(&issue.labels, &model_pattern);
            for model in models {
                let job_id = format!("issue-{owner}-{repo}-{}-{model}-{}", issue.number, chrono::Utc::now().timestamp_millis());
                let payload = serde_json::json!({
                    "owner": owner,
                    "repo": repo,
                    "issue_number": issue.number,
                    "model": model,
                });
                let inserted = self.queue.add("issues", "processIssue", payload, EnqueueOptions::new(job_id.clone())).await?;
                if inserted {
                    info!(%job_id, "enqueued issue job");
                    self.activity.record(format!("{owner}/{repo}#{} enqueued for model {model}", issue.number));
                }
            }
        }
        Ok(())
    }

    /// Resolved TargetModel set: every model-tag label match, or a singleton default if none.
    fn resolve_target_models(&self, labels: &[String], model_pattern: &Regex) -> Vec<String> {
        let matches: Vec<String> =
            labels.iter().filter_map(|l| model_pattern.captures(l)).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()).collect();
        if matches.is_empty() {
            vec![self.config.default_model.clone()]
        } else {
            matches
        }
    }

    async fn sweep_pr_followups(&self, owner: &str, repo: &str) -> Result<(), PollerError> {
        let pulls = self.hosting.list_open_pulls(owner, repo).await?;
        let candidates = pulls
            .into_iter()
            .filter(|pr| pr.author == self.config.bot_username)
            .filter(|pr| pr.labels.iter().any(|l| l == &self.config.pr_label));

        for pr in candidates {
            let comments = self.hosting.list_issue_comments(owner, repo, pr.number).await?;
            let processed_marker = |id: i64| format!("{id}\u{2713}");
            let unprocessed: Vec<_> = comments
                .iter()
                .filter(|c| c.author != self.config.bot_username)
                .filter(|c| !self.config.user_blacklist.contains(&c.author))
                .filter(|c| self.config.user_whitelist.is_empty() || self.config.user_whitelist.contains(&c.author))
                .filter(|c| !comments.iter().any(|other| other.body.contains(&processed_marker(c.id))))
                .filter(|c| {
                    let body_lower = c.body.to_ascii_lowercase();
                    self.config.pr_followup_trigger_keywords.iter().any(|kw| body_lower.contains(&kw.to_ascii_lowercase()))
                })
                .cloned()
                .collect();

            if unprocessed.is_empty() {
                continue;
            }

            let job_id = format!("pr-comments-{owner}-{repo}-{}-{}", pr.number, chrono::Utc::now().timestamp_millis());
            let payload = serde_json::json!({
                "owner": owner,
                "repo": repo,
                "pr_number": pr.number,
                "branch_name": pr.head_branch,
                "comment_ids": unprocessed.iter().map(|c| c.id).collect::<Vec<_>>(),
            });

            match self.queue.add("pr_comments", "processPrComments", payload, EnqueueOptions::new(job_id.clone())).await {
                Ok(true) => {
                    info!(%job_id, comments = unprocessed.len(), "enqueued pr-comment batch job");
                    self.activity.record(format!("{owner}/{repo}#{} enqueued {} follow-up comment(s)", pr.number, unprocessed.len()));
                }
                Ok(false) => {}
                Err(e) => warn!(owner, repo, pr = pr.number, "failed to enqueue pr-comment batch: {e}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hosting::{
        memory::InMemoryHosting,
        types::{Comment, Issue, PullRequest},
    };

    use super::*;
    use crate::config::RepoRef;

    async fn test_queue() -> Arc<Queue> {
        let dir = tempfile::tempdir().unwrap();
        let url = db::DBService::default_database_url(&dir.path().to_path_buf());
        let db = db::DBService::new(&url).await.unwrap();
        std::mem::forget(dir);
        Arc::new(Queue::new(db))
    }

    fn test_config(owner: &str, repo: &str) -> PollerConfig {
        PollerConfig {
            repos: vec![RepoRef { owner: owner.to_string(), repo: repo.to_string() }],
            primary_tag: "AI".to_string(),
            processing_tag: "AI-processing".to_string(),
            done_tag: "AI-done".to_string(),
            pr_label: "gitfix".to_string(),
            model_label_pattern: "^llm-claude-(.+)$".to_string(),
            default_model: "default".to_string(),
            poll_interval: Duration::from_secs(60),
            bot_username: "gitfix-bot".to_string(),
            user_whitelist: Vec::new(),
            user_blacklist: Vec::new(),
            pr_followup_trigger_keywords: vec!["@gitfix".to_string()],
        }
    }

    #[tokio::test]
    async fn enqueues_one_job_per_labelled_issue_with_default_model() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.seed_issue("acme", "widgets", Issue { number: 42, title: "t".into(), body: None, labels: vec!["AI".into()], author: "a".into() });
        let queue = test_queue().await;
        let activity = Arc::new(ActivityLog::new());
        let poller = Poller::new(hosting, queue, test_config("acme", "widgets"), activity.clone());

        poller.sweep_repo("acme", "widgets").await.unwrap();

        assert_eq!(activity.recent().len(), 1);
        assert!(activity.recent()[0].message.contains("#42"));
    }

    #[tokio::test]
    async fn skips_issues_already_processing_or_done() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.seed_issue(
            "acme",
            "widgets",
            Issue { number: 1, title: "a".into(), body: None, labels: vec!["AI".into(), "AI-processing".into()], author: "a".into() },
        );
        hosting.seed_issue(
            "acme",
            "widgets",
            Issue { number: 2, title: "b".into(), body: None, labels: vec!["AI".into(), "AI-done".into()], author: "a".into() },
        );
        let queue = test_queue().await;
        let activity = Arc::new(ActivityLog::new());
        let poller = Poller::new(hosting, queue, test_config("acme", "widgets"), activity.clone());

        poller.sweep_repo("acme", "widgets").await.unwrap();

        assert!(activity.recent().is_empty());
    }

    #[tokio::test]
    async fn resolves_model_tags_to_multiple_targets() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.seed_issue(
            "acme",
            "widgets",
            Issue {
                number: 7,
                title: "t".into(),
                body: None,
                labels: vec!["AI".into(), "llm-claude-opus".into(), "llm-claude-sonnet".into()],
                author: "a".into(),
            },
        );
        let queue = test_queue().await;
        let activity = Arc::new(ActivityLog::new());
        let poller = Poller::new(hosting, queue, test_config("acme", "widgets"), activity.clone());

        poller.sweep_repo("acme", "widgets").await.unwrap();

        assert_eq!(activity.recent().len(), 2);
    }

    #[tokio::test]
    async fn rerunning_sweep_with_no_new_issues_enqueues_nothing_additional() {
        let hosting = Arc::new(InMemoryHosting::new());
        let queue = test_queue().await;
        let activity = Arc::new(ActivityLog::new());
        let poller = Poller::new(hosting, queue, test_config("acme", "widgets"), activity.clone());

        poller.sweep_repo("acme", "widgets").await.unwrap();
        poller.sweep_repo("acme", "widgets").await.unwrap();

        assert!(activity.recent().is_empty());
    }

    #[tokio::test]
    async fn pr_followup_batches_unprocessed_trigger_comments() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.seed_pull(
            "acme",
            "widgets",
            PullRequest {
                number: 77,
                url: "https://example.invalid/acme/widgets/pull/77".into(),
                head_branch: "ai-fix/42-x".into(),
                base_branch: "main".into(),
                status: "open".into(),
                merged: false,
                author: "gitfix-bot".into(),
                labels: vec!["gitfix".into()],
            },
        );
        hosting.seed_comment("acme", "widgets", 77, Comment { id: 1, author: "alice".into(), body: "@gitfix please also fix the README".into(), created_at: chrono::Utc::now() });
        hosting.seed_comment("acme", "widgets", 77, Comment { id: 2, author: "alice".into(), body: "unrelated chatter".into(), created_at: chrono::Utc::now() });

        let queue = test_queue().await;
        let activity = Arc::new(ActivityLog::new());
        let poller = Poller::new(hosting, queue, test_config("acme", "widgets"), activity.clone());

        poller.sweep_repo("acme", "widgets").await.unwrap();

        let entries = activity.recent();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.contains("1 follow-up"));
    }

    #[tokio::test]
    async fn pr_followup_skips_comments_already_acked() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.seed_pull(
            "acme",
            "widgets",
            PullRequest {
                number: 77,
                url: "https://example.invalid/acme/widgets/pull/77".into(),
                head_branch: "ai-fix/42-x".into(),
                base_branch: "main".into(),
                status: "open".into(),
                merged: false,
                author: "gitfix-bot".into(),
                labels: vec!["gitfix".into()],
            },
        );
        hosting.seed_comment("acme", "widgets", 77, Comment { id: 1, author: "alice".into(), body: "@gitfix fix it".into(), created_at: chrono::Utc::now() });
        hosting.seed_comment("acme", "widgets", 77, Comment { id: 2, author: "gitfix-bot".into(), body: "Done.\n\n1\u{2713}".into(), created_at: chrono::Utc::now() });

        let queue = test_queue().await;
        let activity = Arc::new(ActivityLog::new());
        let poller = Poller::new(hosting, queue, test_config("acme", "widgets"), activity.clone());

        poller.sweep_repo("acme", "widgets").await.unwrap();

        assert!(activity.recent().is_empty());
    }
}

use std::{sync::Arc, time::Instant};

use db::models::task_state::{ErrorInfo, JobKind, TaskStateKind};
use gitops::{
    clone_store::CloneStore,
    commit::commit,
    push::{push_branch, PushOptions},
    worktree::WorktreeStore,
};
use hosting::{service::HostingService, types::Comment};
use queue::Job;
use serde::Deserialize;
use state::StateStore;

use crate::{callbacks::TaskCallbacks, config::WorkerConfig, error::WorkerError, prompt::build_pr_comment_prompt};

#[derive(Debug, Clone, Deserialize)]
pub struct PrCommentPayload {
    pub owner: String,
    pub repo: String,
    pub pr_number: i64,
    pub branch_name: String,
}

/// Handles follow-up requests left as comments on a pull request already opened by the Issue
/// Worker. Re-attaches to the existing branch rather than cutting a new one, and never touches
/// issue labels - only the Issue Worker owns the issue's label lifecycle.
pub struct PrCommentWorker {
    hosting: Arc<dyn HostingService>,
    clones: Arc<CloneStore>,
    worktrees: Arc<WorktreeStore>,
    runner: Arc<container::ContainerRunner>,
    state: Arc<StateStore>,
    config: WorkerConfig,
}

impl PrCommentWorker {
    pub fn new(
        hosting: Arc<dyn HostingService>,
        clones: Arc<CloneStore>,
        worktrees: Arc<WorktreeStore>,
        runner: Arc<container::ContainerRunner>,
        state: Arc<StateStore>,
        config: WorkerConfig,
    ) -> Self {
        PrCommentWorker { hosting, clones, worktrees, runner, state, config }
    }

    pub async fn process(&self, job: Job) -> anyhow::Result<()> {
        let payload: PrCommentPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| WorkerError::BadPayload(e.to_string()))?;
        self.run(payload).await.map_err(Into::into)
    }

    async fn run(&self, payload: PrCommentPayload) -> Result<(), WorkerError> {
        let PrCommentPayload { owner, repo, pr_number, branch_name } = payload;
        let task_id = format!("{owner}-{repo}-pr{pr_number}-{}", chrono::Utc::now().timestamp_millis());
        self.state.create_task(&owner, &repo, pr_number, "pr-comment", JobKind::PrComment).await?;

        let all_comments = self.hosting.list_issue_comments(&owner, &repo, pr_number).await?;
        let marker_of = |id: i64| format!("{id}\u{2713}");
        let is_processed = |id: i64| all_comments.iter().any(|c| c.body.contains(&marker_of(id)));
        let unprocessed: Vec<Comment> = all_comments
            .iter()
            .filter(|c| c.author != self.config.bot_username)
            .filter(|c| !is_processed(c.id))
            .cloned()
            .collect();

        if unprocessed.is_empty() {
            self.state
                .update_task(&task_id, TaskStateKind::CompletedNoChanges, "no unprocessed comments", serde_json::Value::Null)
                .await?;
            return Ok(());
        }

        self.state
            .update_task(&task_id, TaskStateKind::Processing, "pr comment follow-up starting", serde_json::Value::Null)
            .await?;

        let processed_markers: String = unprocessed.iter().map(|c| marker_of(c.id)).collect::<Vec<_>>().join(" ");

        self.hosting
            .add_comment(&owner, &repo, pr_number, "Starting work on the new request(s) above.")
            .await?;

        let token = (self.hosting.token_refresher())();
        let clone_path = self.clones.ensure_clone(&owner, &repo, &token, None).await?;
        let dir_name = branch_name.replace('/', "-");
        let worktree = self
            .worktrees
            .create_worktree_from_existing_branch(&clone_path, &branch_name, &dir_name, &owner, &repo)
            .await?;

        self.state
            .update_task(&task_id, TaskStateKind::ClaudeExecution, "subprocess starting", serde_json::Value::Null)
            .await?;

        let history: Vec<Comment> = all_comments.into_iter().filter(|c| c.author != self.config.bot_username).collect();
        let prompt = build_pr_comment_prompt(&owner, &repo, &worktree.worktree_path, &unprocessed, &history);

        let container_name = format!("gitfix-{task_id}-{}", utils::text::random_salt(6));
        let req = container::RunRequest {
            worktree_path: worktree.worktree_path.clone(),
            clone_base: clone_path.clone(),
            config_dir: self.config.config_dir_host_path.clone(),
            hosting_token: token.clone(),
            prompt,
            model: None,
            max_turns: self.config.container_max_turns,
            timeout: self.config.container_timeout,
            container_user_uid: self.config.container_user_uid,
            container_name,
            image: self.config.container_image.clone(),
            workspace_mount: std::path::PathBuf::from("/workspace"),
        };
        let callbacks = Arc::new(TaskCallbacks {
            state: self.state.clone(),
            task_id: task_id.clone(),
            worktree_path: worktree.worktree_path.clone(),
            log_dir: self.config.log_dir.clone(),
            issue_number: pr_number,
        });

        let started = Instant::now();
        let run_result = self.runner.run(req, callbacks).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let outcome = match run_result {
            Ok(outcome) => outcome,
            Err(container::ContainerError::UsageLimit { reset_at }) => {
                self.state
                    .mark_failed(
                        &task_id,
                        ErrorInfo {
                            category: "usage_limit".to_string(),
                            message: format!("usage limit reached, resets at {reset_at}"),
                            stage: "claude_execution".to_string(),
                            branch: Some(branch_name.clone()),
                        },
                    )
                    .await?;
                self.hosting
                    .add_comment(&owner, &repo, pr_number, &format!("Hit a usage limit; will need to be retried manually (resets at {reset_at})."))
                    .await?;
                self.worktrees
                    .cleanup_worktree(&clone_path, &worktree.worktree_path, &branch_name, false, false, self.config.retention_strategy)
                    .await;
                return Ok(());
            }
            Err(e) => {
                let _ = self.state.record_execution(&task_id, "pr-comment", false, 0.0, 0, elapsed_ms).await;
                let we = WorkerError::from(e);
                self.hosting
                    .add_comment(&owner, &repo, pr_number, &format!("Could not apply the requested follow-up: {we}"))
                    .await
                    .ok();
                self.state
                    .mark_failed(
                        &task_id,
                        ErrorInfo { category: we.category().to_string(), message: we.to_string(), stage: "claude_execution".to_string(), branch: Some(branch_name.clone()) },
                    )
                    .await?;
                self.worktrees
                    .cleanup_worktree(&clone_path, &worktree.worktree_path, &branch_name, false, false, self.config.retention_strategy)
                    .await;
                return Err(we);
            }
        };

        let _ = self.state.record_execution(&task_id, "pr-comment", true, outcome.cost_usd, outcome.num_turns as i64, elapsed_ms).await;

        self.state
            .update_task(&task_id, TaskStateKind::PostProcessing, "subprocess completed, committing", serde_json::Value::Null)
            .await?;

        let comment_ids: Vec<String> = unprocessed.iter().map(|c| c.id.to_string()).collect();
        let commit_message = format!(
            "Address PR #{pr_number} follow-up comment(s)\n\nAddressed-Comments: {}",
            comment_ids.join(", ")
        );
        let committed = commit(
            &worktree.worktree_path,
            Some(&commit_message),
            (&self.config.bot_username, "gitfix@users.noreply.github.com"),
            pr_number as u64,
            "follow-up request",
        )?;

        let mut requesters = Vec::new();
        for comment in &unprocessed {
            if !requesters.contains(&comment.author) {
                requesters.push(comment.author.clone());
            }
        }

        if let Some(commit_info) = committed {
            let repo_url = format!("https://github.com/{owner}/{repo}.git");
            push_branch(
                &worktree.worktree_path,
                &branch_name,
                PushOptions {
                    repo_url: &repo_url,
                    auth_token: &token,
                    token_refresh_fn: Some(Box::new({
                        let hosting = self.hosting.clone();
                        move || (hosting.token_refresher())()
                    })),
                },
            )?;
            self.hosting
                .add_comment(
                    &owner,
                    &repo,
                    pr_number,
                    &format!(
                        "Pushed commit `{}` addressing the request(s) above.\n\nRequested by: {}\nModel: pr-comment\nTurns: {}\nExecution time: {}ms\nCost: ${:.4}\n\n{processed_markers}",
                        commit_info.hash,
                        requesters.join(", "),
                        outcome.num_turns,
                        elapsed_ms,
                        outcome.cost_usd,
                    ),
                )
                .await?;
            self.state.mark_completed(&task_id, TaskStateKind::CompletedWithPr, None).await?;
        } else {
            self.hosting
                .add_comment(
                    &owner,
                    &repo,
                    pr_number,
                    &format!("No changes were necessary to address the request(s) above.\n\n{processed_markers}"),
                )
                .await?;
            self.state.mark_completed(&task_id, TaskStateKind::CompletedNoChanges, None).await?;
        }

        // `deleteBranch=false`: the branch backs a live PR and keeps going through further
        // comment-triggered follow-ups.
        self.worktrees
            .cleanup_worktree(&clone_path, &worktree.worktree_path, &branch_name, false, true, self.config.retention_strategy)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gitops::{clone_store::CloneStore, CloneLocks};
    use hosting::memory::InMemoryHosting;

    use super::*;
    use crate::config::WorkerConfig;

    async fn test_db() -> db::DBService {
        let dir = tempfile::tempdir().unwrap();
        let url = db::DBService::default_database_url(&dir.path().to_path_buf());
        let db = db::DBService::new(&url).await.unwrap();
        std::mem::forget(dir);
        db
    }

    async fn test_worker(hosting: Arc<InMemoryHosting>, state: Arc<StateStore>) -> PrCommentWorker {
        let locks = CloneLocks::new();
        let clones = Arc::new(CloneStore::new(std::env::temp_dir().join("gitfix-test-clones"), locks.clone(), None));
        let worktrees = Arc::new(WorktreeStore::new(std::env::temp_dir().join("gitfix-test-worktrees"), locks, None));
        let runner = Arc::new(container::ContainerRunner::new());
        let config = WorkerConfig {
            primary_tag: "AI".to_string(),
            processing_tag: "AI-processing".to_string(),
            done_tag: "AI-done".to_string(),
            pr_label: "ai-fix".to_string(),
            default_model: "sonnet".to_string(),
            clones_base_path: std::env::temp_dir(),
            worktrees_base_path: std::env::temp_dir(),
            shallow_clone_depth: None,
            retention_strategy: gitops::RetentionStrategy::AlwaysDelete,
            worktree_max_age: Duration::from_secs(3600),
            container_image: "gitfix-runner:latest".to_string(),
            container_max_turns: Some(40),
            container_timeout: Duration::from_secs(600),
            config_dir_host_path: std::env::temp_dir(),
            log_dir: std::env::temp_dir(),
            container_user_uid: 1000,
            requeue_buffer_ms: 1000,
            requeue_jitter_ms: 500,
            bot_username: "gitfix-bot".to_string(),
            model_start_delays: Default::default(),
        };
        PrCommentWorker::new(hosting, clones, worktrees, runner, state, config)
    }

    #[tokio::test]
    async fn no_unprocessed_comments_short_circuits() {
        let hosting = Arc::new(InMemoryHosting::new());
        let state = Arc::new(StateStore::new(test_db().await, 5.0, chrono::Duration::minutes(30)));
        let worker = test_worker(hosting, state).await;

        worker
            .run(PrCommentPayload { owner: "acme".into(), repo: "widgets".into(), pr_number: 9, branch_name: "ai-fix/9-x".into() })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bot_authored_comments_never_count_as_unprocessed() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.add_comment("acme", "widgets", 9, "status update from the bot").await.unwrap();
        assert_eq!(hosting.comments_for("acme", "widgets", 9).len(), 1);

        let state = Arc::new(StateStore::new(test_db().await, 5.0, chrono::Duration::minutes(30)));
        let worker = test_worker(hosting, state.clone()).await;

        worker
            .run(PrCommentPayload { owner: "acme".into(), repo: "widgets".into(), pr_number: 9, branch_name: "ai-fix/9-x".into() })
            .await
            .unwrap();
    }
}

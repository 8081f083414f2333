use std::{path::Path, sync::Arc, time::Instant};

use chrono::Utc;
use db::models::task_state::{ErrorInfo, JobKind, PrResultInfo, TaskState, TaskStateKind};
use gitops::{
    clone_store::CloneStore,
    commit::commit,
    git_cli::GitCli,
    push::{push_branch, PushOptions},
    worktree::WorktreeStore,
};
use hosting::{
    service::HostingService,
    types::{CreatePullRequest, ListPullsFilter},
};
use queue::{EnqueueOptions, Job, Queue};
use rand::Rng;
use serde::Deserialize;
use state::StateStore;
use tracing::warn;

use crate::{
    callbacks::TaskCallbacks,
    config::WorkerConfig,
    error::WorkerError,
    prompt::{build_issue_prompt, build_pr_only_prompt},
};

#[derive(Debug, Clone, Deserialize)]
pub struct IssuePayload {
    pub owner: String,
    pub repo: String,
    pub issue_number: i64,
    pub model: String,
    #[serde(default)]
    pub retry: bool,
}

pub struct IssueWorker {
    hosting: Arc<dyn HostingService>,
    clones: Arc<CloneStore>,
    worktrees: Arc<WorktreeStore>,
    runner: Arc<container::ContainerRunner>,
    state: Arc<StateStore>,
    queue: Arc<Queue>,
    config: WorkerConfig,
}

impl IssueWorker {
    pub fn new(
        hosting: Arc<dyn HostingService>,
        clones: Arc<CloneStore>,
        worktrees: Arc<WorktreeStore>,
        runner: Arc<container::ContainerRunner>,
        state: Arc<StateStore>,
        queue: Arc<Queue>,
        config: WorkerConfig,
    ) -> Self {
        IssueWorker { hosting, clones, worktrees, runner, state, queue, config }
    }

    /// Entry point handed to `Queue::consume`. A non-`Ok` return lets the Queue's own retry
    /// policy decide whether to try the job again.
    pub async fn process(&self, job: Job) -> anyhow::Result<()> {
        let payload: IssuePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| WorkerError::BadPayload(e.to_string()))?;
        self.run(payload).await.map_err(Into::into)
    }

    async fn run(&self, payload: IssuePayload) -> Result<(), WorkerError> {
        let IssuePayload { owner, repo, issue_number, model, retry } = payload;
        let task_id = TaskState::fingerprint(&owner, &repo, issue_number, &model);
        self.state.create_task(&owner, &repo, issue_number, &model, JobKind::Issue).await?;

        tokio::time::sleep(self.config.model_start_delay(&model)).await;

        // Label gate.
        let issue = self.hosting.get_issue(&owner, &repo, issue_number).await?;
        if !issue.labels.iter().any(|l| l == &self.config.primary_tag)
            || issue.labels.iter().any(|l| l == &self.config.done_tag)
        {
            self.state
                .update_task(
                    &task_id,
                    TaskStateKind::CompletedNoChanges,
                    "label gate: primary tag missing or done tag present",
                    serde_json::Value::Null,
                )
                .await?;
            return Ok(());
        }
        if let Err(e) = self.hosting.add_label_if_absent(&owner, &repo, issue_number, &self.config.processing_tag).await {
            warn!(%task_id, "failed to add processing label: {e}");
        }
        self.state
            .update_task(&task_id, TaskStateKind::Processing, "label gate passed", serde_json::Value::Null)
            .await?;

        // Environment setup.
        let token = (self.hosting.token_refresher())();
        let clone_path = self.clones.ensure_clone(&owner, &repo, &token, None).await?;
        let base_branch = self.clones.detect_default_branch(&clone_path, &owner, &repo, None).await?;
        let worktree = self
            .worktrees
            .create_worktree(&clone_path, issue_number as u64, &issue.title, &owner, &repo, &base_branch, Some(&model))
            .await?;

        let repo_url = format!("https://github.com/{owner}/{repo}.git");
        push_branch(
            &worktree.worktree_path,
            &worktree.branch_name,
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
                issue_number,
                &format!(
                    "Starting work on this issue using model `{model}` on branch `{}` (base `{base_branch}`).",
                    worktree.branch_name
                ),
            )
            .await?;

        self.state
            .update_task(&task_id, TaskStateKind::ClaudeExecution, "subprocess starting", serde_json::Value::Null)
            .await?;

        let comments = self.hosting.list_issue_comments(&owner, &repo, issue_number).await.unwrap_or_default();
        let prompt = build_issue_prompt(
            &owner,
            &repo,
            &worktree.branch_name,
            &model,
            &issue,
            &comments,
            &self.config.bot_username,
            retry,
        );

        let container_name = format!("gitfix-{task_id}-{}", utils::text::random_salt(6));
        let req = container::RunRequest {
            worktree_path: worktree.worktree_path.clone(),
            clone_base: clone_path.clone(),
            config_dir: self.config.config_dir_host_path.clone(),
            hosting_token: token.clone(),
            prompt,
            model: Some(model.clone()),
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
            issue_number,
        });

        let started = Instant::now();
        let run_result = self.runner.run(req, callbacks).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let outcome = match run_result {
            Ok(outcome) => outcome,
            Err(container::ContainerError::UsageLimit { reset_at }) => {
                return self.handle_usage_limit(&task_id, &owner, &repo, issue_number, &model, reset_at, retry).await;
            }
            Err(e) => {
                let _ = self.state.record_execution(&task_id, &model, false, 0.0, 0, elapsed_ms).await;
                return self
                    .final_pr_validation(
                        &owner,
                        &repo,
                        &task_id,
                        issue_number,
                        &worktree.branch_name,
                        &base_branch,
                        &worktree.worktree_path,
                        &clone_path,
                        false,
                        WorkerError::from(e),
                    )
                    .await;
            }
        };

        let _ = self
            .state
            .record_execution(&task_id, &model, true, outcome.cost_usd, outcome.num_turns as i64, elapsed_ms)
            .await;

        self.state
            .update_task(&task_id, TaskStateKind::PostProcessing, "subprocess completed, committing", serde_json::Value::Null)
            .await?;

        match self
            .commit_and_open_pr(&owner, &repo, &task_id, issue_number, &issue.title, &worktree.worktree_path, &worktree.branch_name, &base_branch, &token)
            .await
        {
            Ok(()) => {
                self.worktrees
                    .cleanup_worktree(&clone_path, &worktree.worktree_path, &worktree.branch_name, true, true, self.config.retention_strategy)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.final_pr_validation(
                    &owner,
                    &repo,
                    &task_id,
                    issue_number,
                    &worktree.branch_name,
                    &base_branch,
                    &worktree.worktree_path,
                    &clone_path,
                    true,
                    e,
                )
                .await
            }
        }
    }

    async fn handle_usage_limit(
        &self,
        task_id: &str,
        owner: &str,
        repo: &str,
        issue_number: i64,
        model: &str,
        reset_at: chrono::DateTime<Utc>,
        retry: bool,
    ) -> Result<(), WorkerError> {
        self.state
            .mark_failed(
                task_id,
                ErrorInfo {
                    category: "usage_limit".to_string(),
                    message: format!("usage limit reached, resets at {reset_at}"),
                    stage: "claude_execution".to_string(),
                    branch: None,
                },
            )
            .await?;

        let delay_ms = (reset_at - Utc::now()).num_milliseconds().max(0)
            + self.config.requeue_buffer_ms
            + rand::thread_rng().gen_range(0..self.config.requeue_jitter_ms.max(1));
        self.hosting
            .add_comment(
                owner,
                repo,
                issue_number,
                &format!("This issue hit a usage limit; work will resume around {reset_at}."),
            )
            .await?;

        let fresh_job_id = format!("issue-{owner}-{repo}-{issue_number}-{model}-{}", Utc::now().timestamp_millis());
        self.queue
            .add(
                "issues",
                "processIssue",
                serde_json::json!({ "owner": owner, "repo": repo, "issue_number": issue_number, "model": model, "retry": retry }),
                EnqueueOptions::new(fresh_job_id).with_delay(std::time::Duration::from_millis(delay_ms as u64)),
            )
            .await?;

        self.state.mark_requeued(task_id, "usage limit, requeued", serde_json::Value::Null).await?;
        Ok(())
    }

    /// Commits, pushes, waits for branch visibility, compares against base, and creates (or
    /// adopts) the pull request. Swaps the issue's processing/done labels on success.
    #[allow(clippy::too_many_arguments)]
    async fn commit_and_open_pr(
        &self,
        owner: &str,
        repo: &str,
        task_id: &str,
        issue_number: i64,
        issue_title: &str,
        worktree_path: &Path,
        branch_name: &str,
        base_branch: &str,
        token: &str,
    ) -> Result<(), WorkerError> {
        let committed = commit(worktree_path, None, (&self.config.bot_username, "gitfix@users.noreply.github.com"), issue_number as u64, issue_title)?;

        if committed.is_none() {
            self.hosting
                .add_comment(owner, repo, issue_number, "No changes were necessary for this issue.")
                .await?;
            if let Err(e) = self.hosting.remove_label_if_present(owner, repo, issue_number, &self.config.processing_tag).await {
                warn!(%task_id, "failed to remove processing label: {e}");
            }
            if let Err(e) = self.hosting.add_label_if_absent(owner, repo, issue_number, &self.config.done_tag).await {
                warn!(%task_id, "failed to add done label: {e}");
            }
            self.state.mark_completed(task_id, TaskStateKind::CompletedNoChanges, None).await?;
            return Ok(());
        }

        let repo_url = format!("https://github.com/{owner}/{repo}.git");
        push_branch(
            worktree_path,
            branch_name,
            PushOptions {
                repo_url: &repo_url,
                auth_token: token,
                token_refresh_fn: Some(Box::new({
                    let hosting = self.hosting.clone();
                    move || (hosting.token_refresher())()
                })),
            },
        )?;

        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        for attempt in 0..5u32 {
            match self.hosting.get_branch(owner, repo, branch_name).await {
                Ok(_) => break,
                Err(e) if attempt == 4 => return Err(e.into()),
                Err(_) => tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt))).await,
            }
        }

        let compare = self.hosting.compare_refs(owner, repo, base_branch, branch_name).await?;
        if compare.ahead_by == 0 {
            self.hosting
                .add_comment(owner, repo, issue_number, "No changes were necessary for this issue.")
                .await?;
            self.state.mark_completed(task_id, TaskStateKind::CompletedNoChanges, None).await?;
            return Ok(());
        }

        let pr = self.create_pull_with_retry(owner, repo, branch_name, base_branch, issue_number, issue_title).await?;

        if let Err(e) = self.hosting.add_labels(owner, repo, pr.number, std::slice::from_ref(&self.config.pr_label)).await {
            warn!(%task_id, "failed to label pull request: {e}");
        }
        if let Err(e) = self.hosting.remove_label_if_present(owner, repo, issue_number, &self.config.processing_tag).await {
            warn!(%task_id, "failed to remove processing label: {e}");
        }
        if let Err(e) = self.hosting.add_label_if_absent(owner, repo, issue_number, &self.config.done_tag).await {
            warn!(%task_id, "failed to add done label: {e}");
        }
        self.hosting
            .add_comment(owner, repo, issue_number, &format!("Opened pull request {}", pr.url))
            .await?;

        self.state
            .mark_completed(task_id, TaskStateKind::CompletedWithPr, Some(PrResultInfo { number: pr.number, url: pr.url.clone() }))
            .await?;
        Ok(())
    }

    async fn create_pull_with_retry(
        &self,
        owner: &str,
        repo: &str,
        branch_name: &str,
        base_branch: &str,
        issue_number: i64,
        issue_title: &str,
    ) -> Result<hosting::types::PullRequest, WorkerError> {
        let req = CreatePullRequest {
            title: format!("Fix #{issue_number}: {issue_title}"),
            head_branch: branch_name.to_string(),
            base_branch: base_branch.to_string(),
            body: Some(format!("Closes #{issue_number}.\n\nAutomated fix.")),
        };

        for attempt in 0..2u32 {
            match self.hosting.create_pull(owner, repo, req.clone()).await {
                Ok(pr) => return Ok(pr),
                Err(e) if is_already_exists(&e) => {
                    let pulls = self
                        .hosting
                        .list_pulls(owner, repo, ListPullsFilter { head: Some(branch_name.to_string()), state: None })
                        .await?;
                    if let Some(pr) = pulls.into_iter().next() {
                        return Ok(pr);
                    }
                    return Err(e.into());
                }
                Err(e) if is_transient_pr_error(&e) && attempt == 0 => {
                    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(WorkerError::NoPullRequest(branch_name.to_string()))
    }

    /// Last-resort recovery path (§4.7 step 8): adopt an already-open PR for this branch if one
    /// exists; otherwise, if the branch carries commits and the subprocess itself reported
    /// success, attempt one short emergency re-invocation asking only for a PR summary.
    #[allow(clippy::too_many_arguments)]
    async fn final_pr_validation(
        &self,
        owner: &str,
        repo: &str,
        task_id: &str,
        issue_number: i64,
        branch_name: &str,
        base_branch: &str,
        worktree_path: &Path,
        clone_path: &Path,
        claude_succeeded: bool,
        original_error: WorkerError,
    ) -> Result<(), WorkerError> {
        let existing = self
            .hosting
            .list_open_pulls(owner, repo)
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|pr| pr.head_branch == branch_name);

        if let Some(pr) = existing {
            if let Err(e) = self.hosting.add_labels(owner, repo, pr.number, std::slice::from_ref(&self.config.pr_label)).await {
                warn!(%task_id, "failed to label recovered pull request: {e}");
            }
            let _ = self.hosting.remove_label_if_present(owner, repo, issue_number, &self.config.processing_tag).await;
            let _ = self.hosting.add_label_if_absent(owner, repo, issue_number, &self.config.done_tag).await;
            self.state
                .mark_completed(task_id, TaskStateKind::CompletedWithPr, Some(PrResultInfo { number: pr.number, url: pr.url }))
                .await?;
            self.worktrees.cleanup_worktree(clone_path, worktree_path, branch_name, true, true, self.config.retention_strategy).await;
            return Ok(());
        }

        let has_commits = GitCli::new()
            .git(worktree_path, ["rev-list", "--count", &format!("{base_branch}..HEAD")])
            .ok()
            .and_then(|out| out.trim().parse::<u64>().ok())
            .unwrap_or(0)
            > 0;

        if claude_succeeded && has_commits {
            if let Ok(issue) = self.hosting.get_issue(owner, repo, issue_number).await {
                let token = (self.hosting.token_refresher())();
                let req = container::RunRequest {
                    worktree_path: worktree_path.to_path_buf(),
                    clone_base: clone_path.to_path_buf(),
                    config_dir: self.config.config_dir_host_path.clone(),
                    hosting_token: token,
                    prompt: build_pr_only_prompt(&issue),
                    model: None,
                    max_turns: Some(1),
                    timeout: self.config.container_timeout,
                    container_user_uid: self.config.container_user_uid,
                    container_name: format!("gitfix-{task_id}-recovery"),
                    image: self.config.container_image.clone(),
                    workspace_mount: std::path::PathBuf::from("/workspace"),
                };
                let callbacks = Arc::new(TaskCallbacks {
                    state: self.state.clone(),
                    task_id: task_id.to_string(),
                    worktree_path: worktree_path.to_path_buf(),
                    log_dir: self.config.log_dir.clone(),
                    issue_number,
                });
                if self.runner.run(req, callbacks).await.is_ok() {
                    if let Ok(pr) = self
                        .create_pull_with_retry(owner, repo, branch_name, base_branch, issue_number, &issue.title)
                        .await
                    {
                        let _ = self.hosting.add_labels(owner, repo, pr.number, std::slice::from_ref(&self.config.pr_label)).await;
                        let _ = self.hosting.remove_label_if_present(owner, repo, issue_number, &self.config.processing_tag).await;
                        let _ = self.hosting.add_label_if_absent(owner, repo, issue_number, &self.config.done_tag).await;
                        self.state
                            .mark_completed(task_id, TaskStateKind::CompletedWithPr, Some(PrResultInfo { number: pr.number, url: pr.url }))
                            .await?;
                        self.worktrees.cleanup_worktree(clone_path, worktree_path, branch_name, true, true, self.config.retention_strategy).await;
                        return Ok(());
                    }
                }
            }
        }

        let category = original_error.category();
        let message: String = original_error.to_string().chars().take(500).collect();
        self.hosting
            .add_comment(
                owner,
                repo,
                issue_number,
                &format!("This issue could not be completed automatically.\n\nCategory: {category}\nStage: post_processing\nBranch: `{branch_name}`\nError: {message}"),
            )
            .await
            .ok();
        let _ = self.hosting.remove_label_if_present(owner, repo, issue_number, &self.config.processing_tag).await;
        self.state
            .mark_failed(task_id, ErrorInfo { category: category.to_string(), message, stage: "post_processing".to_string(), branch: Some(branch_name.to_string()) })
            .await?;
        self.worktrees.cleanup_worktree(clone_path, worktree_path, branch_name, false, false, self.config.retention_strategy).await;
        Err(original_error)
    }
}

fn is_already_exists(e: &hosting::HostingError) -> bool {
    e.to_string().to_lowercase().contains("already exists")
}

fn is_transient_pr_error(e: &hosting::HostingError) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("not have history in common") || msg.contains("sha") && msg.contains("blank")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gitops::{clone_store::CloneStore, CloneLocks};
    use hosting::{memory::InMemoryHosting, types::Issue};

    use super::*;
    use crate::config::WorkerConfig;

    async fn test_worker(hosting: Arc<InMemoryHosting>, state: Arc<StateStore>) -> IssueWorker {
        let locks = CloneLocks::new();
        let clones = Arc::new(CloneStore::new(std::env::temp_dir().join("gitfix-test-clones"), locks.clone(), None));
        let worktrees = Arc::new(WorktreeStore::new(std::env::temp_dir().join("gitfix-test-worktrees"), locks, None));
        let runner = Arc::new(container::ContainerRunner::new());
        let queue = Arc::new(Queue::new(test_db().await));
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
        IssueWorker::new(hosting, clones, worktrees, runner, state, queue, config)
    }

    async fn test_db() -> db::DBService {
        let dir = tempfile::tempdir().unwrap();
        let url = db::DBService::default_database_url(&dir.path().to_path_buf());
        let db = db::DBService::new(&url).await.unwrap();
        std::mem::forget(dir);
        db
    }

    async fn test_state() -> Arc<StateStore> {
        Arc::new(StateStore::new(test_db().await, 5.0, chrono::Duration::minutes(30)))
    }

    #[tokio::test]
    async fn label_gate_skips_issues_missing_the_primary_tag() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.seed_issue("acme", "widgets", Issue { number: 1, title: "Fix the bug".into(), body: None, labels: vec![], author: "alice".into() });
        let state = test_state().await;
        let worker = test_worker(hosting, state.clone()).await;

        worker
            .run(IssuePayload { owner: "acme".into(), repo: "widgets".into(), issue_number: 1, model: "sonnet".into(), retry: false })
            .await
            .unwrap();

        let task_id = TaskState::fingerprint("acme", "widgets", 1, "sonnet");
        let task = state.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskStateKind::CompletedNoChanges);
    }

    #[tokio::test]
    async fn label_gate_skips_issues_already_marked_done() {
        let hosting = Arc::new(InMemoryHosting::new());
        hosting.seed_issue(
            "acme",
            "widgets",
            Issue { number: 2, title: "Fix the bug".into(), body: None, labels: vec!["AI".into(), "AI-done".into()], author: "alice".into() },
        );
        let state = test_state().await;
        let worker = test_worker(hosting, state.clone()).await;

        worker
            .run(IssuePayload { owner: "acme".into(), repo: "widgets".into(), issue_number: 2, model: "sonnet".into(), retry: false })
            .await
            .unwrap();

        let task_id = TaskState::fingerprint("acme", "widgets", 2, "sonnet");
        let task = state.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskStateKind::CompletedNoChanges);
    }
}

use std::{collections::HashMap, sync::Arc, time::Duration};

use gitops::{clone_store::CloneStore, locks::CloneLocks, worktree::WorktreeStore};
use hosting::{service::HostingService, GitHubHosting};
use poller::{ActivityLog, Poller, PollerConfig, RepoRef};
use queue::Queue;
use state::StateStore;
use worker::{IssueWorker, PrCommentWorker, WorkerConfig};

use crate::{config::Config, error::CoreError};

/// Composition root: owns one instance of every shared component and hands out the pieces each
/// entry point (worker pool, poller, HTTP server) needs. Grounded on `LocalDeployment`'s
/// all-in-one-struct wiring, generalized from "one desktop app's services" to "one process's
/// queue consumers plus an HTTP surface".
#[derive(Clone)]
pub struct Deployment {
    pub config: Config,
    pub db: db::DBService,
    pub queue: Arc<Queue>,
    pub hosting: Arc<dyn HostingService>,
    pub state: Arc<StateStore>,
    pub issue_worker: Arc<IssueWorker>,
    pub pr_comment_worker: Arc<PrCommentWorker>,
    pub poller: Arc<Poller>,
}

impl Deployment {
    pub async fn new(config: Config) -> Result<Self, CoreError> {
        let db = db::DBService::new(&config.database_url_or_default()).await?;
        let queue = Arc::new(Queue::new(db.clone()));
        let hosting: Arc<dyn HostingService> = Arc::new(GitHubHosting::new(&config.github_token)?);
        let state = Arc::new(StateStore::new(db.clone(), config.cost_threshold_usd, chrono::Duration::minutes(30)));

        let locks = CloneLocks::new();
        let clones = Arc::new(CloneStore::new(config.clones_base_path.clone(), locks.clone(), config.shallow_clone_depth));
        let worktrees = Arc::new(WorktreeStore::new(config.worktrees_base_path.clone(), locks, Some(config.container_user_uid)));
        let runner = Arc::new(container::ContainerRunner::new());

        let worker_config = WorkerConfig {
            primary_tag: config.primary_tag.clone(),
            processing_tag: config.processing_tag.clone(),
            done_tag: config.done_tag.clone(),
            pr_label: config.pr_label.clone(),
            default_model: config.default_model.clone(),
            clones_base_path: config.clones_base_path.clone(),
            worktrees_base_path: config.worktrees_base_path.clone(),
            shallow_clone_depth: config.shallow_clone_depth,
            retention_strategy: config.retention_strategy,
            worktree_max_age: config.worktree_max_age,
            container_image: config.container_image.clone(),
            container_max_turns: config.container_max_turns,
            container_timeout: config.container_timeout,
            config_dir_host_path: config.config_dir_host_path.clone(),
            log_dir: config.log_dir.clone(),
            container_user_uid: config.container_user_uid,
            requeue_buffer_ms: config.requeue_buffer_ms as i64,
            requeue_jitter_ms: config.requeue_jitter_ms as i64,
            bot_username: config.bot_username.clone(),
            model_start_delays: HashMap::new(),
        };

        let issue_worker = Arc::new(IssueWorker::new(
            hosting.clone(),
            clones.clone(),
            worktrees.clone(),
            runner.clone(),
            state.clone(),
            queue.clone(),
            worker_config.clone(),
        ));
        let pr_comment_worker =
            Arc::new(PrCommentWorker::new(hosting.clone(), clones, worktrees, runner, state.clone(), worker_config));

        let poller_config = PollerConfig {
            repos: config.repos.iter().filter_map(|r| RepoRef::parse(r)).collect(),
            primary_tag: config.primary_tag.clone(),
            processing_tag: config.processing_tag.clone(),
            done_tag: config.done_tag.clone(),
            pr_label: config.pr_label.clone(),
            model_label_pattern: config.model_label_pattern.clone(),
            default_model: config.default_model.clone(),
            poll_interval: config.poll_interval,
            bot_username: config.bot_username.clone(),
            user_whitelist: config.user_whitelist.clone(),
            user_blacklist: config.user_blacklist.clone(),
            pr_followup_trigger_keywords: config.pr_followup_trigger_keywords.clone(),
        };
        let poller = Arc::new(Poller::new(hosting.clone(), queue.clone(), poller_config, Arc::new(ActivityLog::new())));

        Ok(Deployment { config, db, queue, hosting, state, issue_worker, pr_comment_worker, poller })
    }

    /// Spawns the `issues` and `pr_comments` queue consumers, bounded by `worker_concurrency`.
    pub fn spawn_workers(&self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let issue_worker = self.issue_worker.clone();
        let queue = self.queue.clone();
        let concurrency = self.config.worker_concurrency;
        let shutdown_issues = shutdown.clone();
        tokio::spawn(async move {
            queue
                .consume("issues", concurrency, Duration::from_secs(2), move |job| {
                    let issue_worker = issue_worker.clone();
                    async move { issue_worker.process(job).await }
                }, shutdown_issues)
                .await;
        });

        let pr_comment_worker = self.pr_comment_worker.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            queue
                .consume("pr_comments", concurrency, Duration::from_secs(2), move |job| {
                    let pr_comment_worker = pr_comment_worker.clone();
                    async move { pr_comment_worker.process(job).await }
                }, shutdown)
                .await;
        });
    }

    pub fn spawn_poller(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        self.poller.clone().spawn(shutdown)
    }
}

use std::{collections::HashMap, path::PathBuf, time::Duration};

use gitops::RetentionStrategy;

/// Everything the Issue Worker and PR-Comment Worker need that isn't wired per-request. One
/// instance is built at boot from the environment (§6) and shared across worker tasks.
#[derive(Clone)]
pub struct WorkerConfig {
    pub primary_tag: String,
    pub processing_tag: String,
    pub done_tag: String,
    pub pr_label: String,
    pub default_model: String,
    pub clones_base_path: PathBuf,
    pub worktrees_base_path: PathBuf,
    pub shallow_clone_depth: Option<u32>,
    pub retention_strategy: RetentionStrategy,
    pub worktree_max_age: Duration,
    pub container_image: String,
    pub container_max_turns: Option<u32>,
    pub container_timeout: Duration,
    pub config_dir_host_path: PathBuf,
    pub log_dir: PathBuf,
    pub container_user_uid: u32,
    pub requeue_buffer_ms: i64,
    pub requeue_jitter_ms: i64,
    pub bot_username: String,
    /// Small fixed per-model stagger so concurrent models for the same issue don't race to
    /// create branches at the same instant (§4.6).
    pub model_start_delays: HashMap<String, Duration>,
}

impl WorkerConfig {
    pub fn model_start_delay(&self, model: &str) -> Duration {
        self.model_start_delays.get(model).copied().unwrap_or(Duration::from_millis(250))
    }
}

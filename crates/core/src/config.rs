use std::time::Duration;

use gitops::RetentionStrategy;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn parse_retention_strategy(raw: &str, hours: u64) -> RetentionStrategy {
    match raw {
        "keep_on_failure" => RetentionStrategy::KeepOnFailure,
        "keep_for_hours" => RetentionStrategy::KeepForHours(hours as u32),
        _ => RetentionStrategy::AlwaysDelete,
    }
}

/// Process-wide settings, assembled once at boot from the environment (§6). Mirrors the shape of
/// `worker::WorkerConfig`/`poller::PollerConfig` but is the single source of truth they're built
/// from.
#[derive(Debug, Clone)]
pub struct Config {
    pub primary_tag: String,
    pub processing_tag: String,
    pub done_tag: String,
    pub pr_label: String,
    pub model_label_pattern: String,
    pub default_model: String,
    pub clones_base_path: std::path::PathBuf,
    pub worktrees_base_path: std::path::PathBuf,
    pub default_branch: String,
    pub fallback_branch: String,
    pub shallow_clone_depth: Option<u32>,
    pub retention_strategy: RetentionStrategy,
    pub worktree_max_age: Duration,
    pub container_image: String,
    pub container_max_turns: Option<u32>,
    pub container_timeout: Duration,
    pub config_dir_host_path: std::path::PathBuf,
    pub log_dir: std::path::PathBuf,
    pub requeue_buffer_ms: u64,
    pub requeue_jitter_ms: u64,
    pub cost_threshold_usd: f64,
    pub bot_username: String,
    pub user_whitelist: Vec<String>,
    pub user_blacklist: Vec<String>,
    pub pr_followup_trigger_keywords: Vec<String>,
    pub repos: Vec<String>,
    pub poll_interval: Duration,

    pub github_token: String,
    pub database_url: Option<String>,
    pub worker_concurrency: usize,
    pub container_user_uid: u32,
    pub server_bind_addr: String,
}

impl Config {
    /// Reads every setting from the environment, falling back to the documented defaults (§6).
    /// `REPOS` (CSV of `owner/repo`) and `GITHUB_TOKEN` have no default and must be set.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::temp_dir().join("gitfix");
        let retention_hours = env_u64("WORKTREE_RETENTION_HOURS", 24);

        Ok(Config {
            primary_tag: env_string("PRIMARY_TAG", "AI"),
            processing_tag: env_string("PROCESSING_TAG", "AI-processing"),
            done_tag: env_string("DONE_TAG", "AI-done"),
            pr_label: env_string("PR_LABEL", "gitfix"),
            model_label_pattern: env_string("MODEL_LABEL_PATTERN", "^llm-claude-(.+)$"),
            default_model: env_string("DEFAULT_MODEL", "default"),
            clones_base_path: env_opt_string("CLONES_BASE_PATH").map(Into::into).unwrap_or_else(|| data_dir.join("clones")),
            worktrees_base_path: env_opt_string("WORKTREES_BASE_PATH").map(Into::into).unwrap_or_else(|| data_dir.join("worktrees")),
            default_branch: env_string("DEFAULT_BRANCH", "main"),
            fallback_branch: env_string("FALLBACK_BRANCH", "master"),
            shallow_clone_depth: std::env::var("SHALLOW_CLONE_DEPTH").ok().and_then(|v| v.parse().ok()),
            retention_strategy: parse_retention_strategy(&env_string("WORKTREE_RETENTION_STRATEGY", "always_delete"), retention_hours),
            worktree_max_age: Duration::from_secs(env_u64("WORKTREE_MAX_AGE_HOURS", 24) * 3600),
            container_image: env_string("CONTAINER_IMAGE", "gitfix-runner:latest"),
            container_max_turns: std::env::var("CONTAINER_MAX_TURNS").ok().and_then(|v| v.parse().ok()),
            container_timeout: Duration::from_millis(env_u64("CONTAINER_TIMEOUT_MS", 300_000)),
            config_dir_host_path: env_opt_string("CONFIG_DIR_HOST_PATH").map(Into::into).unwrap_or_else(|| data_dir.join("config")),
            log_dir: env_opt_string("LOG_DIR").map(Into::into).unwrap_or_else(|| data_dir.join("logs")),
            requeue_buffer_ms: env_u64("REQUEUE_BUFFER_MS", 5_000),
            requeue_jitter_ms: env_u64("REQUEUE_JITTER_MS", 10_000),
            cost_threshold_usd: env_f64("COST_THRESHOLD_USD", 5.0),
            bot_username: env_string("BOT_USERNAME", "gitfix-bot"),
            user_whitelist: env_csv("USER_WHITELIST"),
            user_blacklist: env_csv("USER_BLACKLIST"),
            pr_followup_trigger_keywords: env_csv("PR_FOLLOWUP_TRIGGER_KEYWORDS"),
            repos: env_csv("REPOS"),
            poll_interval: Duration::from_secs(env_u64("POLL_INTERVAL_SECS", 60)),

            github_token: std::env::var("GITHUB_TOKEN").map_err(|_| anyhow::anyhow!("GITHUB_TOKEN must be set"))?,
            database_url: env_opt_string("DATABASE_URL"),
            worker_concurrency: env_u64("WORKER_CONCURRENCY", 4) as usize,
            container_user_uid: env_u64("CONTAINER_USER_UID", 1000) as u32,
            server_bind_addr: env_string("SERVER_BIND_ADDR", "127.0.0.1:8080"),
        })
    }

    pub fn database_url_or_default(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| db::DBService::default_database_url(&std::env::temp_dir().join("gitfix")))
    }
}

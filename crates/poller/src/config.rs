use std::time::Duration;

/// One repository to sweep, in `owner/repo` form.
#[derive(Debug, Clone)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, repo) = full_name.split_once('/')?;
        Some(RepoRef { owner: owner.to_string(), repo: repo.to_string() })
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub repos: Vec<RepoRef>,
    pub primary_tag: String,
    pub processing_tag: String,
    pub done_tag: String,
    pub pr_label: String,
    /// Regex with one capture group yielding the resolved model id, e.g. `^llm-claude-(.+)$`.
    pub model_label_pattern: String,
    pub default_model: String,
    pub poll_interval: Duration,
    pub bot_username: String,
    pub user_whitelist: Vec<String>,
    pub user_blacklist: Vec<String>,
    /// Empty disables the PR-follow-up comment scan entirely (§4.6 step 4).
    pub pr_followup_trigger_keywords: Vec<String>,
}

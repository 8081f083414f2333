use std::path::Path;

use crate::{error::GitOpsError, git_cli::GitCli};

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
}

/// Stages and commits every change in `worktree_path`. Returns `None` if the working tree was
/// already clean, matching the "nothing to commit" short-circuit before PR creation.
pub fn commit(
    worktree_path: &Path,
    message: Option<&str>,
    author: (&str, &str),
    issue_number: u64,
    issue_title: &str,
) -> Result<Option<CommitInfo>, GitOpsError> {
    let cli = GitCli::new();
    let (name, email) = author;
    cli.set_config(worktree_path, "user.name", name)?;
    cli.set_config(worktree_path, "user.email", email)?;

    cli.add_all(worktree_path)?;
    if !cli.has_changes(worktree_path)? {
        return Ok(None);
    }

    let message = message
        .map(str::to_string)
        .unwrap_or_else(|| format!("Fix #{issue_number}: {issue_title}"));
    let hash = cli.commit(worktree_path, &message)?;
    Ok(Some(CommitInfo { hash, message }))
}

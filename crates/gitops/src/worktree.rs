use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};
use utils::text::{random_salt, sanitize_branch_title};

use crate::{error::GitOpsError, git_cli::GitCli, locks::CloneLocks};

#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionStrategy {
    AlwaysDelete,
    KeepOnFailure,
    KeepForHours(u32),
}

pub struct WorktreeStore {
    worktrees_base: PathBuf,
    locks: CloneLocks,
    cli: GitCli,
    container_uid: Option<u32>,
}

impl WorktreeStore {
    pub fn new(worktrees_base: PathBuf, locks: CloneLocks, container_uid: Option<u32>) -> Self {
        WorktreeStore { worktrees_base, locks, cli: GitCli::new(), container_uid }
    }

    fn branch_name(issue_number: u64, title: &str, model: Option<&str>) -> String {
        let sanitized = sanitize_branch_title(title);
        let timestamp = Utc::now().format("%Y%m%d-%H%M");
        let model = model.unwrap_or("default");
        let salt = random_salt(3);
        format!("ai-fix/{issue_number}-{sanitized}-{timestamp}-{model}-{salt}")
    }

    fn worktree_dir_name(branch_name: &str) -> String {
        branch_name.replace('/', "-")
    }

    /// Creates a fresh worktree on a new branch cut from `base_branch` (or the detected default).
    pub async fn create_worktree(
        &self,
        clone_path: &Path,
        issue_number: u64,
        title: &str,
        owner: &str,
        repo: &str,
        base_branch: &str,
        model: Option<&str>,
    ) -> Result<CreatedWorktree, GitOpsError> {
        let lock = self.locks.lock_for(clone_path).await;
        let _guard = lock.lock().await;

        let branch_name = Self::branch_name(issue_number, title, model);
        let dir_name = Self::worktree_dir_name(&branch_name);
        let worktree_path = self.worktrees_base.join(owner).join(repo).join(&dir_name);

        if worktree_path.exists() {
            let _ = self.cli.worktree_remove(clone_path, &worktree_path, true);
            let _ = std::fs::remove_dir_all(&worktree_path);
        }
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = self.cli.worktree_prune(clone_path);

        if self.cli.git(clone_path, ["rev-parse", "--verify", &branch_name]).is_ok() {
            for (path, branch) in self.cli.list_worktrees(clone_path)? {
                if branch.ends_with(&branch_name) {
                    let _ = self.cli.worktree_remove(clone_path, Path::new(&path), true);
                }
            }
            let _ = self.cli.branch_delete(clone_path, &branch_name);
        }

        self.cli.fetch(clone_path, "origin", base_branch)?;
        self.cli.worktree_add(clone_path, &worktree_path, &format!("origin/{base_branch}"), Some(&branch_name))?;

        self.set_ownership(&worktree_path)?;
        self.add_safe_directory(&worktree_path)?;
        self.add_safe_directory(clone_path)?;

        info!(%owner, %repo, %branch_name, path = %worktree_path.display(), "worktree created");
        Ok(CreatedWorktree { worktree_path, branch_name, base_branch: base_branch.to_string() })
    }

    /// Re-attaches a worktree to an already-existing remote branch (PR-comment follow-up work).
    pub async fn create_worktree_from_existing_branch(
        &self,
        clone_path: &Path,
        branch_name: &str,
        dir_name: &str,
        owner: &str,
        repo: &str,
    ) -> Result<CreatedWorktree, GitOpsError> {
        let lock = self.locks.lock_for(clone_path).await;
        let _guard = lock.lock().await;

        let worktree_path = self.worktrees_base.join(owner).join(repo).join(dir_name);
        if worktree_path.exists() {
            let _ = self.cli.worktree_remove(clone_path, &worktree_path, true);
            let _ = std::fs::remove_dir_all(&worktree_path);
        }
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = self.cli.worktree_prune(clone_path);

        self.cli.fetch(clone_path, "origin", branch_name)?;
        self.cli.worktree_add(clone_path, &worktree_path, &format!("origin/{branch_name}"), None)?;

        self.verify_linked_worktree(&worktree_path)?;

        let origin_url = self.cli.remote_get_url(clone_path, "origin")?;
        let _ = self.cli.remote_set_url(&worktree_path, "origin", &origin_url);

        self.set_ownership(&worktree_path)?;
        self.add_safe_directory(&worktree_path)?;

        Ok(CreatedWorktree {
            worktree_path,
            branch_name: branch_name.to_string(),
            base_branch: branch_name.to_string(),
        })
    }

    /// `<path>/.git` must be a file (linked-worktree gitdir pointer); a directory means the
    /// subprocess replaced it with its own repo and the clone is corrupted for this task.
    fn verify_linked_worktree(&self, worktree_path: &Path) -> Result<(), GitOpsError> {
        let git_entry = worktree_path.join(".git");
        let meta = std::fs::metadata(&git_entry)?;
        if meta.is_dir() {
            return Err(GitOpsError::WorktreeCorrupted(worktree_path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(&git_entry)?;
        let gitdir = contents.trim().strip_prefix("gitdir: ").unwrap_or(contents.trim());
        if !Path::new(gitdir).exists() {
            return Err(GitOpsError::WorktreeCorrupted(worktree_path.to_path_buf()));
        }
        Ok(())
    }

    fn set_ownership(&self, worktree_path: &Path) -> Result<(), GitOpsError> {
        #[cfg(unix)]
        if let Some(uid) = self.container_uid {
            use std::os::unix::fs::chown;
            for entry in walk(worktree_path) {
                let _ = chown(&entry, Some(uid), None);
            }
        }
        #[cfg(not(unix))]
        let _ = worktree_path;
        Ok(())
    }

    fn add_safe_directory(&self, path: &Path) -> Result<(), GitOpsError> {
        let _ = std::process::Command::new("git")
            .args(["config", "--global", "--add", "safe.directory"])
            .arg(path)
            .output();
        Ok(())
    }

    /// Retires a worktree according to `strategy`. Retained worktrees get a marker file carrying
    /// their scheduled cleanup time; deletion is best-effort and never propagates its failure.
    pub async fn cleanup_worktree(
        &self,
        clone_path: &Path,
        worktree_path: &Path,
        branch_name: &str,
        delete_branch: bool,
        success: bool,
        strategy: RetentionStrategy,
    ) {
        let lock = self.locks.lock_for(clone_path).await;
        let _guard = lock.lock().await;

        let retain = match strategy {
            RetentionStrategy::AlwaysDelete => false,
            RetentionStrategy::KeepOnFailure => !success,
            RetentionStrategy::KeepForHours(_) => true,
        };

        if retain {
            let hours = match strategy {
                RetentionStrategy::KeepForHours(h) => h,
                _ => 24,
            };
            let cleanup_at = Utc::now() + chrono::Duration::hours(hours as i64);
            let marker = worktree_path.join(".retention-info.json");
            let body = serde_json::json!({ "cleanupAt": cleanup_at.to_rfc3339() });
            if let Err(e) = std::fs::write(&marker, body.to_string()) {
                warn!(path = %worktree_path.display(), "failed to write retention marker: {e}");
            }
            let _ = std::fs::write(worktree_path.join(".gitfix-retained"), "");
            return;
        }

        if self.cli.worktree_remove(clone_path, worktree_path, true).is_err() {
            let _ = std::fs::remove_dir_all(worktree_path);
        }
        if delete_branch {
            let _ = self.cli.branch_delete(clone_path, branch_name);
        }
        let _ = self.cli.worktree_prune(clone_path);
    }

    /// Sweeps `worktrees_base` for entries past their scheduled retention deadline (or, absent a
    /// marker, past a modification-time threshold) and removes them.
    pub fn cleanup_expired(&self, fallback_age: std::time::Duration) {
        let now = Utc::now();
        let Ok(owners) = std::fs::read_dir(&self.worktrees_base) else { return };
        for owner_entry in owners.flatten() {
            let Ok(repos) = std::fs::read_dir(owner_entry.path()) else { continue };
            for repo_entry in repos.flatten() {
                let Ok(dirs) = std::fs::read_dir(repo_entry.path()) else { continue };
                for dir_entry in dirs.flatten() {
                    let path = dir_entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let marker = path.join(".retention-info.json");
                    let expired = if let Ok(contents) = std::fs::read_to_string(&marker) {
                        serde_json::from_str::<serde_json::Value>(&contents)
                            .ok()
                            .and_then(|v| v.get("cleanupAt").and_then(|s| s.as_str()).map(str::to_string))
                            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                            .map(|t| t.with_timezone(&Utc) <= now)
                            .unwrap_or(false)
                    } else {
                        std::fs::metadata(&path)
                            .and_then(|m| m.modified())
                            .map(|m| now.signed_duration_since(chrono::DateTime::<Utc>::from(m)).to_std().unwrap_or_default() >= fallback_age)
                            .unwrap_or(false)
                    };
                    if expired {
                        if let Err(e) = std::fs::remove_dir_all(&path) {
                            warn!(path = %path.display(), "failed to remove expired worktree: {e}");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn walk(root: &Path) -> Vec<PathBuf> {
    let mut out = vec![root.to_path_buf()];
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_matches_grammar() {
        let name = WorktreeStore::branch_name(42, "Fix the Bug!!", Some("sonnet"));
        assert!(name.starts_with("ai-fix/42-fix-the-bug-"));
        assert!(name.contains("-sonnet-"));
        assert_eq!(name.split('-').next_back().unwrap().len(), 3);
    }

    #[test]
    fn worktree_dir_name_replaces_slash() {
        assert_eq!(WorktreeStore::worktree_dir_name("ai-fix/42-x"), "ai-fix-42-x");
    }
}

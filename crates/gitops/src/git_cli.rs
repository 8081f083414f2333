//! Working-tree mutations (worktree add/remove, commit, push) go through the `git`
//! executable rather than libgit2: the CLI enforces safety checks around dirty
//! worktrees that callers would otherwise have to reimplement, and `worktree add`
//! in particular has no ergonomic libgit2 equivalent. Read-only queries (default
//! branch detection, branch listing) use git2 directly in `clone_store`/`worktree`.
use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::Command,
};

use crate::error::GitOpsError;

#[derive(Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self {}
    }

    pub fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitOpsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git_with_env(repo_path, args, &[])
    }

    pub fn git_with_env<I, S>(
        &self,
        repo_path: &Path,
        args: I,
        envs: &[(OsString, OsString)],
    ) -> Result<String, GitOpsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo_path);
        for (k, v) in envs {
            cmd.env(k, v);
        }
        for a in args {
            cmd.arg(a);
        }
        let out = cmd.output()?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(GitOpsError::Command(stderr));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    pub fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        start_point: &str,
        new_branch: Option<&str>,
    ) -> Result<(), GitOpsError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "add".into()];
        if let Some(branch) = new_branch {
            args.push("-b".into());
            args.push(OsString::from(branch));
        }
        args.push(worktree_path.as_os_str().into());
        args.push(OsString::from(start_point));
        self.git(repo_path, args)?;
        Ok(())
    }

    pub fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitOpsError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "remove".into()];
        if force {
            args.push("--force".into());
        }
        args.push(worktree_path.as_os_str().into());
        self.git(repo_path, args)?;
        Ok(())
    }

    pub fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitOpsError> {
        self.git(repo_path, ["worktree", "prune"])?;
        Ok(())
    }

    pub fn list_worktrees(&self, repo_path: &Path) -> Result<Vec<(String, String)>, GitOpsError> {
        let out = self.git(repo_path, ["worktree", "list", "--porcelain"])?;
        let mut result = Vec::new();
        let mut current_path: Option<String> = None;
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(path.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if let Some(path) = current_path.take() {
                    result.push((path, branch.to_string()));
                }
            }
        }
        Ok(result)
    }

    pub fn fetch(&self, repo_path: &Path, remote: &str, refspec: &str) -> Result<(), GitOpsError> {
        self.git(repo_path, ["fetch", remote, refspec])?;
        Ok(())
    }

    pub fn fetch_prune(&self, repo_path: &Path, remote: &str) -> Result<(), GitOpsError> {
        self.git(repo_path, ["fetch", "--prune", remote])?;
        Ok(())
    }

    pub fn checkout(&self, repo_path: &Path, reference: &str) -> Result<(), GitOpsError> {
        self.git(repo_path, ["checkout", reference])?;
        Ok(())
    }

    pub fn branch_delete(&self, repo_path: &Path, branch: &str) -> Result<(), GitOpsError> {
        self.git(repo_path, ["branch", "-D", branch])?;
        Ok(())
    }

    pub fn set_config(&self, repo_path: &Path, key: &str, value: &str) -> Result<(), GitOpsError> {
        self.git(repo_path, ["config", key, value])?;
        Ok(())
    }

    pub fn add_all(&self, worktree_path: &Path) -> Result<(), GitOpsError> {
        self.git(worktree_path, ["add", "-A"])?;
        Ok(())
    }

    pub fn has_changes(&self, worktree_path: &Path) -> Result<bool, GitOpsError> {
        let out = self.git(worktree_path, ["status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    pub fn commit(&self, worktree_path: &Path, message: &str) -> Result<String, GitOpsError> {
        self.git(worktree_path, ["commit", "-m", message])?;
        let hash = self.git(worktree_path, ["rev-parse", "HEAD"])?;
        Ok(hash.trim().to_string())
    }

    pub fn remote_set_url(&self, repo_path: &Path, remote: &str, url: &str) -> Result<(), GitOpsError> {
        self.git(repo_path, ["remote", "set-url", remote, url])?;
        Ok(())
    }

    pub fn remote_get_url(&self, repo_path: &Path, remote: &str) -> Result<String, GitOpsError> {
        Ok(self.git(repo_path, ["remote", "get-url", remote])?.trim().to_string())
    }

    pub fn push(&self, repo_path: &Path, remote: &str, branch: &str) -> Result<(), GitOpsError> {
        self.git(repo_path, ["push", "--set-upstream", remote, branch])?;
        Ok(())
    }

    pub fn symbolic_ref_head(&self, repo_path: &Path, remote: &str) -> Result<String, GitOpsError> {
        Ok(self
            .git(repo_path, ["symbolic-ref", &format!("refs/remotes/{remote}/HEAD")])?
            .trim()
            .to_string())
    }

    pub fn remote_show_head_branch(&self, repo_path: &Path, remote: &str) -> Result<Option<String>, GitOpsError> {
        let out = self.git(repo_path, ["remote", "show", remote])?;
        for line in out.lines() {
            if let Some(rest) = line.trim().strip_prefix("HEAD branch: ") {
                if rest != "(unknown)" {
                    return Ok(Some(rest.to_string()));
                }
            }
        }
        Ok(None)
    }
}

use thiserror::Error;

/// Error categories from §7, attached to every FAILED transition a git operation can cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Git,
    Network,
    Authentication,
    Validation,
    Unknown,
}

#[derive(Debug, Error)]
pub enum GitOpsError {
    #[error("git command failed: {0}")]
    Command(String),
    #[error(transparent)]
    Git2(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("worktree `.git` at {0} is a directory, not a file - the clone was corrupted")]
    WorktreeCorrupted(std::path::PathBuf),
    #[error("could not determine a default branch for {0}/{1}")]
    NoDefaultBranch(String, String),
    #[error("push authentication failed and no token refresh was available")]
    PushAuthFailed,
}

impl GitOpsError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GitOpsError::WorktreeCorrupted(_) => ErrorCategory::Git,
            GitOpsError::PushAuthFailed => ErrorCategory::Authentication,
            GitOpsError::NoDefaultBranch(_, _) => ErrorCategory::Validation,
            GitOpsError::Command(stderr) => classify_git_stderr(stderr),
            GitOpsError::Git2(e) => classify_git_stderr(&e.message().to_lowercase()),
            GitOpsError::Io(_) => ErrorCategory::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Network)
    }
}

/// Open Question #2 resolution (see DESIGN.md): the source's retryable-vs-fatal taxonomy is a
/// heuristic string match on git CLI stderr. This is a closed, deliberately small set rather
/// than pattern-matching arbitrary substrings.
pub fn classify_git_stderr(stderr: &str) -> ErrorCategory {
    let lower = stderr.to_lowercase();
    const RETRYABLE: &[&str] = &[
        "could not resolve host",
        "connection reset",
        "the remote end hung up",
        "try again",
        "423",
        "timed out",
        "temporary failure",
    ];
    const AUTH: &[&str] =
        &["authentication failed", "invalid username or password", "403", "401"];
    const FATAL: &[&str] =
        &["not a git repository", "fatal: not a valid object", ".git is a directory", "fatal: bad object"];

    if AUTH.iter().any(|p| lower.contains(p)) {
        ErrorCategory::Authentication
    } else if RETRYABLE.iter().any(|p| lower.contains(p)) {
        ErrorCategory::Network
    } else if FATAL.iter().any(|p| lower.contains(p)) {
        ErrorCategory::Git
    } else {
        ErrorCategory::Git
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_errors_as_retryable() {
        assert_eq!(classify_git_stderr("fatal: Could not resolve host: github.com"), ErrorCategory::Network);
    }

    #[test]
    fn classifies_auth_errors() {
        assert_eq!(classify_git_stderr("fatal: Authentication failed for 'https://...'"), ErrorCategory::Authentication);
    }

    #[test]
    fn classifies_corruption_as_git() {
        assert_eq!(classify_git_stderr("fatal: .git is a directory"), ErrorCategory::Git);
    }
}

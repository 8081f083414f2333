use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostingError {
    #[error(transparent)]
    Client(octocrab::Error),
    #[error("hosting token is invalid or expired")]
    TokenInvalid,
    #[error("insufficient permissions for this operation")]
    InsufficientPermissions,
    #[error("repository not found or no access")]
    RepoNotFoundOrNoAccess,
    #[error("issue error: {0}")]
    Issue(String),
    #[error("pull request error: {0}")]
    PullRequest(String),
    #[error("branch error: {0}")]
    Branch(String),
    #[error("comment error: {0}")]
    Comment(String),
}

impl HostingError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HostingError::TokenInvalid | HostingError::InsufficientPermissions | HostingError::RepoNotFoundOrNoAccess)
    }
}

impl From<octocrab::Error> for HostingError {
    fn from(err: octocrab::Error) -> Self {
        match &err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                let msg = source.message.to_ascii_lowercase();
                if status == 401 || msg.contains("bad credentials") || msg.contains("token expired") {
                    HostingError::TokenInvalid
                } else if status == 403 {
                    HostingError::InsufficientPermissions
                } else if status == 404 {
                    HostingError::RepoNotFoundOrNoAccess
                } else {
                    HostingError::Client(err)
                }
            }
            _ => HostingError::Client(err),
        }
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("hosting API error: {0}")]
    Hosting(#[from] hosting::HostingError),
    #[error("git operation error: {0}")]
    Git(#[from] gitops::GitOpsError),
    #[error("container error: {0}")]
    Container(#[from] container::ContainerError),
    #[error("state store error: {0}")]
    State(#[from] state::StateError),
    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
    #[error("malformed job payload: {0}")]
    BadPayload(String),
    #[error("no pull request could be created or adopted for branch {0}")]
    NoPullRequest(String),
}

impl WorkerError {
    /// Error taxonomy category attached to `lastError`/failure comments, per the error design.
    pub fn category(&self) -> &'static str {
        match self {
            WorkerError::Hosting(hosting::HostingError::TokenInvalid)
            | WorkerError::Hosting(hosting::HostingError::InsufficientPermissions) => "authentication",
            WorkerError::Hosting(hosting::HostingError::RepoNotFoundOrNoAccess) => "validation",
            WorkerError::Hosting(_) => "hosting_api",
            WorkerError::Git(e) => match e.category() {
                gitops::ErrorCategory::Authentication => "authentication",
                gitops::ErrorCategory::Network => "network",
                _ => "git",
            },
            WorkerError::Container(_) => "container",
            WorkerError::State(_) => "state_store",
            WorkerError::Queue(_) => "state_store",
            WorkerError::BadPayload(_) => "validation",
            WorkerError::NoPullRequest(_) => "post_processing",
        }
    }
}

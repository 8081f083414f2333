use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollerError {
    #[error(transparent)]
    Hosting(#[from] hosting::error::HostingError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error("invalid model label pattern: {0}")]
    BadPattern(#[from] regex::Error),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("usage limit reached, resets at {reset_at}")]
    UsageLimit { reset_at: chrono::DateTime<chrono::Utc> },
    #[error("subprocess timed out")]
    Timeout,
    #[error("subprocess exited non-zero: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("unparseable terminal frame: {0}")]
    ProtocolError(String),
    #[error("failed to spawn container process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to kill process group: {0}")]
    KillFailed(std::io::Error),
}

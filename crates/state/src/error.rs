use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("task {0} not found")]
    NotFound(String),
}

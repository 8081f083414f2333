pub mod callbacks;
pub mod config;
pub mod error;
pub mod issue_worker;
pub mod pr_comment_worker;
pub mod prompt;

pub use callbacks::TaskCallbacks;
pub use config::WorkerConfig;
pub use error::WorkerError;
pub use issue_worker::{IssuePayload, IssueWorker};
pub use pr_comment_worker::{PrCommentPayload, PrCommentWorker};

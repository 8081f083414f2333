pub mod error;
pub mod memory;
pub mod service;
pub mod types;

pub use error::HostingError;
pub use memory::InMemoryHosting;
pub use service::{idempotency_marker, GitHubHosting, HostingService};

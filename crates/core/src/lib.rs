pub mod config;
pub mod error;
pub mod wiring;

pub use config::Config;
pub use error::CoreError;
pub use wiring::Deployment;

pub mod config;
pub mod error;
pub mod ids;
pub mod keys;
pub mod types;

pub use error::{Result, SentinelError};
pub use ids::*;

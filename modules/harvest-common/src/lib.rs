pub mod config;
pub mod error;
pub mod types;

pub use config::{BlockAction, BlockPolicy, HarvestConfig, RetryPolicy, StorageConfig};
pub use error::{ErrorKind, HarvestError, Result};
pub use types::*;

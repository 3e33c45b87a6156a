use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// Timeouts, connection resets, 5xx and 429 responses. Retried locally.
    #[error("Transient network error: {0}")]
    Transient(String),

    /// A response matched a block signature and the block budget ran out.
    #[error("Block detected: {0}")]
    BlockDetected(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::Transient(_) => ErrorKind::TransientNetwork,
            HarvestError::BlockDetected(_) => ErrorKind::BlockDetected,
            HarvestError::Parse(_) => ErrorKind::Parse,
            HarvestError::Configuration(_) => ErrorKind::Configuration,
            HarvestError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            HarvestError::Storage(_) => ErrorKind::Storage,
            HarvestError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HarvestError::Transient(_))
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::Parse(err.to_string())
    }
}

/// Stats-facing projection of [`HarvestError`]. Ordered so summaries print stably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    BlockDetected,
    Parse,
    Configuration,
    ExhaustedRetries,
    Storage,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::BlockDetected => "block_detected",
            ErrorKind::Parse => "parse",
            ErrorKind::Configuration => "configuration",
            ErrorKind::ExhaustedRetries => "exhausted_retries",
            ErrorKind::Storage => "storage",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserlessError>;

#[derive(Debug, Error)]
pub enum BrowserlessError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl BrowserlessError {
    /// Worth retrying: network trouble, timeouts, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            BrowserlessError::Network(_) | BrowserlessError::Timeout(_) => true,
            BrowserlessError::Api { status, .. } => *status == 429 || *status >= 500,
            BrowserlessError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for BrowserlessError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrowserlessError::Timeout(err.to_string())
        } else {
            BrowserlessError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrowserlessError {
    fn from(err: serde_json::Error) -> Self {
        BrowserlessError::Parse(err.to_string())
    }
}

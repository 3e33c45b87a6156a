use google_cloud_storage::http::Error as HttpError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GcsError>;

#[derive(Debug, Error)]
pub enum GcsError {
    #[error("Credential error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<HttpError> for GcsError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Response(resp) => GcsError::Api {
                status: resp.code,
                message: resp.message,
            },
            other => GcsError::Network(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for GcsError {
    fn from(err: serde_json::Error) -> Self {
        GcsError::Parse(err.to_string())
    }
}

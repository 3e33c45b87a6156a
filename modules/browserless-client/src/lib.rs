pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Client for a Browserless instance's `/function` API, which runs a
/// puppeteer script in a fresh browser page.
pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        match &self.token {
            Some(token) => format!("{}/{path}?token={token}", self.base_url),
            None => format!("{}/{path}", self.base_url),
        }
    }

    /// Run `code` with `context`. The script receives `{ page, context }` and
    /// its JSON return value is decoded into `T`.
    pub async fn function<C, T>(&self, code: &str, context: &C) -> Result<T>
    where
        C: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::json!({ "code": code, "context": context });

        tracing::debug!(base_url = self.base_url.as_str(), "Running browserless function");

        let resp = self
            .client
            .post(self.endpoint("function"))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

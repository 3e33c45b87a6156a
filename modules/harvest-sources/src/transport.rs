//! Request plumbing shared by the adapters.
//!
//! Adapters describe requests as [`HttpRequest`] values and hand them to a
//! [`Transport`]. The production transport wraps a pooled reqwest client that
//! is rebuilt from scratch on [`Transport::reset`]; tests substitute a
//! canned-response transport.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use harvest_common::{HarvestError, RawPage, Result};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A transport-agnostic request description.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub json: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            json: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            json: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request. Non-success statuses come back as errors, classified
    /// by [`classify_status`].
    async fn execute(&self, request: &HttpRequest) -> Result<RawPage>;

    /// Drop pooled connections and any cookies picked up along the way.
    async fn reset(&self) {}
}

/// 429 and 5xx are worth retrying; any other non-2xx status means the
/// resource is not there for us.
pub fn classify_status(status: u16, url: &str) -> Option<HarvestError> {
    match status {
        200..=299 => None,
        429 | 500..=599 => Some(HarvestError::Transient(format!("HTTP {status} from {url}"))),
        _ => Some(HarvestError::Parse(format!("HTTP {status} from {url}"))),
    }
}

fn network_error(err: reqwest::Error) -> HarvestError {
    HarvestError::Transient(err.to_string())
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// Pooled reqwest transport. Every adapter-level session reset swaps in a
/// fresh client, so connections and the cookie store start over.
pub struct HttpTransport {
    client: RwLock<reqwest::Client>,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpTransport {
    /// `headers` are sent with every request.
    pub fn new(timeout: Duration, headers: &[(&str, &str)]) -> Result<Self> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HarvestError::Configuration(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HarvestError::Configuration(format!("header {name}: {e}")))?;
            map.insert(name, value);
        }
        let client = Self::build(&map, timeout)?;
        Ok(Self {
            client: RwLock::new(client),
            headers: map,
            timeout,
        })
    }

    fn build(headers: &HeaderMap, timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers.clone())
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Configuration(format!("HTTP client: {e}")))
    }

    fn client(&self) -> reqwest::Client {
        match self.client.read() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<RawPage> {
        let client = self.client();
        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(network_error)?;
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        if let Some(err) = classify_status(status, &url) {
            debug!(url = url.as_str(), status, "Request rejected");
            return Err(err);
        }
        let body = resp.text().await.map_err(network_error)?;
        Ok(RawPage::new(url, status, body))
    }

    async fn reset(&self) {
        match Self::build(&self.headers, self.timeout) {
            Ok(fresh) => {
                let mut guard = match self.client.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard = fresh;
                debug!("HTTP session reset");
            }
            Err(e) => warn!(error = %e, "Could not rebuild HTTP client, keeping the old one"),
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking bridge
// ---------------------------------------------------------------------------

/// A synchronous transport, for client libraries without an async API.
pub trait BlockingTransport: Send + Sync + 'static {
    fn execute(&self, request: &HttpRequest) -> Result<RawPage>;

    fn reset(&self) {}
}

/// Runs a [`BlockingTransport`] on the blocking thread pool so it never
/// stalls the async workers.
pub struct Offloaded<T> {
    inner: Arc<T>,
}

impl<T: BlockingTransport> Offloaded<T> {
    pub fn new(inner: T) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

#[async_trait]
impl<T: BlockingTransport> Transport for Offloaded<T> {
    async fn execute(&self, request: &HttpRequest) -> Result<RawPage> {
        let inner = self.inner.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || inner.execute(&request))
            .await
            .map_err(|e| HarvestError::Transient(format!("blocking transport task failed: {e}")))?
    }

    async fn reset(&self) {
        let inner = self.inner.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || inner.reset()).await {
            warn!(error = %e, "Blocking transport reset failed");
        }
    }
}

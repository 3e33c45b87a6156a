use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use browserless_client::BrowserlessClient;
use harvest_common::{HarvestError, Result};

use crate::browser::browser_error;

/// Cookies as name/value pairs, rendered back into a `Cookie` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar(BTreeMap<String, String>);

impl CookieJar {
    /// Parse a `name=value; name2=value2` header string. Pieces without `=`
    /// are ignored.
    pub fn parse(header: &str) -> Self {
        let cookies = header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
            })
            .collect();
        Self(cookies)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn header(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Supplies the authenticated cookie bag for sources that need a login.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn cookies(&self) -> Result<CookieJar>;

    /// Called on session reset; providers that refresh a login drop it here.
    async fn invalidate(&self) {}
}

/// A fixed cookie bag, typically pasted from a logged-in browser.
pub struct StaticCookies {
    jar: CookieJar,
}

impl StaticCookies {
    pub fn new(jar: CookieJar) -> Self {
        Self { jar }
    }

    /// Build from a raw header string such as `FEED_COOKIES`.
    pub fn from_header(header: &str) -> Result<Self> {
        let jar = CookieJar::parse(header);
        if jar.is_empty() {
            return Err(HarvestError::Configuration("cookie string holds no cookies".into()));
        }
        Ok(Self { jar })
    }
}

#[async_trait]
impl CredentialProvider for StaticCookies {
    async fn cookies(&self) -> Result<CookieJar> {
        Ok(self.jar.clone())
    }
}

const COOKIE_SCRIPT: &str = r#"
module.exports = async ({ page, context }) => {
  await page.goto(context.url, { waitUntil: 'networkidle2' });
  const deadline = Date.now() + context.waitMs;
  let cookies = await page.cookies();
  while (!cookies.some((c) => c.name === context.required) && Date.now() < deadline) {
    await new Promise((r) => setTimeout(r, 500));
    cookies = await page.cookies();
  }
  return {
    data: cookies.map((c) => ({ name: c.name, value: c.value })),
    type: 'application/json',
  };
};
"#;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CookieContext<'a> {
    url: &'a str,
    required: &'a str,
    wait_ms: u64,
}

#[derive(Deserialize)]
struct BrowserCookie {
    name: String,
    value: String,
}

/// Logs in anonymously by loading the site in a real browser and keeping the
/// cookies it was handed. Cached until [`CredentialProvider::invalidate`].
pub struct BrowserCookies {
    client: Arc<BrowserlessClient>,
    url: String,
    required: String,
    cached: Mutex<Option<CookieJar>>,
}

impl BrowserCookies {
    /// `required` names the cookie that must be present for the bag to count.
    pub fn new(client: Arc<BrowserlessClient>, url: impl Into<String>, required: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            required: required.into(),
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialProvider for BrowserCookies {
    async fn cookies(&self) -> Result<CookieJar> {
        let mut cached = self.cached.lock().await;
        if let Some(jar) = cached.as_ref() {
            return Ok(jar.clone());
        }

        let context = CookieContext {
            url: &self.url,
            required: &self.required,
            wait_ms: 15_000,
        };
        let cookies: Vec<BrowserCookie> = self
            .client
            .function(COOKIE_SCRIPT, &context)
            .await
            .map_err(browser_error)?;
        let jar = CookieJar(cookies.into_iter().map(|c| (c.name, c.value)).collect());
        if jar.get(&self.required).is_none() {
            return Err(HarvestError::Transient(format!(
                "browser session did not receive the {} cookie",
                self.required
            )));
        }

        info!(url = self.url.as_str(), cookies = jar.0.len(), "Acquired session cookies");
        *cached = Some(jar.clone());
        Ok(jar)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_renders_a_cookie_header() {
        let jar = CookieJar::parse("SESSION=abc; XSRF-TOKEN=x=y ;junk; =nameless");
        assert_eq!(jar.get("SESSION"), Some("abc"));
        // Only the first '=' separates name from value
        assert_eq!(jar.get("XSRF-TOKEN"), Some("x=y"));
        assert_eq!(jar.header(), "SESSION=abc; XSRF-TOKEN=x=y");
    }

    #[test]
    fn empty_cookie_string_is_rejected() {
        assert!(StaticCookies::from_header(" ; ").is_err());
    }
}

//! Scripted listing navigation through a Browserless instance.
//!
//! Each interaction runs one puppeteer function: load the current listing URL,
//! optionally click the "next block" control, and hand back the rendered HTML,
//! the URL the browser ended up on and any dialog it had to dismiss.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use browserless_client::{BrowserlessClient, BrowserlessError};
use harvest_common::{HarvestError, RawPage, Result};
use harvest_engine::ScriptedSession;

const NAVIGATE_SCRIPT: &str = r#"
module.exports = async ({ page, context }) => {
  let dialog = null;
  page.on('dialog', async (d) => { dialog = d.message(); await d.dismiss(); });
  await page.goto(context.url, { waitUntil: 'domcontentloaded' });
  let clicked = false;
  if (context.clickNext) {
    const next = await page.$(context.nextSelector);
    if (next) {
      await Promise.all([
        page.waitForNavigation({ waitUntil: 'domcontentloaded' }).catch(() => null),
        next.click(),
      ]);
      clicked = true;
    }
  }
  return {
    data: { html: await page.content(), url: page.url(), clicked, dialog },
    type: 'application/json',
  };
};
"#;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NavigateContext<'a> {
    url: &'a str,
    click_next: bool,
    next_selector: &'a str,
}

#[derive(Debug, Deserialize)]
struct Navigated {
    html: String,
    url: String,
    #[serde(default)]
    clicked: bool,
    #[serde(default)]
    dialog: Option<String>,
}

pub(crate) fn browser_error(err: BrowserlessError) -> HarvestError {
    if err.is_transient() {
        HarvestError::Transient(err.to_string())
    } else {
        HarvestError::Parse(err.to_string())
    }
}

/// One browser-driven pagination stream. The listing URL template gets
/// `&page=N` appended for [`ScriptedSession::open`].
pub struct BrowserSession {
    client: Arc<BrowserlessClient>,
    listing_url: String,
    next_selector: String,
    step: u32,
    current_url: Option<String>,
    dialog: Option<String>,
}

impl BrowserSession {
    pub fn new(client: Arc<BrowserlessClient>, listing_url: String, next_selector: &str, step: u32) -> Self {
        Self {
            client,
            listing_url,
            next_selector: next_selector.to_string(),
            step,
            current_url: None,
            dialog: None,
        }
    }

    async fn navigate(&mut self, url: &str, click_next: bool) -> Result<Navigated> {
        let context = NavigateContext {
            url,
            click_next,
            next_selector: &self.next_selector,
        };
        let navigated: Navigated = self
            .client
            .function(NAVIGATE_SCRIPT, &context)
            .await
            .map_err(browser_error)?;
        if let Some(message) = &navigated.dialog {
            debug!(url, message = message.as_str(), "Dialog dismissed during navigation");
            self.dialog = Some(message.clone());
        }
        Ok(navigated)
    }
}

#[async_trait]
impl ScriptedSession for BrowserSession {
    fn step(&self) -> u32 {
        self.step
    }

    async fn open(&mut self, page: u32) -> Result<RawPage> {
        let url = format!("{}&page={page}", self.listing_url);
        let navigated = self.navigate(&url, false).await?;
        self.current_url = Some(navigated.url.clone());
        Ok(RawPage::new(navigated.url, 200, navigated.html))
    }

    async fn next(&mut self) -> Result<Option<RawPage>> {
        let Some(current) = self.current_url.clone() else {
            return Err(HarvestError::Configuration("scripted session used before open".into()));
        };
        let navigated = self.navigate(&current, true).await?;
        if !navigated.clicked {
            return Ok(None);
        }
        self.current_url = Some(navigated.url.clone());
        Ok(Some(RawPage::new(navigated.url, 200, navigated.html)))
    }

    async fn poll_dialog(&mut self) -> Option<String> {
        self.dialog.take()
    }

    async fn close(&mut self) {
        self.current_url = None;
        self.dialog = None;
    }
}

pub mod board;
pub mod browser;
pub mod credentials;
pub mod feed;
pub mod timestamps;
pub mod transport;

pub use board::{BoardEndpoints, DiscussionBoard};
pub use browser::BrowserSession;
pub use credentials::{BrowserCookies, CookieJar, CredentialProvider, StaticCookies};
pub use feed::{CommunityFeed, FeedEndpoints};
pub use transport::{BlockingTransport, HttpRequest, HttpTransport, Method, Offloaded, Transport};

use std::sync::Arc;

use harvest_common::{HarvestConfig, HarvestError, Result};
use harvest_engine::SourceAdapter;

/// The sources this crate knows how to harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Paged discussion board.
    Board,
    /// Cursor-paginated community feed.
    Feed,
}

impl std::str::FromStr for SourceKind {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "board" | board::SOURCE_TAG => Ok(SourceKind::Board),
            "feed" | feed::SOURCE_TAG => Ok(SourceKind::Feed),
            other => Err(HarvestError::Configuration(format!(
                "unknown source {other:?}, expected `board` or `feed`"
            ))),
        }
    }
}

impl SourceKind {
    /// Build the production adapter for this source.
    pub fn adapter(self, config: &HarvestConfig) -> Result<Arc<dyn SourceAdapter>> {
        Ok(match self {
            SourceKind::Board => Arc::new(DiscussionBoard::from_config(config)?),
            SourceKind::Feed => Arc::new(CommunityFeed::from_config(config)?),
        })
    }
}

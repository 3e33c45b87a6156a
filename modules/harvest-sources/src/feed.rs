//! Cursor-paginated community feed adapter.
//!
//! The feed API returns complete comments newest first, keyed by the id of
//! the last comment seen. Listing responses already carry everything a record
//! needs, so parsed comments are kept until the fetcher asks for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::FixedOffset;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::debug;

use harvest_common::{
    Child, Entity, HarvestConfig, HarvestError, ListedItem, ListingPage, PageToken, RawPage, Record, Result,
};
use harvest_engine::{PaginationStyle, SourceAdapter};

use crate::credentials::{CookieJar, CredentialProvider, StaticCookies};
use crate::timestamps::parse_timestamp;
use crate::transport::{HttpRequest, HttpTransport, Transport};

pub const SOURCE_TAG: &str = "toss";

#[derive(Debug, Clone)]
pub struct FeedEndpoints {
    pub comments: String,
    pub origin: String,
}

impl Default for FeedEndpoints {
    fn default() -> Self {
        Self {
            comments: "https://wts-cert-api.tossinvest.com/api/v3/comments".to_string(),
            origin: "https://www.tossinvest.com".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    result: FeedResult,
}

#[derive(Debug, Default, Deserialize)]
struct FeedResult {
    #[serde(default, alias = "replies")]
    comments: FeedBody,
}

#[derive(Debug, Default, Deserialize)]
struct FeedBody {
    #[serde(default)]
    body: Vec<FeedComment>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedAuthor {
    #[serde(default)]
    nickname: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FeedComment {
    #[serde(deserialize_with = "id_string")]
    id: String,
    author: FeedAuthor,
    #[serde(alias = "content")]
    message: String,
    #[serde(alias = "updatedAt")]
    created_at: Option<String>,
    like_count: u64,
    dislike_count: u64,
    reply_count: Option<u32>,
}

/// Ids arrive as numbers or strings depending on the endpoint.
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn decode(body: &str) -> Result<Vec<FeedComment>> {
    let parsed: FeedResponse = serde_json::from_str(body)?;
    Ok(parsed.result.comments.body)
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct CommunityFeed {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    endpoints: FeedEndpoints,
    offset: FixedOffset,
    listed: Mutex<HashMap<(String, String), Record>>,
}

impl CommunityFeed {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialProvider>, offset: FixedOffset) -> Self {
        Self {
            transport,
            credentials,
            endpoints: FeedEndpoints::default(),
            offset,
            listed: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring with the static cookie bag from `FEED_COOKIES`.
    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        let cookies = config
            .feed_cookies
            .as_deref()
            .ok_or_else(|| HarvestError::Configuration("FEED_COOKIES is required for the feed source".into()))?;
        let transport = HttpTransport::new(config.request_timeout, &[("Accept", "application/json")])?;
        Ok(Self::new(
            Arc::new(transport),
            Arc::new(StaticCookies::from_header(cookies)?),
            config.window.offset,
        ))
    }

    pub fn with_endpoints(mut self, endpoints: FeedEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Secondary identifier when reference data has one, else the entity id.
    fn subject_id(entity: &Entity) -> &str {
        if entity.external_code.is_empty() {
            &entity.id
        } else {
            &entity.external_code
        }
    }

    fn authorize(&self, request: HttpRequest, entity: &Entity, jar: &CookieJar) -> Result<HttpRequest> {
        let xsrf = jar
            .get("XSRF-TOKEN")
            .ok_or_else(|| HarvestError::Configuration("cookie bag has no XSRF-TOKEN".into()))?;
        Ok(request
            .header("Cookie", jar.header())
            .header("X-XSRF-TOKEN", xsrf)
            .header("Origin", self.endpoints.origin.clone())
            .header(
                "Referer",
                format!("{}/stocks/A{}/community", self.endpoints.origin, entity.id),
            ))
    }

    fn to_record(&self, entity: &Entity, comment: &FeedComment) -> Option<Record> {
        let written_at = comment
            .created_at
            .as_deref()
            .and_then(|ts| parse_timestamp(ts, self.offset))?;
        Some(Record {
            source_id: comment.id.clone(),
            entity_id: entity.id.clone(),
            author_name: comment.author.nickname.clone(),
            written_at,
            body: comment.message.clone(),
            like_count: comment.like_count,
            dislike_count: comment.dislike_count,
            reply_count: comment.reply_count,
            children: Vec::new(),
        })
    }
}

#[async_trait]
impl SourceAdapter for CommunityFeed {
    fn source(&self) -> &str {
        SOURCE_TAG
    }

    fn pagination(&self) -> PaginationStyle {
        PaginationStyle::Cursor
    }

    async fn fetch_listing(&self, entity: &Entity, token: &PageToken) -> Result<RawPage> {
        let PageToken::Cursor(cursor) = token else {
            return Err(HarvestError::Configuration(format!("feed listing cannot use {token}")));
        };
        let mut body = json!({
            "subjectId": Self::subject_id(entity),
            "subjectType": "STOCK",
            "commentSortType": "RECENT",
        });
        if let Some(cursor) = cursor {
            body["commentId"] = json!(cursor);
        }

        let jar = self.credentials.cookies().await?;
        let request = self.authorize(HttpRequest::post_json(&self.endpoints.comments, body), entity, &jar)?;
        self.transport.execute(&request).await
    }

    fn parse_listing(&self, entity: &Entity, _token: &PageToken, page: &RawPage) -> Result<ListingPage> {
        let comments = decode(&page.body)?;
        let mut listed = match self.listed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut items = Vec::with_capacity(comments.len());
        for comment in comments.iter().filter(|c| !c.id.is_empty()) {
            let record = self.to_record(entity, comment);
            items.push(ListedItem::new(comment.id.clone(), record.as_ref().map(|r| r.written_at)));
            if let Some(record) = record {
                listed.insert((entity.id.clone(), comment.id.clone()), record);
            }
        }

        let next = items.last().map(|item| PageToken::Cursor(Some(item.id.clone())));
        Ok(ListingPage { items, next })
    }

    async fn fetch_detail(&self, entity: &Entity, id: &str) -> Result<Option<Record>> {
        let mut listed = match self.listed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let record = listed.remove(&(entity.id.clone(), id.to_string()));
        if record.is_none() {
            debug!(entity = entity.id.as_str(), id, "Comment was listed without a usable timestamp");
        }
        Ok(record)
    }

    async fn fetch_children(&self, entity: &Entity, id: &str) -> Result<Vec<Child>> {
        let jar = self.credentials.cookies().await?;
        let url = format!("{}/{id}/replies", self.endpoints.comments);
        let request = self.authorize(HttpRequest::get(url), entity, &jar)?;
        let page = self.transport.execute(&request).await?;
        Ok(decode(&page.body)?
            .into_iter()
            .map(|c| Child {
                author_name: c.author.nickname,
                written_at: c.created_at.as_deref().and_then(|ts| parse_timestamp(ts, self.offset)),
                body: c.message,
                like_count: c.like_count,
                dislike_count: c.dislike_count,
            })
            .collect())
    }

    async fn reset_session(&self) {
        self.transport.reset().await;
        self.credentials.invalidate().await;
    }
}

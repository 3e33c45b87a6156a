//! Paged discussion board adapter.
//!
//! Listing pages are server-rendered HTML tables. Each post's detail lives in
//! the JSON state embedded in the mobile page, and replies come from a
//! separate JSONP comment API.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use browserless_client::BrowserlessClient;
use harvest_common::{
    Child, Entity, HarvestConfig, HarvestError, ListedItem, ListingPage, PageToken, RawPage, Record, Result,
};
use harvest_engine::{ScriptedSession, SourceAdapter};

use crate::browser::{browser_error, BrowserSession};
use crate::timestamps::{local_to_utc, parse_timestamp};
use crate::transport::{HttpRequest, HttpTransport, Transport};

pub const SOURCE_TAG: &str = "naver";

/// Listing pages skipped by one click on the "next block" control.
const NAVIGATION_STEP: u32 = 10;
const NEXT_CONTROL: &str = "table.Nnavi td.pgR a";

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table.type2").expect("valid selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tbody tr").expect("valid selector"));
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("valid selector"));
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));
static NEXT_DATA: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script#__NEXT_DATA__").expect("valid selector"));
static JSONP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^[^(]*\((.*)\)\s*;?\s*$").expect("valid regex"));

/// Base URLs, overridable so tests can point at canned responses.
#[derive(Debug, Clone)]
pub struct BoardEndpoints {
    pub board: String,
    pub mobile: String,
    pub replies: String,
}

impl Default for BoardEndpoints {
    fn default() -> Self {
        Self {
            board: "https://finance.naver.com".to_string(),
            mobile: "https://m.stock.naver.com".to_string(),
            replies: "https://apis.naver.com/commentBox/cbox/web_naver_list_jsonp.json".to_string(),
        }
    }
}

pub struct DiscussionBoard {
    transport: Arc<dyn Transport>,
    endpoints: BoardEndpoints,
    offset: FixedOffset,
    browser: Option<Arc<BrowserlessClient>>,
}

impl DiscussionBoard {
    pub fn new(transport: Arc<dyn Transport>, offset: FixedOffset) -> Self {
        Self {
            transport,
            endpoints: BoardEndpoints::default(),
            offset,
            browser: None,
        }
    }

    /// Production wiring: pooled HTTP transport, plus scripted navigation
    /// when a Browserless instance is configured.
    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.request_timeout, &[("Cookie", "hide_cleanbot_contents=off")])?;
        let mut board = Self::new(Arc::new(transport), config.window.offset);
        if let Some(url) = &config.browserless_url {
            let client = BrowserlessClient::new(
                url,
                config.browserless_token.as_deref(),
                config.request_timeout.max(Duration::from_secs(60)),
            )
            .map_err(browser_error)?;
            board = board.with_browser(Arc::new(client));
        }
        Ok(board)
    }

    pub fn with_endpoints(mut self, endpoints: BoardEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_browser(mut self, client: Arc<BrowserlessClient>) -> Self {
        self.browser = Some(client);
        self
    }

    fn listing_url(&self, entity: &Entity) -> String {
        format!("{}/item/board.naver?code={}", self.endpoints.board, entity.id)
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }
}

#[async_trait]
impl SourceAdapter for DiscussionBoard {
    fn source(&self) -> &str {
        SOURCE_TAG
    }

    fn block_markers(&self) -> Vec<String> {
        vec!["error_content".to_string(), "페이지를 찾을 수 없습니다".to_string()]
    }

    async fn fetch_listing(&self, entity: &Entity, token: &PageToken) -> Result<RawPage> {
        let PageToken::Page(page) = token else {
            return Err(HarvestError::Configuration(format!("board listing cannot use {token}")));
        };
        let url = format!("{}&page={page}", self.listing_url(entity));
        self.transport.execute(&HttpRequest::get(url)).await
    }

    fn parse_listing(&self, _entity: &Entity, _token: &PageToken, page: &RawPage) -> Result<ListingPage> {
        let items = parse_listing_html(&page.body, &self.endpoints.board, self.offset, self.today())?;
        Ok(ListingPage { items, next: None })
    }

    async fn fetch_detail(&self, entity: &Entity, id: &str) -> Result<Option<Record>> {
        let url = format!("{}/pc/domestic/stock/{}/discussion/{id}", self.endpoints.mobile, entity.id);
        let page = self.transport.execute(&HttpRequest::get(url)).await?;
        let Some(post) = parse_detail_html(&page.body)? else {
            debug!(entity = entity.id.as_str(), id, "No discussion payload in detail page");
            return Ok(None);
        };
        post.into_record(entity, id, self.offset).map(Some)
    }

    async fn fetch_children(&self, entity: &Entity, id: &str) -> Result<Vec<Child>> {
        let request = HttpRequest::get(&self.endpoints.replies)
            .query("ticket", "finance")
            .query("templateId", "community")
            .query("pool", "cbox12")
            .query("lang", "ko")
            .query("country", "KR")
            .query("objectId", id)
            .query("pageSize", "100")
            .query("indexSize", "10")
            .query("listType", "OBJECT")
            .query("pageType", "more")
            .query("page", "1")
            .query("initialize", "true")
            .query("followSize", "5")
            .query("useAltSort", "true")
            .query("replyPageSize", "5")
            .query("_callback", "jQuery")
            .header(
                "Referer",
                format!("{}/domestic/stock/{}/discussion/{id}", self.endpoints.mobile, entity.id),
            );
        let page = self.transport.execute(&request).await?;
        parse_replies(&page.body, self.offset)
    }

    async fn reset_session(&self) {
        self.transport.reset().await;
    }

    async fn scripted(&self, entity: &Entity) -> Result<Option<Box<dyn ScriptedSession>>> {
        Ok(self.browser.as_ref().map(|client| {
            Box::new(BrowserSession::new(
                client.clone(),
                self.listing_url(entity),
                NEXT_CONTROL,
                NAVIGATION_STEP,
            )) as Box<dyn ScriptedSession>
        }))
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Extract `(nid, listed date)` pairs from a listing page. Separator rows and
/// moderation placeholders are skipped; a row with an unreadable date is kept
/// with `posted_at: None`.
pub fn parse_listing_html(html: &str, base: &str, offset: FixedOffset, today: NaiveDate) -> Result<Vec<ListedItem>> {
    let base = Url::parse(base).map_err(|e| HarvestError::Configuration(format!("board base URL: {e}")))?;
    let doc = Html::parse_document(html);
    let table = doc
        .select(&TABLE)
        .next()
        .ok_or_else(|| HarvestError::Parse("listing table not found".into()))?;

    let mut items = Vec::new();
    for row in table.select(&ROW) {
        if row.value().classes().any(|c| c == "blank_row") || row.html().contains("u_cbox_cleanbot") {
            continue;
        }
        let cells: Vec<ElementRef> = row.select(&CELL).collect();
        if cells.len() < 6 {
            continue;
        }
        let Some(nid) = cells[1]
            .select(&LINK)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| post_id(&base, href))
        else {
            continue;
        };
        let date_text: String = cells[0].text().collect();
        items.push(ListedItem::new(nid, parse_listing_date(date_text.trim(), offset, today)));
    }
    Ok(items)
}

fn post_id(base: &Url, href: &str) -> Option<String> {
    let url = base.join(href).ok()?;
    let nid = url.query_pairs().find(|(k, _)| k == "nid").map(|(_, v)| v.into_owned())?;
    (!nid.is_empty() && nid.bytes().all(|b| b.is_ascii_digit())).then_some(nid)
}

/// `YYYY.MM.DD HH:MM`, `YYYY.MM.DD`, or a bare `HH:MM` meaning today.
pub fn parse_listing_date(text: &str, offset: FixedOffset, today: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y.%m.%d %H:%M")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y.%m.%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .or_else(|| NaiveTime::parse_from_str(text, "%H:%M").ok().map(|t| today.and_time(t)))?;
    local_to_utc(naive, offset)
}

// ---------------------------------------------------------------------------
// Detail
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct NextData {
    #[serde(default)]
    props: Props,
}

#[derive(Debug, Default, Deserialize)]
struct Props {
    #[serde(rename = "pageProps", default)]
    page_props: PageProps,
}

#[derive(Debug, Default, Deserialize)]
struct PageProps {
    #[serde(rename = "dehydratedState", default)]
    dehydrated_state: DehydratedState,
}

#[derive(Debug, Default, Deserialize)]
struct DehydratedState {
    #[serde(default)]
    queries: Vec<Query>,
}

#[derive(Debug, Default, Deserialize)]
struct Query {
    #[serde(rename = "queryKey", default)]
    query_key: Vec<serde_json::Value>,
    #[serde(default)]
    state: QueryState,
}

#[derive(Debug, Default, Deserialize)]
struct QueryState {
    #[serde(default)]
    data: serde_json::Value,
}

impl Query {
    fn is_discussion_detail(&self) -> bool {
        self.query_key
            .first()
            .and_then(|key| key.get("url"))
            .and_then(serde_json::Value::as_str)
            == Some("/discussion/detail")
    }
}

#[derive(Debug, Default, Deserialize)]
struct Writer {
    #[serde(default)]
    nickname: String,
}

/// The discussion post as embedded in the mobile page.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Discussion {
    title: Option<String>,
    subject: Option<String>,
    writer: Writer,
    content_html: Option<String>,
    content_json_sw_replaced: Option<String>,
    recommend_count: u64,
    not_recommend_count: u64,
    written_at: Option<String>,
    comment_count: Option<u32>,
}

impl Discussion {
    fn title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.subject.as_deref())
            .unwrap_or_default()
    }

    /// Reduced HTML body, else the summary inside the JSON body, else the
    /// JSON body verbatim.
    fn text(&self) -> String {
        if let Some(html) = self.content_html.as_deref().filter(|h| !h.trim().is_empty()) {
            return html_to_text(html);
        }
        let Some(raw) = self.content_json_sw_replaced.as_deref() else {
            return String::new();
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(json) => json
                .get("contentSummary")
                .and_then(serde_json::Value::as_str)
                .map(html_to_text)
                .unwrap_or_else(|| raw.to_string()),
            Err(_) => raw.to_string(),
        }
    }

    fn into_record(self, entity: &Entity, id: &str, offset: FixedOffset) -> Result<Record> {
        let written_at = self
            .written_at
            .as_deref()
            .and_then(|ts| parse_timestamp(ts, offset))
            .ok_or_else(|| HarvestError::Parse(format!("post {id} has no readable timestamp")))?;
        Ok(Record {
            source_id: id.to_string(),
            entity_id: entity.id.clone(),
            author_name: self.writer.nickname.clone(),
            written_at,
            body: format!("{}\n\n{}", self.title(), self.text()),
            like_count: self.recommend_count,
            dislike_count: self.not_recommend_count,
            reply_count: self.comment_count,
            children: Vec::new(),
        })
    }
}

fn html_to_text(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 10_000).unwrap_or_default();
    text.lines().map(str::trim_end).collect::<Vec<_>>().join("\n").trim().to_string()
}

/// `Ok(None)` when the page has no embedded state or no discussion in it,
/// which is how deleted posts look.
pub fn parse_detail_html(html: &str) -> Result<Option<Discussion>> {
    let doc = Html::parse_document(html);
    let Some(script) = doc.select(&NEXT_DATA).next() else {
        return Ok(None);
    };
    let payload: String = script.text().collect();
    let data: NextData = serde_json::from_str(&payload)?;

    let Some(query) = data
        .props
        .page_props
        .dehydrated_state
        .queries
        .into_iter()
        .find(Query::is_discussion_detail)
    else {
        return Ok(None);
    };
    match query.state.data.get("result") {
        Some(result) if !result.is_null() => Ok(Some(serde_json::from_value(result.clone())?)),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct CommentBox {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: CommentBoxResult,
}

#[derive(Debug, Default, Deserialize)]
struct CommentBoxResult {
    #[serde(rename = "commentList", default)]
    comment_list: Vec<Comment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Comment {
    user_name: String,
    contents: String,
    reg_time: Option<String>,
    sympathy_count: u64,
    antipathy_count: u64,
}

/// Unwrap the JSONP callback and read the comment list. A response that
/// reports `success: false` yields no replies.
pub fn parse_replies(body: &str, offset: FixedOffset) -> Result<Vec<Child>> {
    let json = JSONP
        .captures(body.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(body);
    let parsed: CommentBox = serde_json::from_str(json)?;
    if !parsed.success {
        warn!("Comment API reported failure, treating as no replies");
        return Ok(Vec::new());
    }
    Ok(parsed
        .result
        .comment_list
        .into_iter()
        .map(|c| Child {
            author_name: c.user_name,
            written_at: c.reg_time.as_deref().and_then(|ts| parse_timestamp(ts, offset)),
            body: c.contents,
            like_count: c.sympathy_count,
            dislike_count: c.antipathy_count,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 3).unwrap()
    }

    #[test]
    fn listing_dates_in_every_shape() {
        let full = parse_listing_date("2025.01.02 10:31", kst(), today()).unwrap();
        assert_eq!(full.to_rfc3339(), "2025-01-02T01:31:00+00:00");

        let date_only = parse_listing_date("2025.01.02", kst(), today()).unwrap();
        assert_eq!(date_only.to_rfc3339(), "2025-01-01T15:00:00+00:00");

        let time_only = parse_listing_date("09:15", kst(), today()).unwrap();
        assert_eq!(time_only.with_timezone(&kst()).date_naive(), today());

        assert!(parse_listing_date("어제", kst(), today()).is_none());
    }

    #[test]
    fn post_id_comes_from_the_nid_query_parameter() {
        let base = Url::parse("https://finance.naver.com").unwrap();
        assert_eq!(
            post_id(&base, "/item/board_read.naver?code=005930&nid=301&st=&sw=&page=1"),
            Some("301".to_string())
        );
        assert_eq!(post_id(&base, "/item/board_read.naver?code=005930"), None);
        assert_eq!(post_id(&base, "/item/board_read.naver?nid=abc"), None);
    }

    #[test]
    fn body_falls_back_from_html_to_json_summary_to_raw() {
        let mut post = Discussion {
            title: Some("Title".into()),
            content_html: Some("<p>hello <b>world</b></p>".into()),
            ..Default::default()
        };
        let text = post.text();
        assert!(text.starts_with("hello") && text.contains("world"));
        assert!(!text.contains('<'));

        post.content_html = Some("  ".into());
        post.content_json_sw_replaced = Some(r#"{"contentSummary": "summary text"}"#.into());
        assert_eq!(post.text(), "summary text");

        post.content_json_sw_replaced = Some("not json".into());
        assert_eq!(post.text(), "not json");
    }

    #[test]
    fn subject_stands_in_for_a_missing_title() {
        let post = Discussion {
            subject: Some("Subject".into()),
            ..Default::default()
        };
        assert_eq!(post.title(), "Subject");
    }

    #[test]
    fn jsonp_wrapper_is_stripped() {
        let body = r#"jQuery123({"success": true, "result": {"commentList": [
            {"userName": "kim", "contents": "agree", "regTime": "2025-01-02T10:00:00+0900",
             "sympathyCount": 3, "antipathyCount": 1}
        ]}});"#;
        let children = parse_replies(body, kst()).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].author_name, "kim");
        assert_eq!(children[0].like_count, 3);
        assert!(children[0].written_at.is_some());
    }

    #[test]
    fn failed_comment_api_means_no_replies() {
        let children = parse_replies(r#"jQuery({"success": false})"#, kst()).unwrap();
        assert!(children.is_empty());
    }
}

//! The community feed adapter: cursor requests, credentials and a full run.

mod common;

use std::sync::Arc;
use std::time::Duration;

use harvest_common::{Entity, ErrorKind, HarvestConfig, PageToken, PartitionKey};
use harvest_engine::testing::{day, kst, window, MemoryArtifactStore};
use harvest_engine::{Harvester, SourceAdapter};
use harvest_sources::{CommunityFeed, CookieJar, FeedEndpoints, StaticCookies};

use common::FakeTransport;

const API: &str = "https://api.test/comments";
const ORIGIN: &str = "https://feed.test";

fn batch(comments: &[(u64, &str, u32)]) -> String {
    let body: Vec<serde_json::Value> = comments
        .iter()
        .map(|(id, ts, replies)| {
            serde_json::json!({
                "id": id,
                "author": {"nickname": format!("user{id}")},
                "message": format!("comment {id}"),
                "createdAt": ts,
                "likeCount": 2,
                "replyCount": replies
            })
        })
        .collect();
    serde_json::json!({"result": {"comments": {"body": body}}}).to_string()
}

fn feed(transport: Arc<FakeTransport>, cookies: &str) -> CommunityFeed {
    CommunityFeed::new(
        transport,
        Arc::new(StaticCookies::new(CookieJar::parse(cookies))),
        kst(),
    )
    .with_endpoints(FeedEndpoints {
        comments: API.into(),
        origin: ORIGIN.into(),
    })
}

fn cursor_of(request: &harvest_sources::HttpRequest) -> Option<String> {
    request
        .json
        .as_ref()
        .and_then(|b| b.get("commentId"))
        .and_then(|c| c.as_str())
        .map(String::from)
}

#[tokio::test(start_paused = true)]
async fn feed_walks_the_cursor_until_the_window_start() {
    let transport = Arc::new(FakeTransport::new(|req| {
        if req.url == format!("{API}/500/replies") {
            return Some(batch(&[(900, "2025-01-03T08:00:00+09:00", 0)]));
        }
        match cursor_of(req).as_deref() {
            None => Some(batch(&[
                (501, "2025-01-04T09:00:00+09:00", 0),
                (500, "2025-01-03T07:00:00+09:00", 1),
            ])),
            Some("500") => Some(batch(&[
                (499, "2025-01-02T12:00:00+09:00", 0),
                (498, "2024-12-31T12:00:00+09:00", 0),
            ])),
            _ => None,
        }
    }));
    let store = Arc::new(MemoryArtifactStore::new("toss"));
    let config = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .detail_stagger(Duration::ZERO)
        .build();
    let adapter = Arc::new(feed(transport.clone(), "XSRF-TOKEN=tok; SESSION=s"));

    let summary = Harvester::new(adapter, store.clone(), config)
        .run(&[Entity::new("005930").with_external_code("KR7005930003")])
        .await
        .unwrap();

    assert_eq!(summary.records_ingested, 2);
    let jan3 = store.rows("005930", PartitionKey::new(day("2025-01-03")));
    assert_eq!(jan3[0].source_id, "500");
    assert_eq!(jan3[0].children.len(), 1);
    assert_eq!(jan3[0].children[0].body, "comment 900");
    assert_eq!(store.rows("005930", PartitionKey::new(day("2025-01-02")))[0].source_id, "499");

    let listing_requests: Vec<_> = transport.requests().into_iter().filter(|r| r.url == API).collect();
    assert_eq!(listing_requests.len(), 2);
    let first = &listing_requests[0];
    assert_eq!(first.json.as_ref().unwrap()["subjectId"], "KR7005930003");
    assert_eq!(first.header_value("X-XSRF-TOKEN"), Some("tok"));
    assert_eq!(first.header_value("Cookie"), Some("SESSION=s; XSRF-TOKEN=tok"));
    assert_eq!(first.header_value("Origin"), Some(ORIGIN));
    assert_eq!(cursor_of(&listing_requests[1]).as_deref(), Some("500"));
}

#[tokio::test]
async fn missing_xsrf_token_fails_the_listing_request() {
    let transport = Arc::new(FakeTransport::new(|_| Some(batch(&[]))));
    let adapter = feed(transport.clone(), "SESSION=s");

    let err = adapter
        .fetch_listing(&Entity::new("005930"), &PageToken::Cursor(None))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn details_come_from_the_listing_and_are_served_once() {
    let adapter = feed(Arc::new(FakeTransport::new(|_| None)), "XSRF-TOKEN=tok");
    let entity = Entity::new("005930");
    let raw = harvest_common::RawPage::new(API, 200, batch(&[(7, "2025-01-02T10:00:00+09:00", 3)]));

    let page = adapter.parse_listing(&entity, &PageToken::Cursor(None), &raw).unwrap();
    assert_eq!(page.next, Some(PageToken::Cursor(Some("7".into()))));

    let record = adapter.fetch_detail(&entity, "7").await.unwrap().unwrap();
    assert_eq!(record.author_name, "user7");
    assert_eq!(record.reply_count, Some(3));
    assert!(adapter.fetch_detail(&entity, "7").await.unwrap().is_none());
}

#[tokio::test]
async fn paged_tokens_are_rejected() {
    let adapter = feed(Arc::new(FakeTransport::new(|_| None)), "XSRF-TOKEN=tok");
    let err = adapter
        .fetch_listing(&Entity::new("005930"), &PageToken::Page(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

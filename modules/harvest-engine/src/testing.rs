//! Test doubles for the engine's seams.
//!
//! `MockSource` answers listing, detail and child requests from canned data and
//! records what was asked of it. `MemoryArtifactStore` keeps artifacts in a map.
//! Enabled for dependents through the `test-support` feature.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};

use harvest_common::{
    Child, CrawlWindow, Entity, HarvestError, ListedItem, ListingPage, PageToken, PartitionKey, RawPage, Record,
    Result,
};

use crate::store::artifact_name;
use crate::traits::{ArtifactStore, PaginationStyle, ScriptedSession, SourceAdapter};

pub const DEFAULT_ENTITY: &str = "ENT";

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

pub fn day(date: &str) -> NaiveDate {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap()
}

pub fn window(start: &str, end: &str) -> CrawlWindow {
    CrawlWindow::new(day(start), day(end), kst())
}

/// `hour:00` local (+09:00) on `date`, as UTC.
pub fn at(date: &str, hour: u32) -> DateTime<Utc> {
    kst()
        .from_local_datetime(&day(date).and_hms_opt(hour, 0, 0).unwrap())
        .unwrap()
        .with_timezone(&Utc)
}

pub fn item(id: &str, date: &str) -> ListedItem {
    ListedItem::new(id, Some(at(date, 12)))
}

/// A record with no replies reported, so no child fetch is made.
pub fn record(entity_id: &str, id: &str, written_at: DateTime<Utc>) -> Record {
    Record {
        source_id: id.to_string(),
        entity_id: entity_id.to_string(),
        author_name: format!("author-{id}"),
        written_at,
        body: format!("body of {id}"),
        like_count: 1,
        dislike_count: 0,
        reply_count: Some(0),
        children: Vec::new(),
    }
}

pub fn child(body: &str) -> Child {
    Child {
        author_name: "replier".to_string(),
        written_at: None,
        body: body.to_string(),
        like_count: 0,
        dislike_count: 0,
    }
}

// ---------------------------------------------------------------------------
// Listing body format
// ---------------------------------------------------------------------------

const NEXT_MARKER: &str = "@next";

/// Encode items one per line as `id|rfc3339` (`id|` when undated).
pub fn listing_body(items: &[ListedItem]) -> String {
    items
        .iter()
        .map(|item| {
            let ts = item.posted_at.map(|t| t.to_rfc3339()).unwrap_or_default();
            format!("{}|{ts}", item.id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Like [`listing_body`], with an explicit next cursor.
pub fn listing_body_with_next(items: &[ListedItem], next: &str) -> String {
    let mut body = listing_body(items);
    if !body.is_empty() {
        body.push('\n');
    }
    body.push_str(&format!("{NEXT_MARKER}|{next}"));
    body
}

fn parse_body(body: &str) -> Result<ListingPage> {
    let mut page = ListingPage::default();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let (id, rest) = line
            .split_once('|')
            .ok_or_else(|| HarvestError::Parse(format!("not a listing row: {line:?}")))?;
        if id == NEXT_MARKER {
            page.next = Some(PageToken::Cursor(Some(rest.to_string())));
            continue;
        }
        let posted_at = if rest.is_empty() {
            None
        } else {
            Some(
                DateTime::parse_from_rfc3339(rest)
                    .map_err(|e| HarvestError::Parse(e.to_string()))?
                    .with_timezone(&Utc),
            )
        };
        page.items.push(ListedItem::new(id, posted_at));
    }
    Ok(page)
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MockResponse {
    Body(String),
    Transient,
    /// Never resolves; the caller's timeout has to fire.
    Hang,
}

#[derive(Default)]
struct Calls {
    listings: Vec<(String, PageToken)>,
    details: HashMap<String, u32>,
    children: HashMap<String, u32>,
    resets: u32,
    in_flight: usize,
    max_in_flight: usize,
    children_in_flight: usize,
    max_children_in_flight: usize,
    scripted: Vec<String>,
}

pub struct MockSource {
    source: String,
    style: PaginationStyle,
    markers: Vec<String>,
    responses: Mutex<HashMap<(String, PageToken), VecDeque<MockResponse>>>,
    records: HashMap<(String, String), Record>,
    detail_failures: Mutex<HashMap<String, u32>>,
    children: HashMap<String, Vec<Child>>,
    failing_children: Vec<String>,
    detail_delay: Duration,
    scripted: Option<ScriptedPlan>,
    calls: Arc<Mutex<Calls>>,
}

impl MockSource {
    fn with_style(style: PaginationStyle) -> Self {
        Self {
            source: "mock".to_string(),
            style,
            markers: Vec::new(),
            responses: Mutex::new(HashMap::new()),
            records: HashMap::new(),
            detail_failures: Mutex::new(HashMap::new()),
            children: HashMap::new(),
            failing_children: Vec::new(),
            detail_delay: Duration::ZERO,
            scripted: None,
            calls: Arc::new(Mutex::new(Calls::default())),
        }
    }

    pub fn paged() -> Self {
        Self::with_style(PaginationStyle::Paged)
    }

    pub fn cursor() -> Self {
        Self::with_style(PaginationStyle::Cursor)
    }

    pub fn entity(&self) -> Entity {
        Entity::new(DEFAULT_ENTITY)
    }

    pub fn markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// Queue responses for `token` on the default entity. The last response
    /// repeats once the queue is drained.
    pub fn respond(self, token: PageToken, responses: Vec<MockResponse>) -> Self {
        self.respond_for(DEFAULT_ENTITY, token, responses)
    }

    pub fn respond_for(self, entity_id: &str, token: PageToken, responses: Vec<MockResponse>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((entity_id.to_string(), token), responses.into());
        self
    }

    pub fn page(self, n: u32, items: &[ListedItem]) -> Self {
        self.respond(PageToken::Page(n), vec![MockResponse::Body(listing_body(items))])
    }

    pub fn page_for(self, entity_id: &str, n: u32, items: &[ListedItem]) -> Self {
        self.respond_for(entity_id, PageToken::Page(n), vec![MockResponse::Body(listing_body(items))])
    }

    pub fn batch(self, cursor: Option<&str>, items: &[ListedItem]) -> Self {
        self.respond(
            PageToken::Cursor(cursor.map(str::to_string)),
            vec![MockResponse::Body(listing_body(items))],
        )
    }

    pub fn record(mut self, record: Record) -> Self {
        self.records
            .insert((record.entity_id.clone(), record.source_id.clone()), record);
        self
    }

    /// The next `failures` detail requests for `id` fail transiently.
    pub fn flaky_detail(self, id: &str, failures: u32) -> Self {
        self.detail_failures.lock().unwrap().insert(id.to_string(), failures);
        self
    }

    pub fn children(mut self, id: &str, children: Vec<Child>) -> Self {
        self.children.insert(id.to_string(), children);
        self
    }

    pub fn failing_children(mut self, id: &str) -> Self {
        self.failing_children.push(id.to_string());
        self
    }

    pub fn detail_delay(mut self, delay: Duration) -> Self {
        self.detail_delay = delay;
        self
    }

    pub fn scripted(mut self, plan: ScriptedPlan) -> Self {
        self.scripted = Some(plan);
        self
    }

    // --- Instrumentation ---

    fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }

    pub fn listing_requests(&self, token: &PageToken) -> usize {
        self.calls().listings.iter().filter(|(_, t)| t == token).count()
    }

    /// Every listing position requested, in order.
    pub fn requested(&self) -> Vec<PageToken> {
        self.calls().listings.iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn requested_for(&self, entity_id: &str) -> Vec<PageToken> {
        self.calls()
            .listings
            .iter()
            .filter(|(e, _)| e == entity_id)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn detail_calls(&self, id: &str) -> u32 {
        self.calls().details.get(id).copied().unwrap_or(0)
    }

    pub fn child_calls(&self, id: &str) -> u32 {
        self.calls().children.get(id).copied().unwrap_or(0)
    }

    pub fn resets(&self) -> u32 {
        self.calls().resets
    }

    pub fn max_in_flight(&self) -> usize {
        self.calls().max_in_flight
    }

    pub fn max_children_in_flight(&self) -> usize {
        self.calls().max_children_in_flight
    }

    /// Scripted interactions, e.g. `["open 3", "next 5"]`.
    pub fn scripted_log(&self) -> Vec<String> {
        self.calls().scripted.clone()
    }
}

/// Decrements an in-flight counter when dropped.
struct InFlight {
    calls: Arc<Mutex<Calls>>,
    children: bool,
}

impl InFlight {
    fn enter(calls: &Arc<Mutex<Calls>>, children: bool) -> Self {
        let mut c = calls.lock().unwrap();
        if children {
            c.children_in_flight += 1;
            c.max_children_in_flight = c.max_children_in_flight.max(c.children_in_flight);
        } else {
            c.in_flight += 1;
            c.max_in_flight = c.max_in_flight.max(c.in_flight);
        }
        Self {
            calls: calls.clone(),
            children,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut c = self.calls.lock().unwrap();
        if self.children {
            c.children_in_flight -= 1;
        } else {
            c.in_flight -= 1;
        }
    }
}

#[async_trait]
impl SourceAdapter for MockSource {
    fn source(&self) -> &str {
        &self.source
    }

    fn pagination(&self) -> PaginationStyle {
        self.style
    }

    fn block_markers(&self) -> Vec<String> {
        self.markers.clone()
    }

    async fn fetch_listing(&self, entity: &Entity, token: &PageToken) -> Result<RawPage> {
        self.calls().listings.push((entity.id.clone(), token.clone()));
        let response = {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&(entity.id.clone(), token.clone())) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match response {
            Some(MockResponse::Body(body)) => Ok(RawPage::new(token.to_string(), 200, body)),
            Some(MockResponse::Transient) => Err(HarvestError::Transient(format!("{token} reset"))),
            Some(MockResponse::Hang) => std::future::pending().await,
            None => Ok(RawPage::new(token.to_string(), 200, "")),
        }
    }

    fn parse_listing(&self, _entity: &Entity, _token: &PageToken, page: &RawPage) -> Result<ListingPage> {
        parse_body(&page.body)
    }

    async fn fetch_detail(&self, entity: &Entity, id: &str) -> Result<Option<Record>> {
        *self.calls().details.entry(id.to_string()).or_insert(0) += 1;
        let _in_flight = InFlight::enter(&self.calls, false);
        if !self.detail_delay.is_zero() {
            tokio::time::sleep(self.detail_delay).await;
        }
        {
            let mut failures = self.detail_failures.lock().unwrap();
            if let Some(left) = failures.get_mut(id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(HarvestError::Transient(format!("detail {id} reset")));
                }
            }
        }
        Ok(self.records.get(&(entity.id.clone(), id.to_string())).cloned())
    }

    async fn fetch_children(&self, _entity: &Entity, id: &str) -> Result<Vec<Child>> {
        *self.calls().children.entry(id.to_string()).or_insert(0) += 1;
        let _in_flight = InFlight::enter(&self.calls, true);
        if !self.detail_delay.is_zero() {
            tokio::time::sleep(self.detail_delay).await;
        }
        if self.failing_children.iter().any(|f| f == id) {
            return Err(HarvestError::Transient(format!("children {id} reset")));
        }
        Ok(self.children.get(id).cloned().unwrap_or_default())
    }

    async fn reset_session(&self) {
        self.calls().resets += 1;
    }

    async fn scripted(&self, _entity: &Entity) -> Result<Option<Box<dyn ScriptedSession>>> {
        Ok(self.scripted.clone().map(|plan| {
            Box::new(MockSession {
                plan,
                current: 0,
                pending_dialog: None,
                calls: self.calls.clone(),
            }) as Box<dyn ScriptedSession>
        }))
    }
}

// ---------------------------------------------------------------------------
// Scripted navigation double
// ---------------------------------------------------------------------------

/// Pages served by a scripted session, keyed by page index.
#[derive(Debug, Clone)]
pub struct ScriptedPlan {
    step: u32,
    pages: BTreeMap<u32, String>,
    dialog_at: Option<(u32, String)>,
}

impl ScriptedPlan {
    pub fn new(step: u32) -> Self {
        Self {
            step,
            pages: BTreeMap::new(),
            dialog_at: None,
        }
    }

    pub fn page(mut self, n: u32, items: &[ListedItem]) -> Self {
        self.pages.insert(n, listing_body(items));
        self
    }

    pub fn raw_page(mut self, n: u32, body: &str) -> Self {
        self.pages.insert(n, body.to_string());
        self
    }

    /// Arriving at page `n` raises an interstitial dialog.
    pub fn dialog_at(mut self, n: u32, message: &str) -> Self {
        self.dialog_at = Some((n, message.to_string()));
        self
    }

    fn last_page(&self) -> u32 {
        let last_listed = self.pages.keys().next_back().copied().unwrap_or(0);
        let dialog = self.dialog_at.as_ref().map(|(n, _)| *n).unwrap_or(0);
        last_listed.max(dialog)
    }
}

struct MockSession {
    plan: ScriptedPlan,
    current: u32,
    pending_dialog: Option<String>,
    calls: Arc<Mutex<Calls>>,
}

impl MockSession {
    fn land(&mut self, page: u32) -> RawPage {
        self.current = page;
        if let Some((n, message)) = &self.plan.dialog_at {
            if *n == page {
                self.pending_dialog = Some(message.clone());
            }
        }
        let body = self.plan.pages.get(&page).cloned().unwrap_or_default();
        RawPage::new(format!("scripted page {page}"), 200, body)
    }
}

#[async_trait]
impl ScriptedSession for MockSession {
    fn step(&self) -> u32 {
        self.plan.step
    }

    async fn open(&mut self, page: u32) -> Result<RawPage> {
        self.calls.lock().unwrap().scripted.push(format!("open {page}"));
        Ok(self.land(page))
    }

    async fn next(&mut self) -> Result<Option<RawPage>> {
        let target = self.current + self.plan.step;
        if target > self.plan.last_page() {
            return Ok(None);
        }
        self.calls.lock().unwrap().scripted.push(format!("next {target}"));
        Ok(Some(self.land(target)))
    }

    async fn poll_dialog(&mut self) -> Option<String> {
        self.pending_dialog.take()
    }

    async fn close(&mut self) {
        self.calls.lock().unwrap().scripted.push("close".to_string());
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryArtifactStore {
    source: String,
    objects: Mutex<BTreeMap<String, Vec<Record>>>,
    deletes: Mutex<Vec<(String, PartitionKey)>>,
    fail_writes: AtomicBool,
}

impl MemoryArtifactStore {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    /// Make every subsequent write fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn objects(&self) -> BTreeMap<String, Vec<Record>> {
        self.objects.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn delete_calls(&self) -> Vec<(String, PartitionKey)> {
        self.deletes.lock().unwrap().clone()
    }

    /// Rows currently stored for one (entity, partition) pair.
    pub fn rows(&self, entity_id: &str, partition: PartitionKey) -> Vec<Record> {
        let stem = crate::store::artifact_stem("", partition, entity_id, &self.source);
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with(&stem))
            .flat_map(|(_, rows)| rows.clone())
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn write_artifact(
        &self,
        entity: &Entity,
        partition: PartitionKey,
        batch_seq: u32,
        rows: &[Record],
    ) -> Result<String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HarvestError::Storage("write refused".into()));
        }
        let name = artifact_name("", partition, &entity.id, &self.source, batch_seq);
        self.objects.lock().unwrap().insert(name.clone(), rows.to_vec());
        Ok(name)
    }

    async fn delete_artifacts(&self, entity: &Entity, partition: PartitionKey) -> Result<usize> {
        self.deletes.lock().unwrap().push((entity.id.clone(), partition));
        let stem = crate::store::artifact_stem("", partition, &entity.id, &self.source);
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|name, _| !name.starts_with(&stem));
        Ok(before - objects.len())
    }
}

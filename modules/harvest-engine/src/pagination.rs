//! Listing traversal for one entity.
//!
//! Paged sources walk page indexes until an item older than the window shows
//! up, too many empty pages go by, or the page ceiling is reached. At the
//! ceiling (or when listing keeps failing) a paged source hands over to its
//! scripted session, which moves forward by the source's step per "next"
//! interaction. The hand-over is one way. Cursor sources follow the id of the
//! last seen item until a batch comes back empty or the cursor stops moving.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harvest_common::{
    BlockAction, CrawlWindow, Entity, ErrorKind, HarvestConfig, HarvestError, ListedItem, ListingPage, PageToken,
    RawPage, Result,
};

use crate::resilience::{backoff, jittered, Guarded, ListingGuard};
use crate::traits::{PaginationStyle, ScriptedSession, SourceAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    LinkBased,
    Escalated,
}

impl std::fmt::Display for PaginationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaginationMode::LinkBased => f.write_str("link_based"),
            PaginationMode::Escalated => f.write_str("escalated"),
        }
    }
}

/// Why a pagination stream went terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// An item older than the window start was listed.
    ReachedStart,
    EmptyPages,
    EmptyBatch,
    /// The cursor source returned the position it was asked for.
    CursorStalled,
    NoNextControl,
    /// Page ceiling reached on a source that cannot escalate.
    PageCeiling,
    Blocked(String),
    Dialog(String),
    ListingFailed(String),
    Unparseable(String),
    Cancelled,
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StopReason::Blocked(_) | StopReason::Dialog(_) | StopReason::ListingFailed(_) | StopReason::Unparseable(_)
        )
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::ReachedStart => f.write_str("reached window start"),
            StopReason::EmptyPages => f.write_str("empty page limit"),
            StopReason::EmptyBatch => f.write_str("empty batch"),
            StopReason::CursorStalled => f.write_str("cursor did not advance"),
            StopReason::NoNextControl => f.write_str("no next control"),
            StopReason::PageCeiling => f.write_str("page ceiling without escalation"),
            StopReason::Blocked(sig) => write!(f, "blocked ({sig})"),
            StopReason::Dialog(msg) => write!(f, "dialog ({msg})"),
            StopReason::ListingFailed(e) => write!(f, "listing failed ({e})"),
            StopReason::Unparseable(e) => write!(f, "unparseable listing ({e})"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    pub mode: PaginationMode,
    pub position: PageToken,
    pub consecutive_empty_pages: u32,
    pub pages_fetched: u32,
    pub stop: Option<StopReason>,
}

impl PaginationState {
    pub fn start(style: PaginationStyle) -> Self {
        Self {
            mode: PaginationMode::LinkBased,
            position: match style {
                PaginationStyle::Paged => PageToken::Page(1),
                PaginationStyle::Cursor => PageToken::Cursor(None),
            },
            consecutive_empty_pages: 0,
            pages_fetched: 0,
            stop: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stop.is_some()
    }

    fn finish(mut self, reason: StopReason) -> Self {
        self.stop = Some(reason);
        self
    }
}

/// The pagination knobs of [`HarvestConfig`].
#[derive(Debug, Clone, Copy)]
pub struct PaginationSettings {
    pub escalation_page: u32,
    pub empty_page_limit: u32,
    pub escalate_on_listing_failure: bool,
    pub on_block: BlockAction,
    pub request_delay: Duration,
}

impl From<&HarvestConfig> for PaginationSettings {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            escalation_page: config.escalation_page,
            empty_page_limit: config.empty_page_limit,
            escalate_on_listing_failure: config.escalate_on_listing_failure,
            on_block: config.block.on_exhausted,
            request_delay: config.request_delay,
        }
    }
}

#[derive(Debug)]
pub struct PaginationOutcome {
    /// Accepted items in listing order, deduplicated by id.
    pub items: Vec<ListedItem>,
    pub state: PaginationState,
    /// Every failure seen, including retries that later succeeded.
    pub failures: Vec<ErrorKind>,
}

/// How one listing page's rows measured against the window.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PageVerdict {
    pub accepted: Vec<ListedItem>,
    /// Rows read before any early stop, newer and duplicate rows included.
    pub valid_rows: usize,
    pub skipped_newer: usize,
    pub duplicates: usize,
    pub reached_start: bool,
}

/// Listings are newest first, so the first row older than the window ends the
/// stream and nothing after it on the page is kept.
pub(crate) fn evaluate(items: Vec<ListedItem>, window: &CrawlWindow, seen: &mut HashSet<String>) -> PageVerdict {
    let mut verdict = PageVerdict::default();
    for item in items {
        verdict.valid_rows += 1;
        if let Some(ts) = item.posted_at {
            if window.is_after(ts) {
                verdict.skipped_newer += 1;
                continue;
            }
            if window.is_before(ts) {
                verdict.reached_start = true;
                break;
            }
        }
        if !seen.insert(item.id.clone()) {
            verdict.duplicates += 1;
            continue;
        }
        verdict.accepted.push(item);
    }
    verdict
}

pub struct Paginator<'a> {
    adapter: &'a dyn SourceAdapter,
    entity: &'a Entity,
    window: CrawlWindow,
    settings: PaginationSettings,
    guard: ListingGuard<'a>,
    session: Option<Box<dyn ScriptedSession>>,
    session_opened: bool,
    /// The session's first page was already read in link-based mode.
    reopens_read_page: bool,
    seen: HashSet<String>,
    cancel: CancellationToken,
}

impl<'a> Paginator<'a> {
    pub fn new(
        adapter: &'a dyn SourceAdapter,
        entity: &'a Entity,
        config: &HarvestConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            entity,
            window: config.window,
            settings: PaginationSettings::from(config),
            guard: ListingGuard::new(
                adapter,
                config.listing_retry,
                config.block,
                config.request_timeout,
                cancel.clone(),
            ),
            session: None,
            session_opened: false,
            reopens_read_page: false,
            seen: HashSet::new(),
            cancel,
        }
    }

    pub fn initial_state(&self) -> PaginationState {
        PaginationState::start(self.adapter.pagination())
    }

    /// Drive the stream to a terminal state and return every accepted item.
    pub async fn run(mut self) -> PaginationOutcome {
        let mut state = self.initial_state();
        let mut items = Vec::new();

        while !state.is_terminal() {
            let (batch, next) = self.advance(state).await;
            items.extend(batch);
            state = next;
        }

        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }

        let stop = state.stop.as_ref().map(ToString::to_string).unwrap_or_default();
        if state.stop.as_ref().is_some_and(StopReason::is_failure) {
            warn!(
                entity = self.entity.id.as_str(),
                mode = %state.mode,
                pages = state.pages_fetched,
                items = items.len(),
                stop = stop.as_str(),
                "Pagination ended early"
            );
        } else {
            info!(
                entity = self.entity.id.as_str(),
                mode = %state.mode,
                pages = state.pages_fetched,
                items = items.len(),
                stop = stop.as_str(),
                "Pagination finished"
            );
        }

        PaginationOutcome {
            items,
            state,
            failures: self.guard.take_failures(),
        }
    }

    /// One step of the state machine: fetch the current position, return the
    /// items it contributed and the next state. Terminal states are returned
    /// unchanged.
    pub async fn advance(&mut self, state: PaginationState) -> (Vec<ListedItem>, PaginationState) {
        if state.is_terminal() {
            return (Vec::new(), state);
        }
        if self.cancel.is_cancelled() {
            return (Vec::new(), state.finish(StopReason::Cancelled));
        }

        match (self.adapter.pagination(), state.mode) {
            (PaginationStyle::Cursor, _) => self.advance_cursor(state).await,
            (PaginationStyle::Paged, PaginationMode::LinkBased) => self.advance_linked(state).await,
            (PaginationStyle::Paged, PaginationMode::Escalated) => self.advance_scripted(state).await,
        }
    }

    async fn advance_linked(&mut self, state: PaginationState) -> (Vec<ListedItem>, PaginationState) {
        let PageToken::Page(page) = state.position else {
            return (Vec::new(), state.finish(StopReason::ListingFailed("paged source at a cursor position".into())));
        };

        let raw = match self.guard.fetch(self.entity, &state.position).await {
            Ok(Guarded::Page(raw)) => raw,
            Ok(Guarded::Blocked { signature, .. }) => {
                if self.settings.on_block == BlockAction::Escalate {
                    if let Some(state) = self.escalate(state.clone(), page, false, "block budget exhausted").await {
                        return (Vec::new(), state);
                    }
                }
                return (Vec::new(), state.finish(StopReason::Blocked(signature)));
            }
            Err(HarvestError::Cancelled) => return (Vec::new(), state.finish(StopReason::Cancelled)),
            Err(e) => {
                self.guard.record(e.kind());
                if state.pages_fetched > 0 && self.settings.escalate_on_listing_failure {
                    if let Some(state) = self.escalate(state.clone(), page, false, "listing keeps failing").await {
                        return (Vec::new(), state);
                    }
                }
                return (Vec::new(), state.finish(StopReason::ListingFailed(e.to_string())));
            }
        };

        let listing = match self.parse(&state.position, &raw) {
            Ok(listing) => listing,
            Err(e) => return (Vec::new(), state.finish(StopReason::Unparseable(e.to_string()))),
        };

        let (items, mut state) = self.absorb(state, listing.items, true);
        if state.is_terminal() {
            return (items, state);
        }

        if page >= self.settings.escalation_page {
            return match self.escalate(state.clone(), page, true, "page ceiling").await {
                Some(state) => (items, state),
                None => (items, state.finish(StopReason::PageCeiling)),
            };
        }

        state.position = PageToken::Page(page + 1);
        self.pause().await;
        (items, state)
    }

    async fn advance_scripted(&mut self, mut state: PaginationState) -> (Vec<ListedItem>, PaginationState) {
        let PageToken::Page(page) = state.position else {
            return (Vec::new(), state.finish(StopReason::ListingFailed("scripted session at a cursor position".into())));
        };

        let mut counted = true;
        let raw = if self.session_opened {
            match self.click_next().await {
                Ok(Some((raw, step))) => {
                    state.position = PageToken::Page(page + step);
                    raw
                }
                Ok(None) => return (Vec::new(), state.finish(StopReason::NoNextControl)),
                Err(e) => {
                    self.guard.record(e.kind());
                    return (Vec::new(), state.finish(StopReason::ListingFailed(e.to_string())));
                }
            }
        } else {
            self.session_opened = true;
            counted = !self.reopens_read_page;
            match self.open_session(page).await {
                Ok(raw) => raw,
                Err(HarvestError::Cancelled) => return (Vec::new(), state.finish(StopReason::Cancelled)),
                Err(e) => return (Vec::new(), state.finish(StopReason::ListingFailed(e.to_string()))),
            }
        };

        if let Some(message) = self.poll_dialog().await {
            self.guard.record(ErrorKind::BlockDetected);
            warn!(entity = self.entity.id.as_str(), position = %state.position, message = message.as_str(), "Interstitial dialog, stopping");
            return (Vec::new(), state.finish(StopReason::Dialog(message)));
        }
        if let Some(signature) = self.guard.signatures().detect(&raw).map(str::to_string) {
            self.guard.record(ErrorKind::BlockDetected);
            return (Vec::new(), state.finish(StopReason::Blocked(signature)));
        }

        let listing = match self.parse(&state.position, &raw) {
            Ok(listing) => listing,
            Err(e) => return (Vec::new(), state.finish(StopReason::Unparseable(e.to_string()))),
        };

        let (items, state) = self.absorb(state, listing.items, counted);
        if !state.is_terminal() {
            self.pause().await;
        }
        (items, state)
    }

    async fn advance_cursor(&mut self, mut state: PaginationState) -> (Vec<ListedItem>, PaginationState) {
        let raw = match self.guard.fetch(self.entity, &state.position).await {
            Ok(Guarded::Page(raw)) => raw,
            Ok(Guarded::Blocked { signature, .. }) => {
                return (Vec::new(), state.finish(StopReason::Blocked(signature)));
            }
            Err(HarvestError::Cancelled) => return (Vec::new(), state.finish(StopReason::Cancelled)),
            Err(e) => {
                self.guard.record(e.kind());
                return (Vec::new(), state.finish(StopReason::ListingFailed(e.to_string())));
            }
        };

        let listing = match self.parse(&state.position, &raw) {
            Ok(listing) => listing,
            Err(e) => return (Vec::new(), state.finish(StopReason::Unparseable(e.to_string()))),
        };

        let Some(last) = listing.items.last() else {
            state.pages_fetched += 1;
            return (Vec::new(), state.finish(StopReason::EmptyBatch));
        };
        let next = listing
            .next
            .clone()
            .unwrap_or_else(|| PageToken::Cursor(Some(last.id.clone())));

        let (items, mut state) = self.absorb(state, listing.items, true);
        if state.is_terminal() {
            return (items, state);
        }
        if next == state.position {
            warn!(entity = self.entity.id.as_str(), %next, "Cursor did not advance, stopping");
            return (items, state.finish(StopReason::CursorStalled));
        }

        state.position = next;
        self.pause().await;
        (items, state)
    }

    /// Switch to scripted navigation starting at `page`. `None` when the source
    /// has no scripted capability or it could not be started. `page_read` is set
    /// when `page` was already read link-based, so its re-read is not counted.
    async fn escalate(
        &mut self,
        mut state: PaginationState,
        page: u32,
        page_read: bool,
        why: &str,
    ) -> Option<PaginationState> {
        match self.adapter.scripted(self.entity).await {
            Ok(Some(session)) => {
                info!(entity = self.entity.id.as_str(), page, why, "Escalating to scripted navigation");
                self.session = Some(session);
                self.session_opened = false;
                self.reopens_read_page = page_read;
                state.mode = PaginationMode::Escalated;
                state.position = PageToken::Page(page);
                Some(state)
            }
            Ok(None) => {
                debug!(entity = self.entity.id.as_str(), page, why, "Source cannot escalate");
                None
            }
            Err(e) => {
                warn!(entity = self.entity.id.as_str(), page, error = %e, "Failed to start scripted session");
                self.guard.record(e.kind());
                None
            }
        }
    }

    /// Initial navigation of the scripted session, retried like a listing request.
    async fn open_session(&mut self, page: u32) -> Result<RawPage> {
        let policy = self.guard.retry_policy();
        let timeout = self.guard.timeout();
        let Some(session) = self.session.as_mut() else {
            return Err(HarvestError::Configuration("scripted session missing".into()));
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, session.open(page)).await {
                Ok(result) => result,
                Err(_) => Err(HarvestError::Transient(format!("scripted open of page {page} timed out"))),
            };
            match result {
                Ok(raw) => return Ok(raw),
                Err(e) => {
                    self.guard.record(e.kind());
                    if !e.is_transient() || attempt >= policy.max_attempts {
                        return Err(e);
                    }
                    warn!(entity = self.entity.id.as_str(), page, attempt, error = %e, "Scripted open failed, retrying");
                    backoff(jittered(policy.delay), self.guard.cancel()).await?;
                }
            }
        }
    }

    /// Interactions are not idempotent, so they get no retry.
    async fn click_next(&mut self) -> Result<Option<(RawPage, u32)>> {
        let timeout = self.guard.timeout();
        let Some(session) = self.session.as_mut() else {
            return Err(HarvestError::Configuration("scripted session missing".into()));
        };
        let step = session.step();
        match tokio::time::timeout(timeout, session.next()).await {
            Ok(result) => Ok(result?.map(|raw| (raw, step))),
            Err(_) => Err(HarvestError::Transient("scripted next timed out".into())),
        }
    }

    async fn poll_dialog(&mut self) -> Option<String> {
        match self.session.as_mut() {
            Some(session) => session.poll_dialog().await,
            None => None,
        }
    }

    fn parse(&mut self, token: &PageToken, raw: &RawPage) -> Result<ListingPage> {
        self.adapter.parse_listing(self.entity, token, raw).inspect_err(|e| {
            warn!(entity = self.entity.id.as_str(), %token, error = %e, "Listing parse failed");
            self.guard.record(e.kind());
        })
    }

    /// Fold a page's rows into the stream. A page that is not `counted` (a
    /// re-read) leaves the page count and empty streak alone.
    fn absorb(
        &mut self,
        mut state: PaginationState,
        items: Vec<ListedItem>,
        counted: bool,
    ) -> (Vec<ListedItem>, PaginationState) {
        let verdict = evaluate(items, &self.window, &mut self.seen);
        if counted {
            state.pages_fetched += 1;
            if verdict.valid_rows == 0 {
                state.consecutive_empty_pages += 1;
            } else {
                state.consecutive_empty_pages = 0;
            }
        }

        debug!(
            entity = self.entity.id.as_str(),
            position = %state.position,
            accepted = verdict.accepted.len(),
            skipped_newer = verdict.skipped_newer,
            duplicates = verdict.duplicates,
            empty_streak = state.consecutive_empty_pages,
            "Listing page read"
        );

        let state = if verdict.reached_start {
            state.finish(StopReason::ReachedStart)
        } else if state.consecutive_empty_pages >= self.settings.empty_page_limit {
            state.finish(StopReason::EmptyPages)
        } else {
            state
        };
        (verdict.accepted, state)
    }

    async fn pause(&self) {
        if self.settings.request_delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(jittered(self.settings.request_delay)) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, window};

    fn item(id: &str, date: &str) -> ListedItem {
        ListedItem::new(id, Some(at(date, 12)))
    }

    #[test]
    fn newer_items_are_skipped_but_still_count_as_rows() {
        let window = window("2025-01-01", "2025-01-02");
        let mut seen = HashSet::new();
        let verdict = evaluate(vec![item("9", "2025-01-05"), item("8", "2025-01-04")], &window, &mut seen);
        assert!(verdict.accepted.is_empty());
        assert_eq!(verdict.valid_rows, 2);
        assert_eq!(verdict.skipped_newer, 2);
        assert!(!verdict.reached_start);
    }

    #[test]
    fn first_older_item_stops_the_page() {
        let window = window("2025-01-02", "2025-01-03");
        let mut seen = HashSet::new();
        let verdict = evaluate(
            vec![item("5", "2025-01-03"), item("4", "2025-01-01"), item("3", "2025-01-02")],
            &window,
            &mut seen,
        );
        assert_eq!(verdict.accepted, vec![item("5", "2025-01-03")]);
        assert!(verdict.reached_start);
    }

    #[test]
    fn undated_items_are_kept_and_duplicates_dropped() {
        let window = window("2025-01-01", "2025-01-02");
        let mut seen = HashSet::from(["7".to_string()]);
        let verdict = evaluate(
            vec![ListedItem::new("7", None), ListedItem::new("6", None)],
            &window,
            &mut seen,
        );
        assert_eq!(verdict.accepted, vec![ListedItem::new("6", None)]);
        assert_eq!(verdict.duplicates, 1);
    }

    #[test]
    fn stop_reasons_classify_failures() {
        assert!(StopReason::Blocked("x".into()).is_failure());
        assert!(StopReason::Dialog("x".into()).is_failure());
        assert!(!StopReason::ReachedStart.is_failure());
        assert!(!StopReason::Cancelled.is_failure());
    }
}

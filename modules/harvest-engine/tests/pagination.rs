use std::time::Duration;

use tokio_util::sync::CancellationToken;

use harvest_common::{BlockAction, BlockPolicy, ErrorKind, HarvestConfig, ListedItem, PageToken, RetryPolicy};
use harvest_engine::testing::{item, listing_body, listing_body_with_next, window, MockResponse, MockSource, ScriptedPlan};
use harvest_engine::{PaginationMode, PaginationOutcome, Paginator, StopReason};

fn config() -> HarvestConfig {
    with_ceiling(100)
}

fn with_ceiling(escalation_page: u32) -> HarvestConfig {
    HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .listing_retry(RetryPolicy::new(2, Duration::from_millis(10)))
        .empty_page_limit(2)
        .escalation_page(escalation_page)
        .build()
}

fn items(prefix: &str, n: usize, date: &str) -> Vec<ListedItem> {
    (0..n).map(|i| item(&format!("{prefix}{i}"), date)).collect()
}

async fn paginate(source: &MockSource, config: &HarvestConfig) -> PaginationOutcome {
    let entity = source.entity();
    Paginator::new(source, &entity, config, CancellationToken::new()).run().await
}

fn pages(ns: &[u32]) -> Vec<PageToken> {
    ns.iter().map(|n| PageToken::Page(*n)).collect()
}

// ---------------------------------------------------------------------------
// Link-based
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn empty_page_threshold_ends_pagination() {
    let source = MockSource::paged()
        .page(1, &items("a", 10, "2025-01-03"))
        .page(2, &items("b", 10, "2025-01-02"));

    let out = paginate(&source, &config()).await;

    assert_eq!(out.items.len(), 20);
    assert_eq!(out.state.stop, Some(StopReason::EmptyPages));
    assert_eq!(source.requested(), pages(&[1, 2, 3, 4]));
}

#[tokio::test(start_paused = true)]
async fn early_stop_never_requests_the_next_page() {
    let mut page_two = items("b", 3, "2025-01-01");
    page_two.push(item("old", "2024-12-31"));
    page_two.push(item("older-but-after", "2025-01-01"));
    let source = MockSource::paged()
        .page(1, &items("a", 5, "2025-01-02"))
        .page(2, &page_two)
        .page(3, &items("c", 5, "2024-12-30"));

    let out = paginate(&source, &config()).await;

    assert_eq!(out.state.stop, Some(StopReason::ReachedStart));
    assert_eq!(out.items.len(), 8);
    assert!(out.items.iter().all(|i| i.id != "older-but-after"));
    assert_eq!(source.requested(), pages(&[1, 2]));
}

#[tokio::test(start_paused = true)]
async fn newer_pages_do_not_count_as_empty() {
    let source = MockSource::paged()
        .page(1, &items("n", 10, "2025-01-09"))
        .page(2, &items("m", 10, "2025-01-08"))
        .page(3, &items("a", 2, "2025-01-02"))
        .page(4, &[item("old", "2024-12-01")]);
    let config = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .empty_page_limit(1)
        .build();

    let out = paginate(&source, &config).await;

    assert_eq!(out.state.stop, Some(StopReason::ReachedStart));
    assert_eq!(out.items.len(), 2);
    assert_eq!(out.state.pages_fetched, 4);
}

#[tokio::test(start_paused = true)]
async fn first_page_failure_aborts_without_escalating() {
    let source = MockSource::paged()
        .respond(PageToken::Page(1), vec![MockResponse::Transient])
        .scripted(ScriptedPlan::new(10).page(1, &items("s", 3, "2025-01-02")));

    let out = paginate(&source, &config()).await;

    assert!(matches!(out.state.stop, Some(StopReason::ListingFailed(_))));
    assert_eq!(out.state.mode, PaginationMode::LinkBased);
    assert_eq!(out.state.pages_fetched, 0);
    assert!(source.scripted_log().is_empty());
    assert!(out.failures.contains(&ErrorKind::ExhaustedRetries));
}

#[tokio::test(start_paused = true)]
async fn unparseable_listing_is_terminal() {
    let source = MockSource::paged().respond(PageToken::Page(1), vec![MockResponse::Body("<html>".into())]);

    let out = paginate(&source, &config()).await;

    assert!(matches!(out.state.stop, Some(StopReason::Unparseable(_))));
    assert!(out.failures.contains(&ErrorKind::Parse));
}

#[tokio::test(start_paused = true)]
async fn ceiling_without_scripted_capability_stops() {
    let source = MockSource::paged()
        .page(1, &items("a", 2, "2025-01-03"))
        .page(2, &items("b", 2, "2025-01-03"))
        .page(3, &items("c", 2, "2025-01-03"))
        .page(4, &items("d", 2, "2025-01-03"));

    let out = paginate(&source, &with_ceiling(3)).await;

    assert_eq!(out.state.stop, Some(StopReason::PageCeiling));
    assert_eq!(out.items.len(), 6);
    assert_eq!(source.requested(), pages(&[1, 2, 3]));
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ceiling_escalates_and_a_dialog_ends_the_stream() {
    let page_three = items("c", 2, "2025-01-03");
    let source = MockSource::paged()
        .page(1, &items("a", 2, "2025-01-03"))
        .page(2, &items("b", 2, "2025-01-03"))
        .page(3, &page_three)
        .scripted(
            ScriptedPlan::new(10)
                .page(3, &page_three)
                .page(13, &items("s", 4, "2025-01-02"))
                .page(23, &items("t", 4, "2025-01-02"))
                .dialog_at(23, "Too many requests"),
        );

    let out = paginate(&source, &with_ceiling(3)).await;

    assert_eq!(out.state.mode, PaginationMode::Escalated);
    assert_eq!(out.state.stop, Some(StopReason::Dialog("Too many requests".into())));
    // Re-reading page 3 in the session adds nothing; page 23 is discarded
    assert_eq!(out.items.len(), 10);
    assert!(out.items.iter().all(|i| !i.id.starts_with('t')));
    assert_eq!(source.scripted_log(), vec!["open 3", "next 13", "next 23", "close"]);
    assert!(out.failures.contains(&ErrorKind::BlockDetected));
    // Pages 1-3 link-based plus page 13; re-opening page 3 is not a new page
    assert_eq!(out.state.pages_fetched, 4);
}

#[tokio::test(start_paused = true)]
async fn escalation_is_one_way() {
    let source = MockSource::paged()
        .page(1, &items("a", 2, "2025-01-03"))
        .page(2, &items("b", 2, "2025-01-03"))
        .page(3, &items("c", 2, "2025-01-03"))
        .page(4, &items("never", 2, "2025-01-03"))
        .scripted(
            ScriptedPlan::new(10)
                .page(3, &items("c", 2, "2025-01-03"))
                .page(13, &items("s", 2, "2025-01-02"))
                .page(23, &items("t", 2, "2025-01-01")),
        );
    let config = with_ceiling(3);
    let entity = source.entity();
    let mut paginator = Paginator::new(&source, &entity, &config, CancellationToken::new());

    let mut state = paginator.initial_state();
    let mut seen_escalated = false;
    while !state.is_terminal() {
        let (_, next) = paginator.advance(state).await;
        if seen_escalated {
            assert_eq!(next.mode, PaginationMode::Escalated);
        }
        seen_escalated |= next.mode == PaginationMode::Escalated;
        state = next;
    }

    assert!(seen_escalated);
    assert_eq!(state.stop, Some(StopReason::NoNextControl));
    assert!(!source.requested().contains(&PageToken::Page(4)));
}

#[tokio::test(start_paused = true)]
async fn persistent_listing_failure_forces_escalation_at_the_failed_page() {
    let source = MockSource::paged()
        .page(1, &items("a", 3, "2025-01-03"))
        .respond(PageToken::Page(2), vec![MockResponse::Transient])
        .scripted(ScriptedPlan::new(10).page(2, &items("b", 3, "2025-01-02")));

    let out = paginate(&source, &config()).await;

    assert_eq!(out.state.mode, PaginationMode::Escalated);
    assert_eq!(out.items.len(), 6);
    assert_eq!(source.scripted_log().first().map(String::as_str), Some("open 2"));
    assert_eq!(out.failures.iter().filter(|k| **k == ErrorKind::TransientNetwork).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn forced_escalation_can_be_disabled() {
    let source = MockSource::paged()
        .page(1, &items("a", 3, "2025-01-03"))
        .respond(PageToken::Page(2), vec![MockResponse::Transient])
        .scripted(ScriptedPlan::new(10).page(2, &items("b", 3, "2025-01-02")));
    let config = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .listing_retry(RetryPolicy::new(2, Duration::from_millis(10)))
        .escalate_on_listing_failure(false)
        .build();

    let out = paginate(&source, &config).await;

    assert!(matches!(out.state.stop, Some(StopReason::ListingFailed(_))));
    assert_eq!(out.items.len(), 3);
    assert!(source.scripted_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn block_budget_exhaustion_aborts_or_escalates_per_policy() {
    let build = || {
        MockSource::paged()
            .markers(["error_content"])
            .page(1, &items("a", 3, "2025-01-03"))
            .respond(PageToken::Page(2), vec![MockResponse::Body("<div class=error_content>".into())])
            .scripted(ScriptedPlan::new(10).page(2, &items("b", 3, "2025-01-02")))
    };
    let block = |on_exhausted| BlockPolicy {
        max_retries: 3,
        backoff: Duration::from_secs(60),
        on_exhausted,
    };

    let abort_source = build();
    let abort = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .block(block(BlockAction::Abort))
        .build();
    let out = paginate(&abort_source, &abort).await;
    assert_eq!(out.state.stop, Some(StopReason::Blocked("error_content".into())));
    assert_eq!(out.items.len(), 3);
    assert_eq!(abort_source.listing_requests(&PageToken::Page(2)), 4);
    assert_eq!(out.failures.iter().filter(|k| **k == ErrorKind::BlockDetected).count(), 4);

    let escalate_source = build();
    let escalate = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .block(block(BlockAction::Escalate))
        .build();
    let out = paginate(&escalate_source, &escalate).await;
    assert_eq!(out.state.mode, PaginationMode::Escalated);
    assert_eq!(out.items.len(), 6);
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cursor_skips_newer_batches_and_stops_at_window_start() {
    let source = MockSource::cursor()
        .batch(None, &items("new", 3, "2025-01-05"))
        .batch(
            Some("new2"),
            &[item("c6", "2025-01-02"), item("c5", "2025-01-01"), item("c4", "2024-12-30")],
        );
    let config = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-02"))
        .request_delay(Duration::ZERO)
        .build();

    let out = paginate(&source, &config).await;

    let ids: Vec<&str> = out.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["c6", "c5"]);
    assert_eq!(out.state.stop, Some(StopReason::ReachedStart));
    assert_eq!(
        source.requested(),
        vec![PageToken::Cursor(None), PageToken::Cursor(Some("new2".into()))]
    );
}

#[tokio::test(start_paused = true)]
async fn cursor_that_does_not_advance_halts_after_one_extra_step() {
    let source = MockSource::cursor()
        .batch(None, &[item("x", "2025-01-02")])
        .respond(
            PageToken::Cursor(Some("x".into())),
            vec![MockResponse::Body(listing_body_with_next(&[item("y", "2025-01-02")], "x"))],
        );

    let out = paginate(&source, &config()).await;

    assert_eq!(out.state.stop, Some(StopReason::CursorStalled));
    assert_eq!(out.items.len(), 2);
    assert_eq!(source.requested().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_items_are_not_listed_twice() {
    let source = MockSource::cursor()
        .batch(None, &[item("x", "2025-01-02"), item("w", "2025-01-02")])
        .respond(
            PageToken::Cursor(Some("w".into())),
            vec![MockResponse::Body(listing_body_with_next(
                &[item("w", "2025-01-02"), item("v", "2025-01-02")],
                "v",
            ))],
        )
        .respond(PageToken::Cursor(Some("v".into())), vec![MockResponse::Body(listing_body(&[]))]);

    let out = paginate(&source, &config()).await;

    let ids: Vec<&str> = out.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["x", "w", "v"]);
    assert_eq!(out.state.stop, Some(StopReason::EmptyBatch));
}

#[tokio::test(start_paused = true)]
async fn cancelled_pagination_makes_no_requests() {
    let source = MockSource::paged().page(1, &items("a", 2, "2025-01-02"));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let entity = source.entity();
    let config = config();

    let out = Paginator::new(&source, &entity, &config, cancel).run().await;

    assert_eq!(out.state.stop, Some(StopReason::Cancelled));
    assert!(source.requested().is_empty());
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_blocked_stream_ends_it_without_waiting_out_the_backoff() {
    let source = MockSource::paged()
        .markers(["error_content"])
        .respond(PageToken::Page(1), vec![MockResponse::Body("<div class=error_content>".into())]);
    let config = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .block(BlockPolicy {
            max_retries: 3,
            backoff: Duration::from_secs(60),
            on_exhausted: BlockAction::Escalate,
        })
        .build();
    let entity = source.entity();
    let started = tokio::time::Instant::now();

    let out = Paginator::new(&source, &entity, &config, cancel_after(Duration::from_secs(1)))
        .run()
        .await;

    assert_eq!(out.state.stop, Some(StopReason::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(source.listing_requests(&PageToken::Page(1)), 1);
    assert!(source.scripted_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_a_transient_retry_delay_stops_the_stream() {
    let source = MockSource::paged()
        .page(1, &items("a", 2, "2025-01-03"))
        .respond(PageToken::Page(2), vec![MockResponse::Transient])
        .scripted(ScriptedPlan::new(10).page(2, &items("b", 2, "2025-01-02")));
    let config = HarvestConfig::builder()
        .window(window("2025-01-01", "2025-01-03"))
        .request_delay(Duration::ZERO)
        .listing_retry(RetryPolicy::new(3, Duration::from_secs(30)))
        .build();
    let entity = source.entity();
    let started = tokio::time::Instant::now();

    let out = Paginator::new(&source, &entity, &config, cancel_after(Duration::from_secs(1)))
        .run()
        .await;

    assert_eq!(out.state.stop, Some(StopReason::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(out.items.len(), 2);
    assert_eq!(source.listing_requests(&PageToken::Page(2)), 1);
    // Cancellation is not a listing failure, so no escalation
    assert!(source.scripted_log().is_empty());
}

//! Retry and block handling around source calls.
//!
//! Transient failures (timeouts, resets, 5xx) are retried under a short fixed
//! budget with a session reset between attempts. Block pages get a separate,
//! longer budget: each detection backs off, resets the session and re-requests
//! the same position. Every failure observed along the way is kept as an
//! [`ErrorKind`] so run statistics see retries that eventually succeeded.
//! Every wait races the run's cancellation token, and no new attempt starts
//! once it has fired.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use harvest_common::{BlockPolicy, Entity, ErrorKind, HarvestError, PageToken, RawPage, Result, RetryPolicy};

use crate::traits::SourceAdapter;

/// Substring markers that identify a block page. Matching is case-sensitive
/// and runs against the undecoded body.
#[derive(Debug, Clone, Default)]
pub struct BlockSignatures {
    markers: Vec<String>,
}

impl BlockSignatures {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
        }
    }

    /// The first marker found in `page`, if any.
    pub fn detect(&self, page: &RawPage) -> Option<&str> {
        self.markers
            .iter()
            .find(|m| page.body.contains(m.as_str()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// `delay` plus up to 10% random jitter.
pub(crate) fn jittered(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 10) as u64;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

/// Sleep for `delay`, or until `cancel` fires. `Err(Cancelled)` in the latter case.
pub(crate) async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HarvestError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `op` under a per-attempt timeout, retrying transient failures up to
/// `policy.max_attempts` total attempts. Non-transient errors return
/// immediately. Each transient failure is pushed onto `failures`.
/// An attempt already in flight is allowed to finish; cancellation only stops
/// the next one.
pub(crate) async fn with_retries<T, F, Fut>(
    adapter: &dyn SourceAdapter,
    policy: RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    what: &str,
    failures: &mut Vec<ErrorKind>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        attempt += 1;
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(HarvestError::Transient(format!(
                "{what} timed out after {}s",
                timeout.as_secs_f32()
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                failures.push(e.kind());
                if attempt >= policy.max_attempts {
                    warn!(what, attempts = attempt, error = %e, "Retry budget exhausted");
                    return Err(HarvestError::ExhaustedRetries {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                warn!(
                    what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Transient failure, resetting session before retry"
                );
                adapter.reset_session().await;
                backoff(jittered(policy.delay), cancel).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Outcome of a guarded listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    Page(T),
    /// The block budget ran out. `blocks` counts every detection, so it is
    /// always `max_retries + 1`.
    Blocked { signature: String, blocks: u32 },
}

/// Wraps one pagination stream's listing requests. Single-owner: the stream
/// holds it mutably and collects its failures when pagination ends.
pub struct ListingGuard<'a> {
    adapter: &'a dyn SourceAdapter,
    retry: RetryPolicy,
    block: BlockPolicy,
    timeout: Duration,
    cancel: CancellationToken,
    signatures: BlockSignatures,
    failures: Vec<ErrorKind>,
}

impl<'a> ListingGuard<'a> {
    pub fn new(
        adapter: &'a dyn SourceAdapter,
        retry: RetryPolicy,
        block: BlockPolicy,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            retry,
            block,
            timeout,
            cancel,
            signatures: BlockSignatures::new(adapter.block_markers()),
            failures: Vec::new(),
        }
    }

    pub fn signatures(&self) -> &BlockSignatures {
        &self.signatures
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn record(&mut self, kind: ErrorKind) {
        self.failures.push(kind);
    }

    pub fn take_failures(&mut self) -> Vec<ErrorKind> {
        std::mem::take(&mut self.failures)
    }

    /// Fetch one listing position. Transient errors are retried under the
    /// listing budget; block pages under the block budget. Returns `Err` only
    /// once the transient budget is exhausted, on a non-retryable error, or with
    /// [`HarvestError::Cancelled`] when the run is cancelled mid-backoff.
    pub async fn fetch(&mut self, entity: &Entity, token: &PageToken) -> Result<Guarded<RawPage>> {
        let adapter = self.adapter;
        let what = format!("listing {} {token}", entity.id);
        let mut blocks = 0u32;

        loop {
            let page = with_retries(
                adapter,
                self.retry,
                self.timeout,
                &self.cancel,
                &what,
                &mut self.failures,
                || adapter.fetch_listing(entity, token),
            )
            .await?;

            let Some(signature) = self.signatures.detect(&page).map(str::to_string) else {
                if blocks > 0 {
                    info!(entity = entity.id.as_str(), %token, blocks, "Block cleared after backoff");
                }
                return Ok(Guarded::Page(page));
            };

            blocks += 1;
            self.failures.push(ErrorKind::BlockDetected);
            if blocks > self.block.max_retries {
                warn!(
                    entity = entity.id.as_str(),
                    %token,
                    signature = signature.as_str(),
                    blocks,
                    "Block budget exhausted"
                );
                return Ok(Guarded::Blocked { signature, blocks });
            }

            warn!(
                entity = entity.id.as_str(),
                %token,
                signature = signature.as_str(),
                block = blocks,
                max_retries = self.block.max_retries,
                backoff_secs = self.block.backoff.as_secs(),
                "Block page detected, backing off"
            );
            backoff(jittered(self.block.backoff), &self.cancel).await?;
            adapter.reset_session().await;
        }
    }
}

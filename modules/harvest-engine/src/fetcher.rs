//! Bounded-concurrency hydration of listed ids into records.
//!
//! Each id runs as its own task behind a shared detail gate. Records that
//! report replies then queue on a separate child gate. A failure stays with
//! its item: the task returns it as data and never cancels its siblings.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use harvest_common::{Entity, ErrorKind, HarvestConfig, Record, RetryPolicy};

use crate::resilience::{backoff, with_retries};
use crate::traits::SourceAdapter;

/// The result of hydrating one id. `record` is `None` when the item was
/// dropped; `failures` holds every error seen, retried ones included.
#[derive(Debug)]
pub struct Hydrated {
    pub entity: Arc<Entity>,
    pub id: String,
    pub record: Option<Record>,
    pub failures: Vec<ErrorKind>,
}

pub struct ConcurrentFetcher {
    adapter: Arc<dyn SourceAdapter>,
    detail_gate: Arc<Semaphore>,
    child_gate: Arc<Semaphore>,
    retry: RetryPolicy,
    timeout: Duration,
    stagger: Duration,
    cancel: CancellationToken,
}

impl ConcurrentFetcher {
    pub fn new(adapter: Arc<dyn SourceAdapter>, config: &HarvestConfig, cancel: CancellationToken) -> Self {
        Self {
            adapter,
            detail_gate: Arc::new(Semaphore::new(config.detail_concurrency.max(1))),
            child_gate: Arc::new(Semaphore::new(config.child_concurrency.max(1))),
            retry: config.detail_retry,
            timeout: config.request_timeout,
            stagger: config.detail_stagger,
            cancel,
        }
    }

    /// Hydrate every target. The output has one entry per input, in input
    /// order, whatever order the fetches finish in.
    pub async fn hydrate(&self, targets: Vec<(Arc<Entity>, String)>) -> Vec<Hydrated> {
        let total = targets.len();
        let results = join_all(targets.into_iter().map(|(entity, id)| self.hydrate_one(entity, id))).await;
        let resolved = results.iter().filter(|h| h.record.is_some()).count();
        debug!(total, resolved, "Hydration batch finished");
        results
    }

    async fn hydrate_one(&self, entity: Arc<Entity>, id: String) -> Hydrated {
        let mut hydrated = Hydrated {
            entity,
            id,
            record: None,
            failures: Vec::new(),
        };

        let acquired = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                hydrated.failures.push(ErrorKind::Cancelled);
                return hydrated;
            }
            acquired = self.detail_gate.acquire() => acquired,
        };
        let Ok(permit) = acquired else {
            hydrated.failures.push(ErrorKind::Cancelled);
            return hydrated;
        };
        if !self.stagger.is_zero() && backoff(self.stagger, &self.cancel).await.is_err() {
            hydrated.failures.push(ErrorKind::Cancelled);
            return hydrated;
        }

        let adapter = self.adapter.as_ref();
        let entity = hydrated.entity.clone();
        let id = hydrated.id.clone();
        let detail = with_retries(
            adapter,
            self.retry,
            self.timeout,
            &self.cancel,
            &format!("detail {}/{id}", entity.id),
            &mut hydrated.failures,
            || adapter.fetch_detail(&entity, &id),
        )
        .await;
        drop(permit);

        let mut record = match detail {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(entity = entity.id.as_str(), id = id.as_str(), "Detail not available, dropping item");
                hydrated.failures.push(ErrorKind::Parse);
                return hydrated;
            }
            Err(e) => {
                warn!(entity = entity.id.as_str(), id = id.as_str(), error = %e, "Detail fetch failed, dropping item");
                hydrated.failures.push(e.kind());
                return hydrated;
            }
        };

        if record.wants_children() && !self.cancel.is_cancelled() {
            if let Ok(_child_permit) = self.child_gate.acquire().await {
                let children = with_retries(
                    adapter,
                    self.retry,
                    self.timeout,
                    &self.cancel,
                    &format!("children {}/{id}", entity.id),
                    &mut hydrated.failures,
                    || adapter.fetch_children(&entity, &id),
                )
                .await;
                match children {
                    Ok(children) => record.children = children,
                    Err(e) => {
                        // The parent is kept with no children.
                        warn!(entity = entity.id.as_str(), id = id.as_str(), error = %e, "Child fetch failed");
                        hydrated.failures.push(e.kind());
                    }
                }
            }
        }

        hydrated.record = Some(record);
        hydrated
    }
}

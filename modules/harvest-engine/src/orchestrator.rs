//! Two-phase run driver.
//!
//! Phase 1 paginates every entity and groups the listed ids by
//! (entity, listing-date partition). Phase 2 walks partitions in ascending
//! date order, hydrates each partition's ids through the shared gate, routes
//! every record by its own timestamp and flushes all buckets before moving on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use harvest_common::{Entity, HarvestConfig, PartitionKey, Result};

use crate::buffer::{FlushScope, PartitionedBuffer};
use crate::fetcher::ConcurrentFetcher;
use crate::pagination::{PaginationOutcome, Paginator};
use crate::stats::{EntityReport, RunSummary};
use crate::traits::{ArtifactStore, SourceAdapter};

/// Listed ids grouped by (entity id, partition of the listing timestamp).
pub type MetadataMap = BTreeMap<(String, PartitionKey), Vec<String>>;

pub struct Harvester {
    adapter: Arc<dyn SourceAdapter>,
    store: Arc<dyn ArtifactStore>,
    config: HarvestConfig,
    cancel: CancellationToken,
    run_id: String,
}

impl Harvester {
    pub fn new(adapter: Arc<dyn SourceAdapter>, store: Arc<dyn ArtifactStore>, config: HarvestConfig) -> Self {
        Self {
            adapter,
            store,
            config,
            cancel: CancellationToken::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Stop scheduling new work once `cancel` fires. In-flight fetches finish
    /// and staged buckets are still flushed.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn run(&self, entities: &[Entity]) -> Result<RunSummary> {
        self.config.validate()?;
        let entities = unique_entities(entities);
        let entities = entities.as_slice();

        let started = Instant::now();
        let window = self.config.window;
        let mut summary = RunSummary::new(&self.run_id, self.adapter.source(), &window);
        info!(
            run_id = self.run_id.as_str(),
            source = self.adapter.source(),
            entities = entities.len(),
            start = %window.start,
            end = %window.end,
            "Harvest run starting"
        );

        let metadata = self
            .collect_metadata(entities, &mut summary)
            .instrument(info_span!("phase1", run_id = self.run_id.as_str()))
            .await;
        self.hydrate_and_persist(metadata, entities, &mut summary)
            .instrument(info_span!("phase2", run_id = self.run_id.as_str()))
            .await;

        summary.cancelled = self.cancel.is_cancelled();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = self.run_id.as_str(),
            ingested = summary.records_ingested,
            artifacts = summary.artifacts.len(),
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "Harvest run finished"
        );
        Ok(summary)
    }

    /// Phase 1. An entity whose pagination fails contributes whatever it listed
    /// before failing and never affects the others.
    pub async fn collect_metadata(&self, entities: &[Entity], summary: &mut RunSummary) -> MetadataMap {
        let outcomes: Vec<(&Entity, PaginationOutcome)> = stream::iter(entities)
            .map(|entity| async move {
                let outcome = Paginator::new(self.adapter.as_ref(), entity, &self.config, self.cancel.clone())
                    .run()
                    .instrument(info_span!("paginate", entity = entity.id.as_str()))
                    .await;
                (entity, outcome)
            })
            .buffered(self.config.entity_concurrency.max(1))
            .collect()
            .await;

        let window = self.config.window;
        let mut metadata = MetadataMap::new();
        for (entity, outcome) in outcomes {
            summary.listing_pages += u64::from(outcome.state.pages_fetched);
            summary.ids_listed += outcome.items.len() as u64;
            summary.record_errors(&outcome.failures);
            summary
                .entities
                .push(EntityReport::new(&entity.id, outcome.items.len(), &outcome.state));

            for item in outcome.items {
                // Undated listings are grouped under the window end; the
                // record's own timestamp decides where it is stored.
                let partition = item
                    .posted_at
                    .map(|ts| window.partition_of(ts))
                    .unwrap_or_else(|| PartitionKey::new(window.end));
                metadata
                    .entry((entity.id.clone(), partition))
                    .or_default()
                    .push(item.id);
            }
        }

        info!(
            groups = metadata.len(),
            ids = summary.ids_listed,
            pages = summary.listing_pages,
            "Metadata collected"
        );
        metadata
    }

    /// Phase 2. Partitions run one at a time in ascending order; all of a
    /// partition's ids share the detail gate across entities.
    pub async fn hydrate_and_persist(&self, metadata: MetadataMap, entities: &[Entity], summary: &mut RunSummary) {
        let lookup: HashMap<&str, Arc<Entity>> = entities
            .iter()
            .map(|e| (e.id.as_str(), Arc::new(e.clone())))
            .collect();

        let mut by_partition: BTreeMap<PartitionKey, Vec<(Arc<Entity>, String)>> = BTreeMap::new();
        for ((entity_id, partition), ids) in metadata {
            let Some(entity) = lookup.get(entity_id.as_str()) else {
                warn!(entity = entity_id.as_str(), "Listed ids for an unknown entity, skipping");
                continue;
            };
            by_partition
                .entry(partition)
                .or_default()
                .extend(ids.into_iter().map(|id| (entity.clone(), id)));
        }

        let window = self.config.window;
        let fetcher = ConcurrentFetcher::new(self.adapter.clone(), &self.config, self.cancel.clone());
        let mut buffer = PartitionedBuffer::new(self.store.clone(), self.config.buffer_size);

        for (partition, targets) in by_partition {
            if self.cancel.is_cancelled() {
                warn!(partition = %partition, "Cancelled, skipping remaining partitions");
                break;
            }

            let span = info_span!("partition", partition = %partition, items = targets.len());
            async {
                info!("Hydrating partition");
                for hydrated in fetcher.hydrate(targets).await {
                    summary.record_errors(&hydrated.failures);
                    let Some(record) = hydrated.record else {
                        summary.items_dropped += 1;
                        continue;
                    };
                    if !window.contains(record.written_at) {
                        summary.records_out_of_window += 1;
                        continue;
                    }

                    let key = window.partition_of(record.written_at);
                    summary.records_ingested += 1;
                    if let Err(e) = buffer.add(key, &hydrated.entity, record).await {
                        warn!(error = %e, "Auto-flush failed, rows stay staged");
                        summary.record_error(e.kind());
                    }
                }

                if let Err(e) = buffer.flush(FlushScope::All).await {
                    warn!(error = %e, "Partition flush failed, rows stay staged");
                    summary.record_error(e.kind());
                }
                summary.partitions_processed += 1;
            }
            .instrument(span)
            .await;
        }

        // Anything left by a failed flush gets one more attempt.
        if buffer.pending_rows() > 0 {
            if let Err(e) = buffer.flush(FlushScope::All).await {
                warn!(error = %e, pending = buffer.pending_rows(), "Final flush failed, rows lost");
                summary.record_error(e.kind());
            }
        }

        summary.rows_written = buffer.rows_written();
        summary.artifacts = buffer.locations().to_vec();
    }
}

/// Entities with distinct ids, first occurrence wins. Two streams over the
/// same id would list, hydrate and write every item twice.
fn unique_entities(entities: &[Entity]) -> Vec<Entity> {
    let mut seen = HashSet::new();
    entities
        .iter()
        .filter(|e| {
            let first = seen.insert(e.id.as_str());
            if !first {
                warn!(entity = e.id.as_str(), "Duplicate entity id, ignoring repeat");
            }
            first
        })
        .cloned()
        .collect()
}

//! In-memory staging of hydrated records, bucketed by (partition, entity).
//!
//! The first flush of a bucket in a run deletes whatever an earlier run left
//! for that pair, so re-running a window replaces its data instead of
//! appending to it. Later flushes in the same run only add batches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use harvest_common::{Entity, PartitionKey, Record, Result};

use crate::traits::ArtifactStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub partition: PartitionKey,
    pub entity_id: String,
}

impl BucketKey {
    pub fn new(partition: PartitionKey, entity_id: impl Into<String>) -> Self {
        Self {
            partition,
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.partition, self.entity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope<'a> {
    Bucket(&'a BucketKey),
    Partition(PartitionKey),
    All,
}

struct Bucket {
    entity: Entity,
    records: Vec<Record>,
}

pub struct PartitionedBuffer {
    store: Arc<dyn ArtifactStore>,
    threshold: usize,
    buckets: BTreeMap<BucketKey, Bucket>,
    /// Pairs whose stale artifacts were already removed this run.
    cleared: HashSet<BucketKey>,
    /// Last batch number successfully written per pair.
    batch_seq: HashMap<BucketKey, u32>,
    locations: Vec<String>,
    rows_written: u64,
}

impl PartitionedBuffer {
    pub fn new(store: Arc<dyn ArtifactStore>, threshold: usize) -> Self {
        Self {
            store,
            threshold: threshold.max(1),
            buckets: BTreeMap::new(),
            cleared: HashSet::new(),
            batch_seq: HashMap::new(),
            locations: Vec::new(),
            rows_written: 0,
        }
    }

    /// Stage one record. Flushes the bucket when it reaches the threshold and
    /// returns the new artifact's locator in that case.
    pub async fn add(&mut self, partition: PartitionKey, entity: &Entity, record: Record) -> Result<Option<String>> {
        let key = BucketKey::new(partition, entity.id.clone());
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            entity: entity.clone(),
            records: Vec::new(),
        });
        bucket.records.push(record);

        if bucket.records.len() >= self.threshold {
            debug!(bucket = %key, threshold = self.threshold, "Bucket full, flushing");
            return self.flush_bucket(&key).await;
        }
        Ok(None)
    }

    /// Flush every non-empty bucket in `scope`, in key order. Stops at the
    /// first storage error; buckets not yet flushed keep their records.
    pub async fn flush(&mut self, scope: FlushScope<'_>) -> Result<Vec<String>> {
        let keys: Vec<BucketKey> = match scope {
            FlushScope::Bucket(key) => vec![key.clone()],
            FlushScope::Partition(partition) => self
                .buckets
                .keys()
                .filter(|k| k.partition == partition)
                .cloned()
                .collect(),
            FlushScope::All => self.buckets.keys().cloned().collect(),
        };

        let mut written = Vec::new();
        for key in keys {
            if let Some(locator) = self.flush_bucket(&key).await? {
                written.push(locator);
            }
        }
        Ok(written)
    }

    async fn flush_bucket(&mut self, key: &BucketKey) -> Result<Option<String>> {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return Ok(None);
        };
        if bucket.records.is_empty() {
            return Ok(None);
        }

        if !self.cleared.contains(key) {
            let removed = self.store.delete_artifacts(&bucket.entity, key.partition).await?;
            self.cleared.insert(key.clone());
            if removed > 0 {
                info!(bucket = %key, removed, "Replaced artifacts from a previous run");
            }
        }

        let seq = self.batch_seq.get(key).copied().unwrap_or(0) + 1;
        let locator = self
            .store
            .write_artifact(&bucket.entity, key.partition, seq, &bucket.records)
            .await?;

        let rows = bucket.records.len();
        bucket.records.clear();
        self.batch_seq.insert(key.clone(), seq);
        self.rows_written += rows as u64;
        self.locations.push(locator.clone());
        info!(bucket = %key, batch = seq, rows, locator = locator.as_str(), "Flushed bucket");
        Ok(Some(locator))
    }

    /// Every artifact written this run, in write order.
    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Staged record counts per non-empty bucket.
    pub fn pending(&self) -> BTreeMap<BucketKey, usize> {
        self.buckets
            .iter()
            .filter(|(_, b)| !b.records.is_empty())
            .map(|(k, b)| (k.clone(), b.records.len()))
            .collect()
    }

    pub fn pending_rows(&self) -> usize {
        self.buckets.values().map(|b| b.records.len()).sum()
    }
}

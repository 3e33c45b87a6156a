//! Artifact naming, row encoding and the two production stores.
//!
//! Artifacts live at `[prefix/]dt=YYYY-MM-DD/{entity}_{source}_batch{N}.jsonl`,
//! one JSON object per line. Deleting an (entity, partition) pair removes every
//! object under `dt=YYYY-MM-DD/{entity}_{source}_`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use gcs_client::{Credentials, GcsClient};
use harvest_common::{Child, Entity, HarvestError, PartitionKey, Record, Result, StorageConfig};

use crate::traits::ArtifactStore;

const CONTENT_TYPE: &str = "application/x-ndjson";

pub fn partition_dir(prefix: &str, partition: PartitionKey) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("dt={}", partition.hive())
    } else {
        format!("{prefix}/dt={}", partition.hive())
    }
}

/// Common prefix of every artifact for one (entity, partition) pair.
pub fn artifact_stem(prefix: &str, partition: PartitionKey, entity_id: &str, source: &str) -> String {
    format!("{}/{entity_id}_{source}_", partition_dir(prefix, partition))
}

pub fn artifact_name(prefix: &str, partition: PartitionKey, entity_id: &str, source: &str, batch_seq: u32) -> String {
    format!("{}batch{batch_seq}.jsonl", artifact_stem(prefix, partition, entity_id, source))
}

/// One persisted row: the record, its replies nested, plus entity metadata and
/// the partition it was routed to.
#[derive(Debug, Serialize)]
pub struct ArtifactRow<'a> {
    pub entity_id: &'a str,
    pub entity_name: &'a str,
    pub external_code: &'a str,
    pub source_id: &'a str,
    pub author_name: &'a str,
    pub written_at: DateTime<Utc>,
    pub body: &'a str,
    pub like_count: u64,
    pub dislike_count: u64,
    pub children: &'a [Child],
    pub source: &'a str,
    pub dt: String,
}

pub fn encode_rows(entity: &Entity, partition: PartitionKey, source: &str, rows: &[Record]) -> Result<Vec<u8>> {
    let dt = partition.hive();
    let mut out = Vec::new();
    for record in rows {
        let row = ArtifactRow {
            entity_id: &entity.id,
            entity_name: &entity.name,
            external_code: &entity.external_code,
            source_id: &record.source_id,
            author_name: &record.author_name,
            written_at: record.written_at,
            body: &record.body,
            like_count: record.like_count,
            dislike_count: record.dislike_count,
            children: &record.children,
            source,
            dt: dt.clone(),
        };
        serde_json::to_writer(&mut out, &row)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Build the store named by `config`. The object store resolves its
/// credentials here, so a bad key fails the run before any crawling.
pub async fn from_config(config: &StorageConfig, source: &str) -> Result<Box<dyn ArtifactStore>> {
    match config {
        StorageConfig::Local { dir } => Ok(Box::new(LocalArtifactStore::new(dir, source))),
        StorageConfig::Gcs {
            bucket,
            prefix,
            credentials_file,
            credentials_json,
        } => {
            let credentials = gcs_credentials(credentials_file.as_ref(), credentials_json.as_deref());
            Ok(Box::new(GcsArtifactStore::connect(bucket, &credentials, prefix, source).await?))
        }
    }
}

/// Key JSON wins over a key file; with neither, ADC.
fn gcs_credentials(file: Option<&PathBuf>, json: Option<&str>) -> Credentials {
    match (json.filter(|j| !j.trim().is_empty()), file) {
        (Some(json), _) => Credentials::Json(json.to_string()),
        (None, Some(path)) => Credentials::File(path.clone()),
        (None, None) => Credentials::Default,
    }
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

pub struct LocalArtifactStore {
    root: PathBuf,
    source: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl AsRef<Path>, source: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            source: source.to_string(),
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> HarvestError {
    HarvestError::Storage(format!("{}: {err}", path.display()))
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn write_artifact(
        &self,
        entity: &Entity,
        partition: PartitionKey,
        batch_seq: u32,
        rows: &[Record],
    ) -> Result<String> {
        let name = artifact_name("", partition, &entity.id, &self.source, batch_seq);
        let path = self.root.join(&name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let bytes = encode_rows(entity, partition, &self.source, rows)?;
        tokio::fs::write(&path, &bytes).await.map_err(|e| io_error(&path, e))?;
        debug!(path = %path.display(), rows = rows.len(), "Wrote artifact");
        Ok(path.display().to_string())
    }

    async fn delete_artifacts(&self, entity: &Entity, partition: PartitionKey) -> Result<usize> {
        let dir = self.root.join(partition_dir("", partition));
        let stem = format!("{}_{}_", entity.id, self.source);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut deleted = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&stem));
            if matches {
                let path = entry.path();
                tokio::fs::remove_file(&path).await.map_err(|e| io_error(&path, e))?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(dir = %dir.display(), entity = entity.id.as_str(), deleted, "Removed stale artifacts");
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

pub struct GcsArtifactStore {
    client: GcsClient,
    prefix: String,
    source: String,
}

impl GcsArtifactStore {
    pub async fn connect(bucket: &str, credentials: &Credentials, prefix: &str, source: &str) -> Result<Self> {
        let client = GcsClient::connect(bucket, credentials).await.map_err(|e| match e {
            gcs_client::GcsError::Auth(_) | gcs_client::GcsError::Parse(_) => HarvestError::Configuration(e.to_string()),
            other => HarvestError::Storage(other.to_string()),
        })?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            source: source.to_string(),
        })
    }
}

fn gcs_error(err: gcs_client::GcsError) -> HarvestError {
    HarvestError::Storage(err.to_string())
}

#[async_trait]
impl ArtifactStore for GcsArtifactStore {
    async fn write_artifact(
        &self,
        entity: &Entity,
        partition: PartitionKey,
        batch_seq: u32,
        rows: &[Record],
    ) -> Result<String> {
        let name = artifact_name(&self.prefix, partition, &entity.id, &self.source, batch_seq);
        let bytes = encode_rows(entity, partition, &self.source, rows)?;
        self.client
            .upload(&name, bytes, CONTENT_TYPE)
            .await
            .map_err(gcs_error)?;
        Ok(self.client.locator(&name))
    }

    async fn delete_artifacts(&self, entity: &Entity, partition: PartitionKey) -> Result<usize> {
        let stem = artifact_stem(&self.prefix, partition, &entity.id, &self.source);
        let objects = self.client.list(&stem).await.map_err(gcs_error)?;
        for object in &objects {
            self.client.delete(&object.name).await.map_err(gcs_error)?;
        }
        if !objects.is_empty() {
            info!(
                bucket = self.client.bucket(),
                stem = stem.as_str(),
                deleted = objects.len(),
                "Removed stale artifacts"
            );
        }
        Ok(objects.len())
    }
}

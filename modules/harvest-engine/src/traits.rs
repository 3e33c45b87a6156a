// Collaborator seams for the crawl engine.
//
// SourceAdapter hides how a source lists and resolves items, including whether
// listing pages come from plain requests or from scripted browser navigation.
// ArtifactStore hides the object store. Both have in-memory doubles in
// `crate::testing`.

use async_trait::async_trait;

use harvest_common::{Child, Entity, ListingPage, PageToken, PartitionKey, RawPage, Record, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStyle {
    /// Page indexes, with optional escalation to scripted navigation.
    Paged,
    /// Reverse-chronological feed keyed by the last seen id.
    Cursor,
}

// ---------------------------------------------------------------------------
// SourceAdapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short tag used in artifact names, e.g. `naver`.
    fn source(&self) -> &str;

    fn pagination(&self) -> PaginationStyle {
        PaginationStyle::Paged
    }

    /// Markers whose presence in a response body means the crawler is being
    /// rejected. Content heuristics: best effort, they drift with the source.
    fn block_markers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Transport only. Parsing happens in [`SourceAdapter::parse_listing`]
    /// so the body can be checked for block markers first.
    async fn fetch_listing(&self, entity: &Entity, token: &PageToken) -> Result<RawPage>;

    fn parse_listing(&self, entity: &Entity, token: &PageToken, page: &RawPage) -> Result<ListingPage>;

    /// `Ok(None)` when the item no longer resolves to a record.
    async fn fetch_detail(&self, entity: &Entity, id: &str) -> Result<Option<Record>>;

    async fn fetch_children(&self, entity: &Entity, id: &str) -> Result<Vec<Child>>;

    /// Drop pooled connections and cookies before a retry.
    async fn reset_session(&self) {}

    /// Open a scripted navigation session for escalated pagination. `None`
    /// when the source cannot escalate.
    async fn scripted(&self, _entity: &Entity) -> Result<Option<Box<dyn ScriptedSession>>> {
        Ok(None)
    }
}

/// A stateful, single-owner navigation session (one per pagination stream).
#[async_trait]
pub trait ScriptedSession: Send {
    /// Listing pages skipped per `next` interaction.
    fn step(&self) -> u32;

    async fn open(&mut self, page: u32) -> Result<RawPage>;

    /// Trigger the "next" control. `Ok(None)` when no such control exists.
    async fn next(&mut self) -> Result<Option<RawPage>>;

    /// Message of an interstitial dialog seen since the last poll.
    async fn poll_dialog(&mut self) -> Option<String>;

    async fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist one batch and return its locator.
    async fn write_artifact(
        &self,
        entity: &Entity,
        partition: PartitionKey,
        batch_seq: u32,
        rows: &[Record],
    ) -> Result<String>;

    /// Delete every artifact previously written for this exact pair.
    async fn delete_artifacts(&self, entity: &Entity, partition: PartitionKey) -> Result<usize>;
}

//! Crawl orchestration: pagination, resilience, concurrent hydration and
//! date-partitioned persistence for discussion sources.

pub mod buffer;
pub mod fetcher;
pub mod orchestrator;
pub mod pagination;
pub mod resilience;
pub mod stats;
pub mod store;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use buffer::{BucketKey, FlushScope, PartitionedBuffer};
pub use fetcher::{ConcurrentFetcher, Hydrated};
pub use orchestrator::{Harvester, MetadataMap};
pub use pagination::{PaginationMode, PaginationOutcome, PaginationState, Paginator, StopReason};
pub use resilience::{BlockSignatures, Guarded, ListingGuard};
pub use stats::{EntityReport, EntityStatus, RunSummary};
pub use store::{GcsArtifactStore, LocalArtifactStore};
pub use traits::{ArtifactStore, PaginationStyle, ScriptedSession, SourceAdapter};

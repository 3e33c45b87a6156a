use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use harvest_common::{CrawlWindow, ErrorKind};

use crate::pagination::{PaginationMode, PaginationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Completed,
    /// Pagination stopped on a failure after some pages were read.
    Partial,
    /// Not even the first listing page could be read.
    Aborted,
    NoData,
}

/// How one entity's pagination went.
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub entity_id: String,
    pub status: EntityStatus,
    pub listed: usize,
    pub pages: u32,
    pub mode: PaginationMode,
    pub stop: String,
}

impl EntityReport {
    pub fn new(entity_id: &str, listed: usize, state: &PaginationState) -> Self {
        let failed = state.stop.as_ref().is_some_and(|s| s.is_failure());
        let status = match (failed, state.pages_fetched, listed) {
            (true, 0, _) => EntityStatus::Aborted,
            (true, _, _) => EntityStatus::Partial,
            (false, _, 0) => EntityStatus::NoData,
            (false, _, _) => EntityStatus::Completed,
        };
        Self {
            entity_id: entity_id.to_string(),
            status,
            listed,
            pages: state.pages_fetched,
            mode: state.mode,
            stop: state.stop.as_ref().map(ToString::to_string).unwrap_or_default(),
        }
    }
}

/// Stats from a harvest run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub listing_pages: u64,
    pub ids_listed: u64,
    pub records_ingested: u64,
    pub records_out_of_window: u64,
    pub items_dropped: u64,
    pub rows_written: u64,
    pub partitions_processed: u32,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub entities: Vec<EntityReport>,
    pub artifacts: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, source: impl Into<String>, window: &CrawlWindow) -> Self {
        Self {
            run_id: run_id.into(),
            source: source.into(),
            start_date: window.start,
            end_date: window.end,
            listing_pages: 0,
            ids_listed: 0,
            records_ingested: 0,
            records_out_of_window: 0,
            items_dropped: 0,
            rows_written: 0,
            partitions_processed: 0,
            errors: BTreeMap::new(),
            entities: Vec::new(),
            artifacts: Vec::new(),
            cancelled: false,
            elapsed_ms: 0,
        }
    }

    pub fn record_error(&mut self, kind: ErrorKind) {
        *self.errors.entry(kind).or_insert(0) += 1;
    }

    pub fn record_errors(&mut self, kinds: &[ErrorKind]) {
        for kind in kinds {
            self.record_error(*kind);
        }
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors.get(&kind).copied().unwrap_or(0)
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Harvest Run Complete ===")?;
        writeln!(f, "Run:                {}", self.run_id)?;
        writeln!(f, "Source:             {}", self.source)?;
        writeln!(f, "Window:             {} .. {}", self.start_date, self.end_date)?;
        if self.cancelled {
            writeln!(f, "Status:             CANCELLED (buffers flushed)")?;
        }
        writeln!(f, "Listing pages:      {}", self.listing_pages)?;
        writeln!(f, "Ids listed:         {}", self.ids_listed)?;
        writeln!(f, "Records ingested:   {}", self.records_ingested)?;
        writeln!(f, "Out of window:      {}", self.records_out_of_window)?;
        writeln!(f, "Items dropped:      {}", self.items_dropped)?;
        writeln!(f, "Rows written:       {}", self.rows_written)?;
        writeln!(f, "Partitions:         {}", self.partitions_processed)?;
        writeln!(f, "Artifacts:          {}", self.artifacts.len())?;
        writeln!(f, "Elapsed:            {:.1}s", self.elapsed_ms as f64 / 1000.0)?;

        if !self.errors.is_empty() {
            writeln!(f, "\nErrors:")?;
            for (kind, count) in &self.errors {
                writeln!(f, "  {:<18} {count}", kind.to_string())?;
            }
        }

        writeln!(f, "\nEntities:")?;
        for e in &self.entities {
            writeln!(
                f,
                "  {:<12} {:<10} listed={:<6} pages={:<4} mode={} stop={}",
                e.entity_id,
                format!("{:?}", e.status).to_lowercase(),
                e.listed,
                e.pages,
                e.mode,
                e.stop
            )?;
        }
        Ok(())
    }
}

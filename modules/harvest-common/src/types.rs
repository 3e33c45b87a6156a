use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

// --- Entities ---

/// A tracked entity whose discussion stream gets harvested.
///
/// `name` and `external_code` come from reference data and are copied onto
/// every persisted row; both may be empty when the lookup has nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub external_code: String,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            external_code: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_external_code(mut self, code: impl Into<String>) -> Self {
        self.external_code = code.into();
        self
    }
}

// --- Records ---

/// A reply owned by exactly one [`Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Child {
    pub author_name: String,
    pub written_at: Option<DateTime<Utc>>,
    pub body: String,
    pub like_count: u64,
    pub dislike_count: u64,
}

/// A fully hydrated discussion item. Identity is `(entity_id, source_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub source_id: String,
    pub entity_id: String,
    pub author_name: String,
    pub written_at: DateTime<Utc>,
    pub body: String,
    pub like_count: u64,
    pub dislike_count: u64,
    /// Reply count as reported by the source. `None` means the source did not
    /// say, which is different from reporting zero.
    pub reply_count: Option<u32>,
    pub children: Vec<Child>,
}

impl Record {
    /// Whether the secondary reply fetch is needed. A reported zero skips it.
    pub fn wants_children(&self) -> bool {
        self.reply_count != Some(0)
    }
}

/// One row of a listing page: an id plus the timestamp shown next to it.
/// `posted_at` is `None` when the listing's date could not be read; such items
/// are kept but never trigger an early stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedItem {
    pub id: String,
    pub posted_at: Option<DateTime<Utc>>,
}

impl ListedItem {
    pub fn new(id: impl Into<String>, posted_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            posted_at,
        }
    }
}

// --- Pagination ---

/// Opaque pagination position: a page index for paged sources, or the id of
/// the last seen record for cursor sources (`None` requests the newest batch).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageToken {
    Page(u32),
    Cursor(Option<String>),
}

impl std::fmt::Display for PageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageToken::Page(n) => write!(f, "page {n}"),
            PageToken::Cursor(Some(id)) => write!(f, "cursor {id}"),
            PageToken::Cursor(None) => f.write_str("cursor <head>"),
        }
    }
}

/// Undecoded response body, as seen before any block-signature check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl RawPage {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            body: body.into(),
        }
    }
}

/// A parsed listing page. `next` is only meaningful for cursor sources; paged
/// sources leave it `None` and the pagination engine computes the next index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub items: Vec<ListedItem>,
    pub next: Option<PageToken>,
}

// --- Dates ---

/// Date-derived grouping key for persisted artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(NaiveDate);

impl PartitionKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Derive the key from a record's own timestamp, in the source's local offset.
    pub fn from_timestamp(ts: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self(ts.with_timezone(&offset).date_naive())
    }

    /// Accepts `YYYYMMDD` or `YYYY-MM-DD`.
    pub fn parse(s: &str) -> Result<Self, HarvestError> {
        let fmt = if s.len() == 8 { "%Y%m%d" } else { "%Y-%m-%d" };
        NaiveDate::parse_from_str(s, fmt)
            .map(Self)
            .map_err(|e| HarvestError::Parse(format!("partition key {s:?}: {e}")))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// `YYYYMMDD`, used in buffer keys and logs.
    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    /// `YYYY-MM-DD`, used in `dt=` path segments and row columns.
    pub fn hive(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.compact())
    }
}

/// The inclusive `[start, end]` date range a run harvests, evaluated in the
/// source's local offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub offset: FixedOffset,
}

impl CrawlWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, offset: FixedOffset) -> Self {
        Self { start, end, offset }
    }

    /// The last `days` days ending today (local), inclusive.
    pub fn trailing_days(days: i64, offset: FixedOffset) -> Self {
        let end = Utc::now().with_timezone(&offset).date_naive();
        Self {
            start: end - Duration::days(days.saturating_sub(1)),
            end,
            offset,
        }
    }

    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.offset).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.local_date(Utc::now())
    }

    /// Newer than `end`; skipped without counting the page as empty.
    pub fn is_after(&self, ts: DateTime<Utc>) -> bool {
        self.local_date(ts) > self.end
    }

    /// Older than `start`; the early-stop condition.
    pub fn is_before(&self, ts: DateTime<Utc>) -> bool {
        self.local_date(ts) < self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        !self.is_after(ts) && !self.is_before(ts)
    }

    /// Local midnight of `date`, as UTC. Used for listings that only show a date.
    pub fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }

    pub fn partition_of(&self, ts: DateTime<Utc>) -> PartitionKey {
        PartitionKey::from_timestamp(ts, self.offset)
    }
}

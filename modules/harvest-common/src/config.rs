use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate};
use typed_builder::TypedBuilder;

use crate::error::{HarvestError, Result};
use crate::types::CrawlWindow;

/// Fixed-count retry with a constant delay. Attempts include the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// What happens once the block-retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAction {
    /// Stop this entity's pagination and report `BlockDetected`.
    Abort,
    /// Switch to scripted navigation, if the source offers it.
    Escalate,
}

impl FromStr for BlockAction {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(BlockAction::Abort),
            "escalate" => Ok(BlockAction::Escalate),
            other => Err(HarvestError::Configuration(format!(
                "HARVEST_ON_BLOCK must be `abort` or `escalate`, got {other:?}"
            ))),
        }
    }
}

/// Separate, longer budget for responses that look like a block page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub on_exhausted: BlockAction,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(60),
            on_exhausted: BlockAction::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local {
        dir: PathBuf,
    },
    /// Object store. With neither key set, Application Default Credentials
    /// are used.
    Gcs {
        bucket: String,
        prefix: String,
        credentials_file: Option<PathBuf>,
        credentials_json: Option<String>,
    },
}

/// Run configuration. Built from the environment in production and with
/// `HarvestConfig::builder()` in tests.
#[derive(Debug, Clone, TypedBuilder)]
pub struct HarvestConfig {
    pub window: CrawlWindow,

    #[builder(default = 20)]
    pub detail_concurrency: usize,
    #[builder(default = 5)]
    pub child_concurrency: usize,
    #[builder(default = 1)]
    pub entity_concurrency: usize,

    /// Rows per (partition, entity) bucket before it auto-flushes.
    #[builder(default = 1000)]
    pub buffer_size: usize,

    #[builder(default = RetryPolicy::new(3, Duration::from_secs(30)))]
    pub listing_retry: RetryPolicy,
    #[builder(default = RetryPolicy::new(3, Duration::from_secs(1)))]
    pub detail_retry: RetryPolicy,
    #[builder(default)]
    pub block: BlockPolicy,

    /// Page index at which link-based pagination hands over to scripted navigation.
    #[builder(default = 100)]
    pub escalation_page: u32,
    #[builder(default = 5)]
    pub empty_page_limit: u32,
    #[builder(default = true)]
    pub escalate_on_listing_failure: bool,

    #[builder(default = Duration::from_millis(1000))]
    pub request_delay: Duration,
    #[builder(default = Duration::from_millis(50))]
    pub detail_stagger: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,

    #[builder(default = StorageConfig::Local { dir: PathBuf::from("./harvest-output") })]
    pub storage: StorageConfig,

    #[builder(default)]
    pub browserless_url: Option<String>,
    #[builder(default)]
    pub browserless_token: Option<String>,
    #[builder(default)]
    pub feed_cookies: Option<String>,
}

impl HarvestConfig {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let offset = offset_from_hours(env_or("HARVEST_TZ_OFFSET_HOURS", 9)?)?;
        let default_window = CrawlWindow::trailing_days(3, offset);
        let start = optional_date("HARVEST_START_DATE")?.unwrap_or(default_window.start);
        let end = optional_date("HARVEST_END_DATE")?.unwrap_or(default_window.end);

        let storage = match env::var("HARVEST_STORAGE")
            .unwrap_or_else(|_| "local".to_string())
            .as_str()
        {
            "local" => StorageConfig::Local {
                dir: PathBuf::from(
                    env::var("HARVEST_OUTPUT_DIR").unwrap_or_else(|_| "./harvest-output".to_string()),
                ),
            },
            "gcs" => StorageConfig::Gcs {
                bucket: required_env("GCS_BUCKET_NAME")?,
                prefix: env::var("GCS_PREFIX").unwrap_or_default(),
                credentials_file: env::var("GCS_CREDENTIALS_FILE").ok().map(PathBuf::from),
                credentials_json: env::var("GCS_CREDENTIALS_JSON").ok(),
            },
            other => {
                return Err(HarvestError::Configuration(format!(
                    "HARVEST_STORAGE must be `local` or `gcs`, got {other:?}"
                )))
            }
        };

        let config = Self {
            window: CrawlWindow::new(start, end, offset),
            detail_concurrency: env_or("HARVEST_DETAIL_CONCURRENCY", 20)?,
            child_concurrency: env_or("HARVEST_CHILD_CONCURRENCY", 5)?,
            entity_concurrency: env_or("HARVEST_ENTITY_CONCURRENCY", 1)?,
            buffer_size: env_or("HARVEST_BUFFER_SIZE", 1000)?,
            listing_retry: RetryPolicy::new(
                env_or("HARVEST_LISTING_RETRIES", 3)?,
                Duration::from_secs(env_or("HARVEST_LISTING_RETRY_DELAY_SECS", 30)?),
            ),
            detail_retry: RetryPolicy::new(
                env_or("HARVEST_DETAIL_RETRIES", 3)?,
                Duration::from_millis(env_or("HARVEST_DETAIL_RETRY_DELAY_MS", 1000)?),
            ),
            block: BlockPolicy {
                max_retries: env_or("HARVEST_BLOCK_RETRIES", 3)?,
                backoff: Duration::from_secs(env_or("HARVEST_BLOCK_BACKOFF_SECS", 60)?),
                on_exhausted: env_or("HARVEST_ON_BLOCK", BlockAction::Abort)?,
            },
            escalation_page: env_or("HARVEST_ESCALATION_PAGE", 100)?,
            empty_page_limit: env_or("HARVEST_EMPTY_PAGE_LIMIT", 5)?,
            escalate_on_listing_failure: env_or("HARVEST_ESCALATE_ON_LISTING_FAILURE", true)?,
            request_delay: Duration::from_millis(env_or("HARVEST_REQUEST_DELAY_MS", 1000)?),
            detail_stagger: Duration::from_millis(env_or("HARVEST_DETAIL_STAGGER_MS", 50)?),
            request_timeout: Duration::from_secs(env_or("HARVEST_REQUEST_TIMEOUT_SECS", 30)?),
            storage,
            browserless_url: env::var("BROWSERLESS_URL").ok(),
            browserless_token: env::var("BROWSERLESS_TOKEN").ok(),
            feed_cookies: env::var("FEED_COOKIES").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the run meaningless. Called before any
    /// network work starts.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.window.start > self.window.end {
            errors.push(format!(
                "start date {} is after end date {}",
                self.window.start, self.window.end
            ));
        }
        if self.detail_concurrency == 0 {
            errors.push("detail concurrency must be at least 1".to_string());
        }
        if self.child_concurrency == 0 {
            errors.push("child concurrency must be at least 1".to_string());
        }
        if self.entity_concurrency == 0 {
            errors.push("entity concurrency must be at least 1".to_string());
        }
        if self.buffer_size == 0 {
            errors.push("buffer size must be at least 1".to_string());
        }
        if self.listing_retry.max_attempts == 0 || self.detail_retry.max_attempts == 0 {
            errors.push("retry budgets must allow at least one attempt".to_string());
        }
        if self.empty_page_limit == 0 {
            errors.push("empty page limit must be at least 1".to_string());
        }
        if self.escalation_page == 0 {
            errors.push("escalation page must be at least 1".to_string());
        }
        if self.request_timeout.is_zero() {
            errors.push("request timeout must be finite and non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HarvestError::Configuration(errors.join("; ")))
        }
    }

    /// Log the effective configuration with secrets reduced to a preview.
    pub fn log_redacted(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => format!("<set, {} chars>", v.len()),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!(
            start = %self.window.start,
            end = %self.window.end,
            offset = %self.window.offset,
            detail_concurrency = self.detail_concurrency,
            child_concurrency = self.child_concurrency,
            entity_concurrency = self.entity_concurrency,
            buffer_size = self.buffer_size,
            escalation_page = self.escalation_page,
            empty_page_limit = self.empty_page_limit,
            on_block = ?self.block.on_exhausted,
            "Config loaded"
        );
        match &self.storage {
            StorageConfig::Local { dir } => {
                tracing::info!(dir = %dir.display(), "Storage: local filesystem")
            }
            StorageConfig::Gcs {
                bucket,
                prefix,
                credentials_file,
                credentials_json,
            } => tracing::info!(
                bucket = bucket.as_str(),
                prefix = prefix.as_str(),
                credentials_file = ?credentials_file,
                credentials_json = %preview_opt(credentials_json),
                "Storage: object store"
            ),
        }
        tracing::info!(
            browserless_url = %preview_opt(&self.browserless_url),
            browserless_token = %preview_opt(&self.browserless_token),
            feed_cookies = %preview_opt(&self.feed_cookies),
            "Collaborators"
        );
    }
}

fn offset_from_hours(hours: i32) -> Result<FixedOffset> {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| HarvestError::Configuration(format!("HARVEST_TZ_OFFSET_HOURS out of range: {hours}")))
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| HarvestError::Configuration(format!("{key} environment variable is required")))
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| HarvestError::Configuration(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn optional_date(key: &str) -> Result<Option<NaiveDate>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|_| HarvestError::Configuration(format!("{key} must be YYYY-MM-DD, got {raw:?}"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: (i32, u32, u32), end: (i32, u32, u32)) -> CrawlWindow {
        CrawlWindow::new(
            NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
            FixedOffset::east_opt(9 * 3600).unwrap(),
        )
    }

    #[test]
    fn defaults_validate() {
        let config = HarvestConfig::builder()
            .window(window((2025, 1, 1), (2025, 1, 7)))
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.escalation_page, 100);
        assert_eq!(config.empty_page_limit, 5);
    }

    #[test]
    fn inverted_window_is_a_configuration_error() {
        let config = HarvestConfig::builder()
            .window(window((2025, 1, 7), (2025, 1, 1)))
            .build();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(_)));
    }

    #[test]
    fn all_problems_are_reported_together() {
        let config = HarvestConfig::builder()
            .window(window((2025, 1, 1), (2025, 1, 1)))
            .detail_concurrency(0)
            .buffer_size(0)
            .build();
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("detail concurrency"));
        assert!(msg.contains("buffer size"));
    }

    #[test]
    fn block_action_parses_case_insensitively() {
        assert_eq!("Escalate".parse::<BlockAction>().unwrap(), BlockAction::Escalate);
        assert_eq!("abort".parse::<BlockAction>().unwrap(), BlockAction::Abort);
        assert!("retry".parse::<BlockAction>().is_err());
    }

    #[test]
    fn utc_offset_hours_are_range_checked() {
        assert_eq!(offset_from_hours(9).unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(offset_from_hours(-5).unwrap().local_minus_utc(), -5 * 3600);
        assert!(matches!(offset_from_hours(24), Err(HarvestError::Configuration(_))));
        assert!(matches!(offset_from_hours(i32::MAX), Err(HarvestError::Configuration(_))));
        assert!(matches!(offset_from_hours(i32::MIN), Err(HarvestError::Configuration(_))));
    }
}

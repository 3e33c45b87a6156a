use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harvest_common::{CrawlWindow, Entity, HarvestConfig};
use harvest_engine::{store, ArtifactStore, Harvester};
use harvest_sources::SourceKind;

#[derive(Parser)]
#[command(name = "harvester", about = "Harvest discussion threads into date-partitioned artifacts")]
struct Cli {
    /// `board` (paged discussion board) or `feed` (cursor community feed)
    #[arg(long, default_value = "board")]
    source: String,

    /// Entity ids to harvest, comma separated
    #[arg(long, value_delimiter = ',')]
    entities: Vec<String>,

    /// JSON file with `[{"id", "name", "external_code"}]` entries
    #[arg(long)]
    entities_file: Option<PathBuf>,

    /// First day of the window (YYYY-MM-DD), overrides HARVEST_START_DATE.
    /// Given alone, the end follows so the configured window length is kept.
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day of the window (YYYY-MM-DD), overrides HARVEST_END_DATE.
    /// Given alone, the start follows so the configured window length is kept.
    #[arg(long)]
    end: Option<NaiveDate>,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("harvest_engine=info".parse()?);
    let json = std::env::var("HARVEST_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Apply `--start`/`--end` to the configured window. A lone bound drags the
/// other one along, keeping the window length.
fn override_window(window: CrawlWindow, start: Option<NaiveDate>, end: Option<NaiveDate>) -> CrawlWindow {
    let span = window.end - window.start;
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        (Some(start), None) => (start, start + span),
        (None, Some(end)) => (end - span, end),
        (None, None) => (window.start, window.end),
    };
    CrawlWindow::new(start, end, window.offset)
}

fn load_entities(cli: &Cli) -> Result<Vec<Entity>> {
    let mut given: Vec<Entity> = cli.entities.iter().map(|id| Entity::new(id.trim())).collect();
    if let Some(path) = &cli.entities_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read entities file {}", path.display()))?;
        let listed: Vec<Entity> = serde_json::from_str(&raw)
            .with_context(|| format!("Entities file {} is not a JSON entity list", path.display()))?;
        given.extend(listed);
    }

    // One entry per id; a repeat only fills in reference data the first lacked
    let mut entities: Vec<Entity> = Vec::with_capacity(given.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for entity in given {
        match index.get(&entity.id) {
            Some(&at) => {
                warn!(entity = entity.id.as_str(), "Entity listed more than once");
                let kept = &mut entities[at];
                if kept.name.is_empty() {
                    kept.name = entity.name;
                }
                if kept.external_code.is_empty() {
                    kept.external_code = entity.external_code;
                }
            }
            None => {
                index.insert(entity.id.clone(), entities.len());
                entities.push(entity);
            }
        }
    }

    anyhow::ensure!(!entities.is_empty(), "No entities given; use --entities or --entities-file");
    Ok(entities)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let mut config = HarvestConfig::from_env().context("Failed to load configuration")?;
    if cli.start.is_some() || cli.end.is_some() {
        config.window = override_window(config.window, cli.start, cli.end);
        config.validate().context("Invalid window override")?;
    }
    config.log_redacted();

    let entities = load_entities(&cli)?;
    let kind: SourceKind = cli.source.parse()?;
    let adapter = kind.adapter(&config).context("Failed to build source adapter")?;
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::from(store::from_config(&config.storage, adapter.source()).await?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work and flushing buffers");
            on_signal.cancel();
        }
    });

    let harvester = Harvester::new(adapter, artifacts, config).with_cancellation(cancel);
    info!(run_id = harvester.run_id(), entities = entities.len(), source = %cli.source, "Harvester starting");

    let summary = harvester.run(&entities).await.context("Harvest run failed")?;
    info!(summary = %serde_json::to_string(&summary)?, "Run summary");
    println!("{summary}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_are_comma_separated() {
        let cli = Cli::try_parse_from(["harvester", "--entities", "005930, 000660", "--start", "2025-01-01"]).unwrap();
        let entities = load_entities(&cli).unwrap();
        let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["005930", "000660"]);
        assert_eq!(cli.start, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert_eq!(cli.source, "board");
    }

    #[test]
    fn no_entities_is_an_error() {
        let cli = Cli::try_parse_from(["harvester"]).unwrap();
        assert!(load_entities(&cli).is_err());
    }

    fn kst_window(start: &str, end: &str) -> CrawlWindow {
        let day = |d: &str| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap();
        CrawlWindow::new(day(start), day(end), chrono::FixedOffset::east_opt(9 * 3600).unwrap())
    }

    #[test]
    fn a_lone_bound_keeps_the_configured_window_length() {
        let configured = kst_window("2025-03-08", "2025-03-10");
        let day = |d: &str| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap();

        let past = override_window(configured, None, Some(day("2025-01-05")));
        assert_eq!((past.start, past.end), (day("2025-01-03"), day("2025-01-05")));

        let from = override_window(configured, Some(day("2025-02-01")), None);
        assert_eq!((from.start, from.end), (day("2025-02-01"), day("2025-02-03")));

        let both = override_window(configured, Some(day("2025-02-01")), Some(day("2025-02-01")));
        assert_eq!(both.start, both.end);
        assert_eq!(both.offset, configured.offset);
    }

    #[test]
    fn repeated_entity_ids_collapse_into_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.json");
        std::fs::write(
            &path,
            r#"[{"id": "005930", "name": "Samsung", "external_code": "KR7005930003"}, {"id": "000660"}]"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "harvester",
            "--entities",
            "005930,005930",
            "--entities-file",
            path.to_str().unwrap(),
        ])
        .unwrap();

        let entities = load_entities(&cli).unwrap();

        let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["005930", "000660"]);
        assert_eq!(entities[0].name, "Samsung");
        assert_eq!(entities[0].external_code, "KR7005930003");
    }
}

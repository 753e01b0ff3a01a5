//! Ingestion, scoring and competitor matching pipeline for dealhunt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dealhunt_adapters::{CompetitorMatcher, HttpPageSource, TavilySearch};
use dealhunt_storage::{PgStore, Store};
use uuid::Uuid;

pub mod brand;
pub mod competitors;
pub mod ingest;
pub mod pipeline;
pub mod reports;
pub mod scoring;

pub use brand::{near_duplicates, normalize as normalize_brand, slugify, BrandPair, BrandResolver};
pub use competitors::{CompetitorConfig, CompetitorJob, CompetitorJobReport};
pub use ingest::{IngestConfig, IngestError, IngestReport, IngestionContext, Ingestor, RecordError};
pub use pipeline::{
    ensure_workspace_dirs, load_source_registry, load_taxonomy, SourceConfig, SourceMode,
    SourceRegistry, SyncConfig, SyncPipeline, SyncRunSummary,
};
pub use reports::report_daily_markdown;
pub use scoring::{score, ScoreInput};

pub const CRATE_NAME: &str = "dealhunt-sync";

pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.redacted_database_url()))?;
    Ok(Arc::new(store))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    ensure_workspace_dirs(&config).await?;
    let store = connect_store(&config).await?;
    let classifier = Arc::new(config.classifier()?);
    let pipeline = SyncPipeline::new(config, store, classifier)?;
    pipeline.run_once().await
}

/// Competitor job wired to the configured search API and render service.
pub fn build_competitor_job(
    config: &SyncConfig,
    store: Arc<dyn Store>,
    competitor: CompetitorConfig,
) -> Result<CompetitorJob> {
    let api_key = config
        .search_api_key
        .clone()
        .context("SEARCH_API_KEY must be set for competitor matching")?;
    let http = Arc::new(config.http_fetcher()?);
    let search = TavilySearch::new(http.client().clone(), config.search_api_url.clone(), api_key);
    let pages = HttpPageSource::new(
        Arc::clone(&http),
        Uuid::new_v4(),
        config.render_url.clone(),
        config.http_timeout().max(Duration::from_secs(30)),
    );
    let matcher = CompetitorMatcher::new(Arc::new(search), Arc::new(pages));
    Ok(CompetitorJob::new(store, matcher, competitor))
}

//! Retailer scraper contracts, the classifier client and competitor search.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealhunt_core::ScrapedRecord;
use dealhunt_storage::{FetchError, HttpFetcher, PageArchive};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod classifier;
pub mod competitor;
pub mod search;
pub mod tiles;
pub mod variants;

pub use classifier::{
    BatchResult, Classification, ClassificationInput, Classifier, ClassifierError, LlmClassifier,
    Taxonomy, TaxonomyNode, MAX_BATCH,
};
pub use competitor::{
    clean_query, compare_prices, Cheaper, CompetitorMatcher, CompetitorSite, PriceComparison,
    RenderMode, SiteSearchResult,
};
pub use search::{HttpPageSource, PageSource, SearchError, SiteSearch, TavilySearch};
pub use tiles::{HtmlTileScraper, TileError, TileSelectors};

pub const CRATE_NAME: &str = "dealhunt-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The retailers whose category listings are ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retailer {
    Sephora,
    Nocibe,
    Marionnaud,
}

impl Retailer {
    pub const ALL: [Retailer; 3] = [Retailer::Sephora, Retailer::Nocibe, Retailer::Marionnaud];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sephora => "sephora",
            Self::Nocibe => "nocibe",
            Self::Marionnaud => "marionnaud",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(value.trim()))
    }

    /// Merchant id stamped on products and deals scraped from this retailer.
    pub fn merchant_id(self) -> &'static str {
        self.as_str()
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Sephora => "Sephora",
            Self::Nocibe => "Nocibé",
            Self::Marionnaud => "Marionnaud",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub success: bool,
    pub records: Vec<ScrapedRecord>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait Scraper: Send + Sync {
    fn retailer(&self) -> Retailer;

    async fn init(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Never fails as a whole: page and tile failures are reported in
    /// [`ScrapeOutcome::errors`].
    async fn scrape(&self, category_url: &str, max_records: usize) -> ScrapeOutcome;

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Sequential page walk settings for live scrapers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePacing {
    pub delay: Duration,
    pub page_timeout: Duration,
    pub max_pages: usize,
}

impl Default for PagePacing {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1500),
            page_timeout: Duration::from_secs(30),
            max_pages: 10,
        }
    }
}

pub enum ScraperBackend {
    Html {
        http: Arc<HttpFetcher>,
        archive: Option<PageArchive>,
        run_id: Uuid,
        selectors: Option<TileSelectors>,
        pacing: PagePacing,
    },
    Fixture {
        root: PathBuf,
    },
}

pub fn scraper_for(retailer: Retailer, backend: ScraperBackend) -> Box<dyn Scraper> {
    match backend {
        ScraperBackend::Html {
            http,
            archive,
            run_id,
            selectors,
            pacing,
        } => Box::new(HtmlTileScraper {
            retailer,
            http,
            archive,
            run_id,
            selectors: selectors.unwrap_or_else(|| TileSelectors::for_retailer(retailer)),
            pacing,
        }),
        ScraperBackend::Fixture { root } => Box::new(FixtureScraper::new(retailer, root)),
    }
}

/// A recorded listing capture: inline records and/or a raw category page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingBundle {
    pub retailer: Retailer,
    pub fetched_at: DateTime<Utc>,
    pub pages: Vec<BundlePage>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlePage {
    pub category_url: String,
    #[serde(default)]
    pub category: String,
    /// Path of a captured HTML page, relative to the bundle file.
    #[serde(default)]
    pub raw_path: Option<String>,
    #[serde(default)]
    pub records: Vec<ScrapedRecord>,
}

pub fn load_listing_bundle(path: impl AsRef<Path>) -> Result<ListingBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays `fixtures/<retailer>/bundle.json` instead of fetching live pages.
#[derive(Debug, Clone)]
pub struct FixtureScraper {
    retailer: Retailer,
    root: PathBuf,
}

impl FixtureScraper {
    pub fn new(retailer: Retailer, root: impl Into<PathBuf>) -> Self {
        Self {
            retailer,
            root: root.into(),
        }
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.root.join(self.retailer.as_str()).join("bundle.json")
    }

    fn page_records(&self, bundle_path: &Path, page: &BundlePage) -> (Vec<ScrapedRecord>, Vec<String>) {
        let mut records = page.records.clone();
        let mut errors = Vec::new();
        let Some(raw_path) = &page.raw_path else {
            return (records, errors);
        };
        let raw_path = bundle_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(raw_path);
        let html = match fs::read_to_string(&raw_path) {
            Ok(html) => html,
            Err(err) => {
                errors.push(format!("reading {}: {err}", raw_path.display()));
                return (records, errors);
            }
        };
        let selectors = TileSelectors::for_retailer(self.retailer);
        match tiles::parse_listing_page(&html, &page.category_url, &page.category, &selectors) {
            Ok(tiles) => {
                for tile in tiles {
                    match tile {
                        Ok(record) => records.push(record),
                        Err(err) => errors.push(err.to_string()),
                    }
                }
            }
            Err(err) => errors.push(err.to_string()),
        }
        (records, errors)
    }
}

#[async_trait]
impl Scraper for FixtureScraper {
    fn retailer(&self) -> Retailer {
        self.retailer
    }

    async fn scrape(&self, category_url: &str, max_records: usize) -> ScrapeOutcome {
        let started = Instant::now();
        let bundle_path = self.bundle_path();
        let bundle = match load_listing_bundle(&bundle_path) {
            Ok(bundle) => bundle,
            Err(err) => {
                warn!(retailer = self.retailer.as_str(), error = %err, "fixture bundle unavailable");
                return ScrapeOutcome {
                    success: false,
                    records: Vec::new(),
                    errors: vec![format!("{err:#}")],
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };
        if bundle.retailer != self.retailer {
            return ScrapeOutcome {
                success: false,
                records: Vec::new(),
                errors: vec![format!(
                    "bundle retailer={} does not match scraper retailer={}",
                    bundle.retailer.as_str(),
                    self.retailer.as_str()
                )],
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        let mut records = Vec::new();
        let mut errors = Vec::new();
        for page in bundle.pages.iter().filter(|p| p.category_url == category_url) {
            let (page_records, page_errors) = self.page_records(&bundle_path, page);
            records.extend(page_records);
            errors.extend(page_errors);
        }
        records.truncate(max_records);
        debug!(
            retailer = self.retailer.as_str(),
            category_url,
            records = records.len(),
            "fixture listing replayed"
        );
        ScrapeOutcome {
            success: !records.is_empty() || errors.is_empty(),
            records,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn close(&self) -> Result<(), AdapterError> {
        info!(retailer = self.retailer.as_str(), "fixture scraper closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn retailer_ids_round_trip_through_parse() {
        for retailer in Retailer::ALL {
            assert_eq!(Retailer::parse(retailer.as_str()), Some(retailer));
        }
        assert_eq!(Retailer::parse(" Nocibe "), Some(Retailer::Nocibe));
        assert_eq!(Retailer::parse("douglas"), None);
    }

    #[tokio::test]
    async fn fixture_scraper_replays_inline_and_raw_records() {
        let scraper = scraper_for(
            Retailer::Nocibe,
            ScraperBackend::Fixture {
                root: workspace_root().join("fixtures"),
            },
        );
        let outcome = scraper
            .scrape("https://www.nocibe.fr/parfum-femme/c/100", 50)
            .await;
        assert!(outcome.success, "errors: {:?}", outcome.errors);
        assert!(outcome.records.len() >= 3);
        assert!(outcome
            .records
            .iter()
            .all(|r| r.product_url.starts_with("https://www.nocibe.fr/")));
    }

    #[tokio::test]
    async fn fixture_scraper_respects_max_records() {
        let scraper = FixtureScraper::new(Retailer::Nocibe, workspace_root().join("fixtures"));
        let outcome = scraper
            .scrape("https://www.nocibe.fr/parfum-femme/c/100", 1)
            .await;
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn missing_bundle_is_reported_not_raised() {
        let dir = std::env::temp_dir().join(format!("dealhunt-missing-{}", Uuid::new_v4()));
        let scraper = FixtureScraper::new(Retailer::Sephora, dir);
        let outcome = scraper.scrape("https://www.sephora.fr/parfum/", 10).await;
        assert!(!outcome.success);
        assert_eq!(outcome.errors.len(), 1);
    }
}

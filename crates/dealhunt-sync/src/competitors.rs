//! Cross-retailer price lookups for deals already in the catalog.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dealhunt_adapters::{clean_query, compare_prices, Cheaper, CompetitorMatcher, CompetitorSite};
use dealhunt_core::CompetitorPrice;
use dealhunt_storage::{DealListing, Store, StoreResult};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct CompetitorConfig {
    /// Pause between two searches, whatever site they target.
    pub site_delay: Duration,
    pub max_deals: usize,
    pub deadline: Duration,
    pub sites: Vec<CompetitorSite>,
}

impl Default for CompetitorConfig {
    fn default() -> Self {
        Self {
            site_delay: Duration::from_secs(2),
            max_deals: 25,
            deadline: Duration::from_secs(15 * 60),
            sites: CompetitorSite::RETAILERS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub deal_id: Uuid,
    pub merchant_id: String,
    pub ours: f64,
    pub theirs: f64,
    pub cheaper: Cheaper,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetitorJobReport {
    pub deals_considered: usize,
    pub searches: usize,
    pub found: usize,
    pub upserted: usize,
    pub deadline_hit: bool,
    pub errors: Vec<String>,
    pub comparisons: Vec<ComparisonRow>,
}

pub struct CompetitorJob {
    store: Arc<dyn Store>,
    matcher: CompetitorMatcher,
    config: CompetitorConfig,
}

impl CompetitorJob {
    pub fn new(store: Arc<dyn Store>, matcher: CompetitorMatcher, config: CompetitorConfig) -> Self {
        Self {
            store,
            matcher,
            config,
        }
    }

    /// Walks the most recently updated deals, searching each configured site
    /// except the deal's own merchant. Stops at the deadline; what was
    /// already stored stays stored.
    pub async fn run(&self) -> StoreResult<CompetitorJobReport> {
        let started = Instant::now();
        let listings = self.store.list_scored_deals(self.config.max_deals).await?;
        let mut report = CompetitorJobReport::default();
        let mut first_search = true;

        'deals: for listing in &listings {
            let span = info_span!("competitor_deal", deal_id = %listing.deal.id);
            report.deals_considered += 1;
            let query = search_query(listing);
            let target = listing.variant.volume();

            for site in self
                .config
                .sites
                .iter()
                .copied()
                .filter(|s| s.merchant_id() != listing.deal.merchant_id)
            {
                if started.elapsed() >= self.config.deadline {
                    warn!(processed = report.deals_considered, "competitor job deadline reached");
                    report.deadline_hit = true;
                    break 'deals;
                }
                if !first_search && !self.config.site_delay.is_zero() {
                    tokio::time::sleep(self.config.site_delay).await;
                }
                first_search = false;
                report.searches += 1;

                let result = self
                    .matcher
                    .search_on_site(&query, site, &target)
                    .instrument(span.clone())
                    .await;
                if let Some(error) = result.error {
                    report.errors.push(format!("{} {}: {error}", listing.deal.id, site.as_str()));
                    continue;
                }
                let (true, Some(price)) = (result.found, result.current_price) else {
                    continue;
                };
                report.found += 1;

                let competitor = CompetitorPrice {
                    deal_id: listing.deal.id,
                    merchant_id: site.merchant_id().to_string(),
                    price,
                    original_price: result.original_price,
                    product_url: result.url.unwrap_or_default(),
                    volume: result.volume,
                    in_stock: result.in_stock.unwrap_or(true),
                    last_checked: Utc::now(),
                };
                match self.store.upsert_competitor_price(&competitor).await {
                    Ok(()) => {
                        report.upserted += 1;
                        let comparison = compare_prices(listing.deal.deal_price, price);
                        report.comparisons.push(ComparisonRow {
                            deal_id: listing.deal.id,
                            merchant_id: competitor.merchant_id.clone(),
                            ours: listing.deal.deal_price,
                            theirs: price,
                            cheaper: comparison.cheaper,
                        });
                    }
                    Err(err) => {
                        report.errors.push(format!("{} {}: {err}", listing.deal.id, site.as_str()))
                    }
                }
            }
        }

        info!(
            deals = report.deals_considered,
            searches = report.searches,
            upserted = report.upserted,
            errors = report.errors.len(),
            "competitor job finished"
        );
        Ok(report)
    }
}

fn search_query(listing: &DealListing) -> String {
    let title = listing
        .deal
        .refined_title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(&listing.deal.title);
    clean_query(title, listing.brand_name.as_deref())
}

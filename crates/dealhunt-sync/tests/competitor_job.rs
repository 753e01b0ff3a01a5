use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dealhunt_adapters::{Cheaper, CompetitorMatcher, PageSource, RenderMode, SearchError, SiteSearch};
use dealhunt_core::{Brand, BrandTier, Deal, NewCatalogEntry, PriceHistoryEntry, Product, Variant, VolumeUnit};
use dealhunt_storage::{MemoryStore, Store};
use dealhunt_sync::{CompetitorConfig, CompetitorJob};
use uuid::Uuid;

struct DomainSearch;

#[async_trait]
impl SiteSearch for DomainSearch {
    async fn search(&self, _query: &str, domain: &str, _max_results: usize) -> Result<Vec<String>, SearchError> {
        let urls = match domain {
            "sephora.fr" => vec![
                "https://www.sephora.fr/shop/parfum-homme-c302/",
                "https://www.sephora.fr/p/sauvage-eau-de-toilette-P12345.html",
            ],
            "marionnaud.fr" => vec!["https://www.marionnaud.fr/parfum/homme/sauvage/p/BP_98765"],
            _ => vec!["https://www.nocibe.fr/p/dior-sauvage-eau-de-toilette-42"],
        };
        Ok(urls.into_iter().map(ToString::to_string).collect())
    }
}

struct SitePages;

const SEPHORA_PAGE: &str = r#"<ul class="variation-selector">
    <li class="variation"><span class="variation-name">60 ml</span><span class="variation-price">64,00 €</span></li>
    <li class="variation"><span class="variation-name">100 ml</span><span class="variation-price">82,00 €</span><span class="variation-price-old">99,00 €</span></li>
</ul>"#;

const MARIONNAUD_PAGE: &str = r#"<div class="product-variants">
    <div class="product-variants__item"><span class="product-variants__size">50 ml</span><span class="product-variants__price">59,90 €</span></div>
</div>"#;

#[async_trait]
impl PageSource for SitePages {
    async fn page_html(&self, url: &str, _mode: RenderMode) -> Result<String, SearchError> {
        if url.contains("sephora.fr") {
            Ok(SEPHORA_PAGE.to_string())
        } else if url.contains("marionnaud.fr") {
            Ok(MARIONNAUD_PAGE.to_string())
        } else {
            panic!("the deal's own merchant must not be searched: {url}");
        }
    }
}

async fn seeded_store() -> (Arc<MemoryStore>, Uuid) {
    let store = Arc::new(MemoryStore::new());
    let brand = Brand {
        id: Uuid::new_v4(),
        name: "Dior".into(),
        slug: "dior".into(),
        aliases: Vec::new(),
    };
    store.create_brand(&brand).await.unwrap();

    let now = Utc::now();
    let product_id = Uuid::new_v4();
    let variant_id = Uuid::new_v4();
    let deal_id = Uuid::new_v4();
    store.seed(NewCatalogEntry {
        product: Product {
            id: product_id,
            name: "Sauvage Eau de Toilette".into(),
            normalized_name: "sauvage eau de toilette".into(),
            slug: "dior-sauvage-eau-de-toilette-100-ml".into(),
            brand_id: Some(brand.id),
            category_slug: Some("parfum".into()),
            subcategory_slug: Some("parfum-homme".into()),
            subsubcategory_slug: None,
            merchant_id: "nocibe".into(),
            product_url: "https://www.nocibe.fr/p/dior-sauvage-eau-de-toilette-42".into(),
            image_url: None,
            created_at: now,
            updated_at: now,
        },
        variant: Variant {
            id: variant_id,
            product_id,
            volume_value: 100.0,
            volume_unit: VolumeUnit::Ml,
            raw_volume: "100 ml".into(),
            external_code: None,
        },
        deal: Deal {
            id: deal_id,
            product_id,
            variant_id,
            merchant_id: "nocibe".into(),
            title: "Sauvage Eau de Toilette 100 ml".into(),
            refined_title: Some("Dior Sauvage Eau de Toilette".into()),
            deal_price: 78.0,
            original_price: 104.0,
            discount_percent: 25.0,
            discount_amount: 26.0,
            score: 62,
            tags: "luxury".into(),
            brand_tier: Some(BrandTier::Luxury),
            is_hot: false,
            is_trending: false,
            is_expired: false,
            votes: 0,
            views: 0,
            created_at: now,
            updated_at: now,
        },
        initial_price: PriceHistoryEntry {
            id: Uuid::new_v4(),
            product_id,
            price: 78.0,
            recorded_at: now,
        },
    });
    (store, deal_id)
}

fn job(store: &Arc<MemoryStore>, config: CompetitorConfig) -> CompetitorJob {
    CompetitorJob::new(
        store.clone(),
        CompetitorMatcher::new(Arc::new(DomainSearch), Arc::new(SitePages)),
        config,
    )
}

#[tokio::test]
async fn stores_exact_size_prices_from_other_retailers() {
    let (store, deal_id) = seeded_store().await;
    let config = CompetitorConfig {
        site_delay: Duration::ZERO,
        ..CompetitorConfig::default()
    };

    let report = job(&store, config).run().await.unwrap();

    assert_eq!(report.deals_considered, 1);
    assert_eq!(report.searches, 2);
    assert_eq!(report.found, 1);
    assert_eq!(report.upserted, 1);
    assert!(report.errors.is_empty());
    assert!(!report.deadline_hit);

    let prices = store.competitor_prices_for_deal(deal_id).await.unwrap();
    assert_eq!(prices.len(), 1);
    assert_eq!(prices[0].merchant_id, "sephora");
    assert_eq!(prices[0].price, 82.0);
    assert_eq!(prices[0].original_price, Some(99.0));
    assert_eq!(prices[0].volume.as_deref(), Some("100 ml"));
    assert_eq!(
        prices[0].product_url,
        "https://www.sephora.fr/p/sauvage-eau-de-toilette-P12345.html"
    );

    assert_eq!(report.comparisons.len(), 1);
    assert_eq!(report.comparisons[0].cheaper, Cheaper::Ours);
}

#[tokio::test]
async fn rerun_overwrites_the_competitor_row() {
    let (store, deal_id) = seeded_store().await;
    let config = CompetitorConfig {
        site_delay: Duration::ZERO,
        ..CompetitorConfig::default()
    };

    job(&store, config.clone()).run().await.unwrap();
    job(&store, config).run().await.unwrap();

    assert_eq!(store.competitor_prices_for_deal(deal_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn zero_deadline_stops_before_searching() {
    let (store, deal_id) = seeded_store().await;
    let config = CompetitorConfig {
        site_delay: Duration::ZERO,
        deadline: Duration::ZERO,
        ..CompetitorConfig::default()
    };

    let report = job(&store, config).run().await.unwrap();

    assert!(report.deadline_hit);
    assert_eq!(report.searches, 0);
    assert!(store.competitor_prices_for_deal(deal_id).await.unwrap().is_empty());
}

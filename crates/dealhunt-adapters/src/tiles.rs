//! CSS-selector driven extraction of product tiles from category pages.

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dealhunt_core::{volume_text, ScrapedRecord};
use dealhunt_storage::{FetchError, HttpFetcher, PageArchive};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{AdapterError, PagePacing, Retailer, ScrapeOutcome, Scraper};

static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d[\d\s\u{a0}\u{202f}.,]*").expect("price regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSelectors {
    pub tile: String,
    pub name: String,
    pub brand: String,
    pub link: String,
    pub price: String,
    #[serde(default)]
    pub original_price: Option<String>,
    #[serde(default)]
    pub discount: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub volume: Option<String>,
    /// Attribute on the tile element holding the retailer's product code.
    #[serde(default)]
    pub code_attr: Option<String>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub review_count: Option<String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
}

fn default_page_param() -> String {
    "page".to_string()
}

impl TileSelectors {
    pub fn for_retailer(retailer: Retailer) -> Self {
        match retailer {
            Retailer::Sephora => Self {
                tile: ".product-tile".into(),
                name: ".product-title".into(),
                brand: ".product-brand".into(),
                link: "a.product-tile-link".into(),
                price: ".price-sales".into(),
                original_price: Some(".price-standard".into()),
                discount: Some(".product-badge--promo".into()),
                image: Some("img.product-first-img".into()),
                volume: Some(".product-size".into()),
                code_attr: Some("data-itemid".into()),
                rating: Some(".bv-rating".into()),
                review_count: Some(".bv-rating-count".into()),
                page_param: "start".into(),
            },
            Retailer::Nocibe => Self {
                tile: ".product-item".into(),
                name: ".product-item__name".into(),
                brand: ".product-item__brand".into(),
                link: "a.product-item__link".into(),
                price: ".product-item__price--current".into(),
                original_price: Some(".product-item__price--old".into()),
                discount: Some(".product-item__discount".into()),
                image: Some(".product-item__image img".into()),
                volume: Some(".product-item__size".into()),
                code_attr: Some("data-sku".into()),
                rating: None,
                review_count: None,
                page_param: default_page_param(),
            },
            Retailer::Marionnaud => Self {
                tile: ".product-list-item".into(),
                name: ".product-list-item__name".into(),
                brand: ".product-list-item__brand".into(),
                link: "a.product-list-item__link".into(),
                price: ".price__current".into(),
                original_price: Some(".price__old".into()),
                discount: Some(".price__discount".into()),
                image: Some(".product-list-item__image img".into()),
                volume: None,
                code_attr: Some("data-product-code".into()),
                rating: Some(".rating__value".into()),
                review_count: Some(".rating__count".into()),
                page_param: default_page_param(),
            },
        }
    }
}

/// A tile that could not be turned into a record.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TileError {
    #[error("tile {index}: missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("tile {index}: unreadable price {text:?}")]
    BadPrice { index: usize, text: String },
    #[error("tile {index}: bad product link {href:?}")]
    BadLink { index: usize, href: String },
}

/// Reads a shelf price such as `12,99 €`, `€12.99` or `1 234,50`.
pub fn parse_price(text: &str) -> Option<f64> {
    let raw = PRICE_RE.find(text)?.as_str();
    let compact: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let compact = compact.trim_end_matches(['.', ',']);
    let last_comma = compact.rfind(',');
    let last_dot = compact.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(_), None) if compact.matches(',').count() == 1 => compact.replace(',', "."),
        (Some(_), None) => compact.replace(',', ""),
        (None, Some(_)) if compact.matches('.').count() > 1 => compact.replace('.', ""),
        _ => compact.to_string(),
    };
    let value: f64 = normalized.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Whole-percent discount implied by a price pair; zero when there is none.
pub fn discount_from_prices(current: f64, original: f64) -> f64 {
    if original <= 0.0 || current >= original {
        return 0.0;
    }
    ((original - current) / original * 100.0).round()
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css:?}: {e}")))
}

fn optional_selector(css: Option<&String>) -> Result<Option<Selector>, AdapterError> {
    css.map(|c| selector(c)).transpose()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(tile: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    tile.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

struct CompiledSelectors {
    tile: Selector,
    name: Selector,
    brand: Selector,
    link: Selector,
    price: Selector,
    original_price: Option<Selector>,
    discount: Option<Selector>,
    image: Option<Selector>,
    volume: Option<Selector>,
    rating: Option<Selector>,
    review_count: Option<Selector>,
}

impl CompiledSelectors {
    fn compile(s: &TileSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            tile: selector(&s.tile)?,
            name: selector(&s.name)?,
            brand: selector(&s.brand)?,
            link: selector(&s.link)?,
            price: selector(&s.price)?,
            original_price: optional_selector(s.original_price.as_ref())?,
            discount: optional_selector(s.discount.as_ref())?,
            image: optional_selector(s.image.as_ref())?,
            volume: optional_selector(s.volume.as_ref())?,
            rating: optional_selector(s.rating.as_ref())?,
            review_count: optional_selector(s.review_count.as_ref())?,
        })
    }
}

/// Parses every tile on a listing page. Only an invalid selector fails the
/// page; each tile carries its own result.
pub fn parse_listing_page(
    html: &str,
    page_url: &str,
    category: &str,
    selectors: &TileSelectors,
) -> Result<Vec<Result<ScrapedRecord, TileError>>, AdapterError> {
    let compiled = CompiledSelectors::compile(selectors)?;
    let base = Url::parse(page_url)
        .map_err(|e| AdapterError::Message(format!("page url {page_url:?}: {e}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&compiled.tile)
        .enumerate()
        .map(|(index, tile)| parse_tile(index, &tile, &base, category, selectors, &compiled))
        .collect())
}

fn parse_tile(
    index: usize,
    tile: &ElementRef<'_>,
    base: &Url,
    category: &str,
    selectors: &TileSelectors,
    sel: &CompiledSelectors,
) -> Result<ScrapedRecord, TileError> {
    let name = first_text(tile, &sel.name).ok_or(TileError::MissingField {
        index,
        field: "name",
    })?;
    let brand = first_text(tile, &sel.brand).unwrap_or_default();

    let href = tile
        .select(&sel.link)
        .next()
        .and_then(|n| n.value().attr("href"))
        .ok_or(TileError::MissingField {
            index,
            field: "link",
        })?;
    let product_url = base
        .join(href)
        .map_err(|_| TileError::BadLink {
            index,
            href: href.to_string(),
        })?
        .to_string();

    let price_text = first_text(tile, &sel.price).ok_or(TileError::MissingField {
        index,
        field: "price",
    })?;
    let current_price = parse_price(&price_text).ok_or_else(|| TileError::BadPrice {
        index,
        text: price_text.clone(),
    })?;
    let original_price = sel
        .original_price
        .as_ref()
        .and_then(|s| first_text(tile, s))
        .and_then(|t| parse_price(&t))
        .filter(|p| *p >= current_price)
        .unwrap_or(current_price);
    let discount_percent = sel
        .discount
        .as_ref()
        .and_then(|s| first_text(tile, s))
        .and_then(|t| parse_price(&t))
        .map(f64::abs)
        .filter(|d| *d <= 100.0)
        .unwrap_or_else(|| discount_from_prices(current_price, original_price));

    let image_url = sel.image.as_ref().and_then(|s| {
        tile.select(s).next().and_then(|img| {
            img.value()
                .attr("data-src")
                .or_else(|| img.value().attr("src"))
                .and_then(|src| base.join(src).ok())
                .map(|u| u.to_string())
        })
    });

    let volume = sel
        .volume
        .as_ref()
        .and_then(|s| first_text(tile, s))
        .or_else(|| volume_text(&name).map(ToString::to_string))
        .unwrap_or_default();

    Ok(ScrapedRecord {
        name,
        brand,
        product_url,
        external_code: selectors
            .code_attr
            .as_deref()
            .and_then(|attr| tile.value().attr(attr))
            .map(ToString::to_string),
        current_price,
        original_price,
        discount_percent,
        image_url,
        volume,
        category: category.to_string(),
        rating: sel
            .rating
            .as_ref()
            .and_then(|s| first_text(tile, s))
            .and_then(|t| parse_price(&t)),
        review_count: sel
            .review_count
            .as_ref()
            .and_then(|s| first_text(tile, s))
            .and_then(|t| parse_price(&t))
            .map(|n| n as u32),
    })
}

/// URL of page `page` (1-based) of a category listing.
pub fn page_url(category_url: &str, page_param: &str, page: usize) -> Result<String, AdapterError> {
    let mut url = Url::parse(category_url)
        .map_err(|e| AdapterError::Message(format!("category url {category_url:?}: {e}")))?;
    if page <= 1 {
        return Ok(url.to_string());
    }
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != page_param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(page_param, &page.to_string());
    Ok(url.to_string())
}

/// Live scraper walking a category page by page.
pub struct HtmlTileScraper {
    pub(crate) retailer: Retailer,
    pub(crate) http: Arc<HttpFetcher>,
    pub(crate) archive: Option<PageArchive>,
    pub(crate) run_id: Uuid,
    pub(crate) selectors: TileSelectors,
    pub(crate) pacing: PagePacing,
}

#[async_trait]
impl Scraper for HtmlTileScraper {
    fn retailer(&self) -> Retailer {
        self.retailer
    }

    async fn scrape(&self, category_url: &str, max_records: usize) -> ScrapeOutcome {
        let started = Instant::now();
        let host_key = self.retailer.as_str();
        let mut records = Vec::new();
        let mut errors = Vec::new();

        for page in 1..=self.pacing.max_pages.max(1) {
            if records.len() >= max_records {
                break;
            }
            if page > 1 {
                tokio::time::sleep(self.pacing.delay).await;
            }
            let url = match page_url(category_url, &self.selectors.page_param, page) {
                Ok(url) => url,
                Err(err) => {
                    errors.push(err.to_string());
                    break;
                }
            };

            let response = match self
                .http
                .fetch_with_deadline(self.run_id, host_key, &url, self.pacing.page_timeout)
                .await
            {
                Ok(response) => response,
                Err(err @ FetchError::Timeout { .. }) => {
                    warn!(retailer = host_key, page, url = %url, "page fetch timed out");
                    errors.push(err.to_string());
                    continue;
                }
                Err(err) => {
                    warn!(retailer = host_key, page, url = %url, error = %err, "page fetch failed");
                    errors.push(err.to_string());
                    break;
                }
            };

            if let Some(archive) = &self.archive {
                if let Err(err) = archive
                    .archive(Utc::now(), host_key, "html", &response.body)
                    .await
                {
                    warn!(retailer = host_key, error = %err, "failed to archive listing page");
                }
            }

            let tiles = match parse_listing_page(
                &response.text(),
                &response.final_url,
                category_url,
                &self.selectors,
            ) {
                Ok(tiles) => tiles,
                Err(err) => {
                    errors.push(err.to_string());
                    break;
                }
            };
            if tiles.is_empty() {
                debug!(retailer = host_key, page, "no tiles; end of listing");
                break;
            }
            for tile in tiles {
                match tile {
                    Ok(record) => records.push(record),
                    Err(err) => errors.push(format!("page {page}: {err}")),
                }
            }
        }

        records.truncate(max_records);
        info!(
            retailer = host_key,
            category_url,
            records = records.len(),
            errors = errors.len(),
            "category scraped"
        );
        ScrapeOutcome {
            success: !records.is_empty() || errors.is_empty(),
            records,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <ul>
          <li class="product-item" data-sku="NC-1">
            <a class="product-item__link" href="/fr/p/libre-eau-de-parfum-123456">
              <span class="product-item__brand">Yves Saint Laurent</span>
              <span class="product-item__name">Libre Eau de Parfum</span>
            </a>
            <span class="product-item__size">50 ml</span>
            <span class="product-item__price--current">89,99 €</span>
            <span class="product-item__price--old">119,00 €</span>
            <div class="product-item__image"><img data-src="/img/libre.jpg"></div>
          </li>
          <li class="product-item">
            <a class="product-item__link" href="/fr/p/sans-prix-1">
              <span class="product-item__name">Sans prix</span>
            </a>
          </li>
          <li class="product-item">
            <a class="product-item__link" href="/fr/p/creme-nuit-9">
              <span class="product-item__brand">nuxe</span>
              <span class="product-item__name">Crème de nuit 50ml</span>
            </a>
            <span class="product-item__price--current">24,90 €</span>
            <span class="product-item__discount">-20%</span>
          </li>
        </ul>"#;

    #[test]
    fn shelf_prices_parse_in_both_notations() {
        assert_eq!(parse_price("12,99 €"), Some(12.99));
        assert_eq!(parse_price("€12.99"), Some(12.99));
        assert_eq!(parse_price("1 234,50 €"), Some(1234.5));
        assert_eq!(parse_price("1.234,50"), Some(1234.5));
        assert_eq!(parse_price("1,234.50"), Some(1234.5));
        assert_eq!(parse_price("Prix : 45 €"), Some(45.0));
        assert_eq!(parse_price("gratuit"), None);
    }

    #[test]
    fn discount_is_derived_from_price_pair() {
        assert_eq!(discount_from_prices(75.0, 100.0), 25.0);
        assert_eq!(discount_from_prices(100.0, 100.0), 0.0);
        assert_eq!(discount_from_prices(10.0, 0.0), 0.0);
    }

    #[test]
    fn each_tile_yields_its_own_result() {
        let selectors = TileSelectors::for_retailer(Retailer::Nocibe);
        let tiles = parse_listing_page(
            LISTING,
            "https://www.nocibe.fr/parfum-femme/c/100",
            "parfum-femme",
            &selectors,
        )
        .unwrap();
        assert_eq!(tiles.len(), 3);

        let first = tiles[0].as_ref().unwrap();
        assert_eq!(first.brand, "Yves Saint Laurent");
        assert_eq!(
            first.product_url,
            "https://www.nocibe.fr/fr/p/libre-eau-de-parfum-123456"
        );
        assert_eq!(first.external_code.as_deref(), Some("NC-1"));
        assert_eq!(first.current_price, 89.99);
        assert_eq!(first.original_price, 119.0);
        assert_eq!(first.discount_percent, 24.0);
        assert_eq!(first.volume, "50 ml");
        assert_eq!(
            first.image_url.as_deref(),
            Some("https://www.nocibe.fr/img/libre.jpg")
        );

        assert_eq!(
            tiles[1],
            Err(TileError::MissingField {
                index: 1,
                field: "price"
            })
        );

        let third = tiles[2].as_ref().unwrap();
        assert_eq!(third.volume, "50ml");
        assert_eq!(third.discount_percent, 20.0);
        assert_eq!(third.original_price, third.current_price);
    }

    #[test]
    fn invalid_selector_fails_the_page() {
        let mut selectors = TileSelectors::for_retailer(Retailer::Nocibe);
        selectors.tile = "li[".into();
        assert!(parse_listing_page(LISTING, "https://www.nocibe.fr/", "", &selectors).is_err());
    }

    #[test]
    fn page_urls_replace_the_page_parameter() {
        let base = "https://www.nocibe.fr/parfum/c/100?sort=promo&page=3";
        assert_eq!(
            page_url(base, "page", 1).unwrap(),
            "https://www.nocibe.fr/parfum/c/100?sort=promo&page=3"
        );
        assert_eq!(
            page_url(base, "page", 2).unwrap(),
            "https://www.nocibe.fr/parfum/c/100?sort=promo&page=2"
        );
    }
}

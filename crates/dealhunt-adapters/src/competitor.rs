//! Cross-retailer lookup of the same product and pack size.

use std::sync::{Arc, LazyLock};

use dealhunt_core::{parse_volume, Volume};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::search::{PageSource, SiteSearch};
use crate::variants::{extract_variants, page_price, select_variant, VariantSelectors};

const MAX_QUERY_WORDS: usize = 8;
const SEARCH_RESULTS: usize = 5;
/// Price gaps inside this band (currency units) count as equal.
pub const EQUAL_PRICE_BAND: f64 = 0.5;

static DISCOUNT_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*-?\s*\d{1,3}(?:[.,]\d+)?\s*%\s*(?:off\b|de réduction\b)?\s*[:|-]?\s*")
        .expect("discount prefix regex is valid")
});

static PAREN_VOLUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\(\s*[^()]*?\d+(?:[.,]\d+)?\s*(?:fl\.?\s*oz|kg|ml|cl|grammes?|gr|g|l|oz)\b[^()]*\)")
        .expect("parenthesized volume regex is valid")
});

static LISTING_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(/c/|/shop/|/search|/recherche|/marques?/|/brands?/|/categor)")
        .expect("listing path regex is valid")
});

static SEPHORA_PRODUCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/p/[\w-]+-P\d+\.html$").expect("sephora regex is valid"));
static NOCIBE_PRODUCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:/fr)?/p/[\w-]+-\d+$").expect("nocibe regex is valid"));
static MARIONNAUD_PRODUCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[\w/-]+/p/BP_\d+$").expect("marionnaud regex is valid"));

/// How a site's product page must be retrieved to expose its size variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    Static,
    /// Sizes are disclosed by script; needs a headless browser.
    Rendered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitorSite {
    Sephora,
    Nocibe,
    Marionnaud,
    Generic,
}

impl CompetitorSite {
    pub const RETAILERS: [CompetitorSite; 3] = [
        CompetitorSite::Sephora,
        CompetitorSite::Nocibe,
        CompetitorSite::Marionnaud,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sephora => "sephora",
            Self::Nocibe => "nocibe",
            Self::Marionnaud => "marionnaud",
            Self::Generic => "generic",
        }
    }

    pub fn merchant_id(self) -> &'static str {
        self.as_str()
    }

    pub fn domain(self) -> Option<&'static str> {
        match self {
            Self::Sephora => Some("sephora.fr"),
            Self::Nocibe => Some("nocibe.fr"),
            Self::Marionnaud => Some("marionnaud.fr"),
            Self::Generic => None,
        }
    }

    pub fn render_mode(self) -> RenderMode {
        match self {
            Self::Sephora => RenderMode::Rendered,
            Self::Nocibe | Self::Marionnaud | Self::Generic => RenderMode::Static,
        }
    }

    pub fn variant_selectors(self) -> Option<VariantSelectors> {
        match self {
            Self::Sephora => Some(VariantSelectors {
                item: ".variation-selector li.variation",
                volume: ".variation-name",
                price: ".variation-price",
                original_price: Some(".variation-price-old"),
            }),
            Self::Nocibe => Some(VariantSelectors {
                item: ".prdct-variants .prdct-variant",
                volume: ".prdct-variant__size",
                price: ".prdct-variant__price",
                original_price: Some(".prdct-variant__price--old"),
            }),
            Self::Marionnaud => Some(VariantSelectors {
                item: ".product-variants__item",
                volume: ".product-variants__size",
                price: ".product-variants__price",
                original_price: Some(".product-variants__price--crossed"),
            }),
            Self::Generic => None,
        }
    }

    /// True for an individual product page on this site; listing, search and
    /// brand pages are rejected.
    pub fn is_product_url(self, candidate: &str) -> bool {
        let Ok(url) = Url::parse(candidate) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        if let Some(domain) = self.domain() {
            if host != domain && !host.ends_with(&format!(".{domain}")) {
                return false;
            }
        }
        let path = url.path();
        if LISTING_PATH_RE.is_match(path) {
            return false;
        }
        match self {
            Self::Sephora => SEPHORA_PRODUCT_RE.is_match(path),
            Self::Nocibe => NOCIBE_PRODUCT_RE.is_match(path),
            Self::Marionnaud => MARIONNAUD_PRODUCT_RE.is_match(path),
            Self::Generic => path.trim_matches('/').len() > 1 && url.query().is_none(),
        }
    }
}

fn normalize_punctuation(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
            '\u{2018}' | '\u{2019}' | '\u{201b}' | '\u{02bc}' | '`' | '\u{b4}' => '\'',
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{ab}' | '\u{bb}' => '"',
            other => other,
        })
        .collect()
}

fn collapse_repeated_brand(text: &str, brand: &str) -> String {
    let escaped = regex::escape(brand.trim());
    let Ok(re) = Regex::new(&format!(r"(?i)\b({escaped})(?:\s*-\s*|\s+){escaped}\b")) else {
        return text.to_string();
    };
    let mut current = text.to_string();
    loop {
        let next = re.replace_all(&current, "$1").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Turns a deal title into a competitor search query.
pub fn clean_query(title: &str, brand: Option<&str>) -> String {
    let mut text = normalize_punctuation(title);
    loop {
        let stripped = DISCOUNT_PREFIX_RE.replace(&text, "").into_owned();
        if stripped == text {
            break;
        }
        text = stripped;
    }
    text = PAREN_VOLUME_RE.replace_all(&text, " ").into_owned();

    let brand = brand.map(str::trim).filter(|b| !b.is_empty());
    if let Some(brand) = brand {
        text = collapse_repeated_brand(&text, brand);
    }

    let words: Vec<&str> = text
        .split_whitespace()
        .filter(|w| !w.chars().all(|c| c == '-' || c == '|'))
        .take(MAX_QUERY_WORDS)
        .collect();
    let mut query = words.join(" ");

    if let Some(brand) = brand {
        if !query.to_lowercase().contains(&brand.to_lowercase()) {
            query = if query.is_empty() {
                brand.to_string()
            } else {
                format!("{brand} {query}")
            };
        }
    }
    query
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cheaper {
    Ours,
    Theirs,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceComparison {
    /// `theirs - ours`; positive when our deal is cheaper.
    pub difference: f64,
    pub percent_difference: f64,
    pub cheaper: Cheaper,
}

pub fn compare_prices(ours: f64, theirs: f64) -> PriceComparison {
    let difference = theirs - ours;
    let percent_difference = if ours > 0.0 {
        difference / ours * 100.0
    } else {
        0.0
    };
    let cheaper = if difference.abs() <= EQUAL_PRICE_BAND {
        Cheaper::Equal
    } else if difference > 0.0 {
        Cheaper::Ours
    } else {
        Cheaper::Theirs
    };
    PriceComparison {
        difference,
        percent_difference,
        cheaper,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSearchResult {
    pub site: CompetitorSite,
    pub found: bool,
    pub current_price: Option<f64>,
    pub original_price: Option<f64>,
    pub volume: Option<String>,
    pub in_stock: Option<bool>,
    pub error: Option<String>,
    pub url: Option<String>,
}

impl SiteSearchResult {
    fn not_found(site: CompetitorSite, url: Option<String>) -> Self {
        Self {
            site,
            found: false,
            current_price: None,
            original_price: None,
            volume: None,
            in_stock: None,
            error: None,
            url,
        }
    }

    fn failed(site: CompetitorSite, url: Option<String>, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::not_found(site, url)
        }
    }
}

/// Finds a deal's exact pack size on other retailers.
#[derive(Clone)]
pub struct CompetitorMatcher {
    search: Arc<dyn SiteSearch>,
    pages: Arc<dyn PageSource>,
    /// Domain searched for [`CompetitorSite::Generic`].
    generic_domain: Option<String>,
}

impl CompetitorMatcher {
    pub fn new(search: Arc<dyn SiteSearch>, pages: Arc<dyn PageSource>) -> Self {
        Self {
            search,
            pages,
            generic_domain: None,
        }
    }

    pub fn with_generic_domain(mut self, domain: impl Into<String>) -> Self {
        self.generic_domain = Some(domain.into());
        self
    }

    async fn candidate_url(&self, query: &str, site: CompetitorSite) -> Result<Option<String>, String> {
        let Some(domain) = site.domain().or(self.generic_domain.as_deref()) else {
            return Err("no domain configured for generic site".to_string());
        };
        let urls = self
            .search
            .search(query, domain, SEARCH_RESULTS)
            .await
            .map_err(|e| e.to_string())?;
        Ok(urls.into_iter().find(|u| site.is_product_url(u)))
    }

    /// `query` is the already-cleaned search text.
    pub async fn search_on_site(
        &self,
        query: &str,
        site: CompetitorSite,
        target_volume: &Volume,
    ) -> SiteSearchResult {
        let url = match self.candidate_url(query, site).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                debug!(site = site.as_str(), query, "no product page in search results");
                return SiteSearchResult::not_found(site, None);
            }
            Err(err) => {
                warn!(site = site.as_str(), query, error = %err, "competitor search failed");
                return SiteSearchResult::failed(site, None, err);
            }
        };

        let html = match self.pages.page_html(&url, site.render_mode()).await {
            Ok(html) => html,
            Err(err) => {
                warn!(site = site.as_str(), url = %url, error = %err, "competitor page fetch failed");
                return SiteSearchResult::failed(site, Some(url), err);
            }
        };

        match site.variant_selectors() {
            Some(selectors) => Self::match_variant(site, url, &html, &selectors, target_volume),
            None => Self::match_page_price(site, url, &html),
        }
    }

    fn match_variant(
        site: CompetitorSite,
        url: String,
        html: &str,
        selectors: &VariantSelectors,
        target_volume: &Volume,
    ) -> SiteSearchResult {
        let variants = extract_variants(html, Some(selectors));
        let Some(variant) = select_variant(&variants, target_volume) else {
            debug!(
                site = site.as_str(),
                url = %url,
                target = %target_volume,
                offered = variants.len(),
                "no variant with the exact pack size"
            );
            return SiteSearchResult::not_found(site, Some(url));
        };
        info!(site = site.as_str(), url = %url, price = variant.price, "competitor variant matched");
        SiteSearchResult {
            site,
            found: true,
            current_price: Some(variant.price),
            original_price: variant.original_price,
            volume: Some(variant.volume.to_string()),
            in_stock: Some(variant.in_stock),
            error: None,
            url: Some(url),
        }
    }

    fn match_page_price(site: CompetitorSite, url: String, html: &str) -> SiteSearchResult {
        let Some(page) = page_price(html) else {
            return SiteSearchResult::not_found(site, Some(url));
        };
        SiteSearchResult {
            site,
            found: true,
            current_price: Some(page.price),
            original_price: page.original_price,
            volume: page
                .volume_text
                .as_deref()
                .and_then(parse_volume)
                .map(|v| v.to_string()),
            in_stock: Some(page.in_stock),
            error: None,
            url: Some(url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchError;
    use async_trait::async_trait;
    use dealhunt_core::VolumeUnit;

    struct FixedSearch(Vec<&'static str>);

    #[async_trait]
    impl SiteSearch for FixedSearch {
        async fn search(
            &self,
            _query: &str,
            _domain: &str,
            _max_results: usize,
        ) -> Result<Vec<String>, SearchError> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    struct FixedPage(&'static str);

    #[async_trait]
    impl PageSource for FixedPage {
        async fn page_html(&self, _url: &str, _mode: RenderMode) -> Result<String, SearchError> {
            Ok(self.0.to_string())
        }
    }

    const NOCIBE_PAGE: &str = r#"<div class="prdct-variants">
        <div class="prdct-variant"><span class="prdct-variant__size">50 ml</span><span class="prdct-variant__price">89,00 €</span></div>
        <div class="prdct-variant"><span class="prdct-variant__size">100 ml</span><span class="prdct-variant__price">119,00 €</span></div>
    </div>"#;

    fn ml(value: f64) -> Volume {
        Volume {
            value,
            unit: VolumeUnit::Ml,
        }
    }

    fn matcher(page: &'static str) -> CompetitorMatcher {
        CompetitorMatcher::new(
            Arc::new(FixedSearch(vec![
                "https://www.nocibe.fr/fr/c/parfum-femme/100",
                "https://www.nocibe.fr/fr/p/yves-saint-laurent-libre-eau-de-parfum-123456",
            ])),
            Arc::new(FixedPage(page)),
        )
    }

    #[tokio::test]
    async fn exact_pack_size_wins_over_cheaper_unit_price() {
        let result = matcher(NOCIBE_PAGE)
            .search_on_site("Yves Saint Laurent Libre", CompetitorSite::Nocibe, &ml(50.0))
            .await;
        assert!(result.found);
        assert_eq!(result.current_price, Some(89.0));
        assert_eq!(result.volume.as_deref(), Some("50 ml"));
        assert_eq!(
            result.url.as_deref(),
            Some("https://www.nocibe.fr/fr/p/yves-saint-laurent-libre-eau-de-parfum-123456")
        );
    }

    #[tokio::test]
    async fn missing_pack_size_is_not_found() {
        let result = matcher(NOCIBE_PAGE)
            .search_on_site("Yves Saint Laurent Libre", CompetitorSite::Nocibe, &ml(75.0))
            .await;
        assert!(!result.found);
        assert!(result.current_price.is_none());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn listing_only_results_are_not_found() {
        let matcher = CompetitorMatcher::new(
            Arc::new(FixedSearch(vec!["https://www.sephora.fr/shop/parfum/"])),
            Arc::new(FixedPage(NOCIBE_PAGE)),
        );
        let result = matcher
            .search_on_site("Dior Sauvage", CompetitorSite::Sephora, &ml(100.0))
            .await;
        assert!(!result.found);
        assert!(result.url.is_none());
    }

    #[test]
    fn product_url_rules_reject_listings_and_foreign_hosts() {
        assert!(CompetitorSite::Sephora.is_product_url(
            "https://www.sephora.fr/p/libre---eau-de-parfum-P3362010.html"
        ));
        assert!(!CompetitorSite::Sephora.is_product_url("https://www.sephora.fr/shop/parfum-c301/"));
        assert!(!CompetitorSite::Sephora.is_product_url(
            "https://www.nocibe.fr/p/libre---eau-de-parfum-P3362010.html"
        ));
        assert!(CompetitorSite::Marionnaud.is_product_url(
            "https://www.marionnaud.fr/parfum/parfum-femme/libre/p/BP_100234"
        ));
        assert!(!CompetitorSite::Nocibe.is_product_url("https://www.nocibe.fr/fr/c/parfum/100"));
        assert!(!CompetitorSite::Generic.is_product_url("https://shop.example/search?q=libre"));
    }

    #[test]
    fn query_cleaning_strips_noise_and_prepends_brand() {
        assert_eq!(
            clean_query("-30% Dior Dior - Sauvage Eau de Parfum (100 ml)", Some("Dior")),
            "Dior Sauvage Eau de Parfum"
        );
        assert_eq!(
            clean_query("Libre \u{2013} Eau de Parfum \u{2019}Intense\u{2019} (50ml)", Some("Yves Saint Laurent")),
            "Yves Saint Laurent Libre Eau de Parfum 'Intense'"
        );
        assert_eq!(
            clean_query("un deux trois quatre cinq six sept huit neuf dix", None),
            "un deux trois quatre cinq six sept huit"
        );
    }

    #[test]
    fn comparison_treats_half_unit_gap_as_equal() {
        assert_eq!(compare_prices(50.0, 50.4).cheaper, Cheaper::Equal);
        assert_eq!(compare_prices(50.0, 49.5).cheaper, Cheaper::Equal);
        let ours_cheaper = compare_prices(40.0, 50.0);
        assert_eq!(ours_cheaper.cheaper, Cheaper::Ours);
        assert_eq!(ours_cheaper.difference, 10.0);
        assert_eq!(ours_cheaper.percent_difference, 25.0);
        assert_eq!(compare_prices(50.0, 40.0).cheaper, Cheaper::Theirs);
    }
}

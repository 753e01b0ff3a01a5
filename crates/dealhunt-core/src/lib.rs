//! Core catalog domain model for dealhunt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod volume;

pub use volume::{parse_volume, price_per_unit, volume_text, UnitPrice, Volume, VolumeUnit};

pub const CRATE_NAME: &str = "dealhunt-core";

/// Raw listing handed from a retailer scraper into the ingestion pipeline.
///
/// Carries no identity beyond `product_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub name: String,
    #[serde(default)]
    pub brand: String,
    pub product_url: String,
    #[serde(default)]
    pub external_code: Option<String>,
    pub current_price: f64,
    pub original_price: f64,
    pub discount_percent: f64,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
}

/// Prestige classification assigned by the classifier. Rank 1 is luxury.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BrandTier {
    Luxury,
    Premium,
    Mass,
}

impl BrandTier {
    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Self::Luxury),
            2 => Some(Self::Premium),
            3 => Some(Self::Mass),
            _ => None,
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Self::Luxury => 1,
            Self::Premium => 2,
            Self::Mass => 3,
        }
    }
}

impl From<BrandTier> for u8 {
    fn from(tier: BrandTier) -> Self {
        tier.rank()
    }
}

impl TryFrom<u8> for BrandTier {
    type Error = String;

    fn try_from(rank: u8) -> Result<Self, Self::Error> {
        Self::from_rank(rank).ok_or_else(|| format!("brand tier must be 1, 2 or 3 (got {rank})"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    /// Lowercased, whitespace-collapsed `name`; the fallback match key.
    pub normalized_name: String,
    pub slug: String,
    pub brand_id: Option<Uuid>,
    pub category_slug: Option<String>,
    pub subcategory_slug: Option<String>,
    pub subsubcategory_slug: Option<String>,
    pub merchant_id: String,
    pub product_url: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pack size of a product, keyed by `(product_id, volume_value, volume_unit)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub product_id: Uuid,
    pub volume_value: f64,
    pub volume_unit: VolumeUnit,
    pub raw_volume: String,
    pub external_code: Option<String>,
}

impl Variant {
    pub fn volume(&self) -> Volume {
        Volume {
            value: self.volume_value,
            unit: self.volume_unit,
        }
    }
}

/// Current commercial offer for a product variant at one merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Uuid,
    pub merchant_id: String,
    pub title: String,
    pub refined_title: Option<String>,
    pub deal_price: f64,
    pub original_price: f64,
    pub discount_percent: f64,
    pub discount_amount: f64,
    pub score: u8,
    /// Comma-separated tag labels, at most two.
    pub tags: String,
    pub brand_tier: Option<BrandTier>,
    pub is_hot: bool,
    pub is_trending: bool,
    pub is_expired: bool,
    pub votes: i32,
    pub views: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn tag_list(&self) -> Vec<String> {
        split_tags(&self.tags)
    }
}

/// Commercial fields overwritten on an existing deal when a listing is re-scraped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealUpdate {
    pub variant_id: Uuid,
    pub title: String,
    pub deal_price: f64,
    pub original_price: f64,
    pub discount_percent: f64,
    pub discount_amount: f64,
    pub score: u8,
    pub tags: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub id: Uuid,
    pub product_id: Uuid,
    pub price: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Price observed for the same product variant at another merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorPrice {
    pub deal_id: Uuid,
    pub merchant_id: String,
    pub price: f64,
    pub original_price: Option<f64>,
    pub product_url: String,
    pub volume: Option<String>,
    pub in_stock: bool,
    pub last_checked: DateTime<Utc>,
}

/// Everything written atomically when a never-seen listing enters the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCatalogEntry {
    pub product: Product,
    pub variant: Variant,
    pub deal: Deal,
    pub initial_price: PriceHistoryEntry,
}

/// Per-factor sub-scores, each on a 0-100 scale before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub discount: f64,
    pub brand: f64,
    pub value: f64,
    pub trend: f64,
    pub community_bonus: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub score: u8,
    pub tags: Vec<String>,
    pub breakdown: ScoreBreakdown,
}

impl ScoreResult {
    pub fn tag_string(&self) -> String {
        self.tags.join(",")
    }
}

pub fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Match key used for name-based product lookups.
pub fn normalize_product_name(name: &str) -> String {
    name.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brand_tier_round_trips_through_rank() {
        for rank in 1..=3u8 {
            assert_eq!(BrandTier::from_rank(rank).map(BrandTier::rank), Some(rank));
        }
        assert!(BrandTier::from_rank(0).is_none());
        assert!(BrandTier::from_rank(4).is_none());
    }

    #[test]
    fn brand_tier_deserializes_from_integer() {
        let tier: BrandTier = serde_json::from_str("1").unwrap();
        assert_eq!(tier, BrandTier::Luxury);
        assert!(serde_json::from_str::<BrandTier>("7").is_err());
    }

    #[test]
    fn product_names_normalize_case_and_spacing() {
        assert_eq!(
            normalize_product_name("  Eau  de Parfum\tLIBRE "),
            "eau de parfum libre"
        );
    }

    #[test]
    fn tag_strings_split_and_skip_blanks() {
        assert_eq!(split_tags("top deal, luxury,"), vec!["top deal", "luxury"]);
        assert!(split_tags("").is_empty());
    }
}

//! Deal ranking: a weighted 0-100 score plus at most two display tags.

use std::sync::LazyLock;

use dealhunt_core::{BrandTier, ScoreBreakdown, ScoreResult};
use regex::Regex;

pub const DISCOUNT_WEIGHT: f64 = 0.40;
pub const BRAND_WEIGHT: f64 = 0.25;
pub const VALUE_WEIGHT: f64 = 0.20;
pub const TREND_WEIGHT: f64 = 0.15;

/// Discount at which the discount sub-score saturates.
const DISCOUNT_SATURATION: f64 = 40.0;
const COMMUNITY_BONUS_VOTES: i32 = 20;
const COMMUNITY_VALIDATED_VOTES: i32 = 50;
const MAX_TAGS: usize = 2;

pub const TAG_EXCEPTIONAL: &str = "exceptional deal";
pub const TAG_TOP: &str = "top deal";
pub const TAG_LUXURY: &str = "luxury";
pub const TAG_FLASH: &str = "flash promo";
pub const TAG_TRENDING: &str = "trending";
pub const TAG_UNBEATABLE: &str = "unbeatable price";
pub const TAG_GIFT: &str = "gift idea";
pub const TAG_COMMUNITY: &str = "community validated";

/// Reference price per ml (or g), keyed by category or subcategory slug.
const CATEGORY_AVERAGE_PPU: &[(&str, f64)] = &[
    ("parfum-femme", 1.30),
    ("parfum-homme", 1.10),
    ("parfum", 1.20),
    ("soin-visage", 0.80),
    ("soin-corps", 0.15),
    ("maquillage", 1.50),
    ("cheveux", 0.08),
    ("solaire", 0.20),
];
pub const DEFAULT_AVERAGE_PPU: f64 = 0.50;

static GIFT_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(coffret|gift\s*set|set\s+cadeau|kit|duo|trio|calendrier de l.avent)\b")
        .expect("gift marker regex is valid")
});

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreInput<'a> {
    pub discount_percent: f64,
    pub brand_tier: Option<BrandTier>,
    pub price_per_unit: Option<f64>,
    pub category_slug: Option<&'a str>,
    pub subcategory_slug: Option<&'a str>,
    pub name: &'a str,
    pub is_trending: bool,
    pub is_hot: bool,
    pub votes: i32,
}

/// Subcategory first, then category, then the global default.
pub fn category_average_price_per_unit(category: Option<&str>, subcategory: Option<&str>) -> f64 {
    [subcategory, category]
        .into_iter()
        .flatten()
        .find_map(|slug| {
            CATEGORY_AVERAGE_PPU
                .iter()
                .find(|(key, _)| *key == slug)
                .map(|(_, avg)| *avg)
        })
        .unwrap_or(DEFAULT_AVERAGE_PPU)
}

fn discount_score(discount_percent: f64) -> f64 {
    if !discount_percent.is_finite() {
        return 0.0;
    }
    (discount_percent / DISCOUNT_SATURATION * 100.0).clamp(0.0, 100.0)
}

fn brand_score(tier: Option<BrandTier>) -> f64 {
    match tier {
        Some(BrandTier::Luxury) => 100.0,
        Some(BrandTier::Premium) => 60.0,
        Some(BrandTier::Mass) => 30.0,
        None => 50.0,
    }
}

fn value_score(price_per_unit: Option<f64>, average: f64) -> f64 {
    match price_per_unit {
        Some(ppu) if ppu.is_finite() && average > 0.0 => (100.0 - ppu / average * 50.0).clamp(0.0, 100.0),
        _ => 50.0,
    }
}

pub fn is_gift_set(name: &str, subcategory: Option<&str>) -> bool {
    GIFT_MARKER_RE.is_match(name)
        || subcategory.is_some_and(|s| GIFT_MARKER_RE.is_match(&s.replace('-', " ")))
}

fn derive_tags(score: u8, input: &ScoreInput<'_>, average: f64) -> Vec<String> {
    let mut tags: Vec<&str> = Vec::with_capacity(MAX_TAGS);

    if score >= 90 {
        tags.push(TAG_EXCEPTIONAL);
    } else if score >= 80 {
        tags.push(TAG_TOP);
    }

    let secondary = if input.brand_tier == Some(BrandTier::Luxury) {
        Some(TAG_LUXURY)
    } else if input.discount_percent >= 50.0 {
        Some(TAG_FLASH)
    } else if input.is_trending {
        Some(TAG_TRENDING)
    } else if input.price_per_unit.is_some_and(|ppu| ppu < average * 0.5) {
        Some(TAG_UNBEATABLE)
    } else {
        None
    };
    tags.extend(secondary);

    if tags.len() < MAX_TAGS && is_gift_set(input.name, input.subcategory_slug) {
        tags.push(TAG_GIFT);
    }
    if tags.len() < MAX_TAGS && input.votes >= COMMUNITY_VALIDATED_VOTES {
        tags.push(TAG_COMMUNITY);
    }

    tags.truncate(MAX_TAGS);
    tags.into_iter().map(ToString::to_string).collect()
}

pub fn score(input: &ScoreInput<'_>) -> ScoreResult {
    let average = category_average_price_per_unit(input.category_slug, input.subcategory_slug);
    let discount = discount_score(input.discount_percent);
    let brand = brand_score(input.brand_tier);
    let value = value_score(input.price_per_unit, average);
    let trend = if input.is_trending { 100.0 } else { 0.0 };
    let community_bonus = u8::from(input.is_hot || input.votes >= COMMUNITY_BONUS_VOTES);

    let weighted = discount * DISCOUNT_WEIGHT
        + brand * BRAND_WEIGHT
        + value * VALUE_WEIGHT
        + trend * TREND_WEIGHT;
    let total = (weighted.round() + f64::from(community_bonus)).clamp(0.0, 100.0) as u8;

    ScoreResult {
        score: total,
        tags: derive_tags(total, input, average),
        breakdown: ScoreBreakdown {
            discount,
            brand,
            value,
            trend,
            community_bonus,
        },
    }
}

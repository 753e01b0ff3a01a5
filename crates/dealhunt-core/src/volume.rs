//! Pack-size parsing and price-per-unit computation.
//!
//! Every recognised size is normalised to one of two base units, `ml` or `g`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const ML_PER_OZ: f64 = 29.57;
const VOLUME_EPSILON: f64 = 1e-6;

static VOLUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(fl\.?\s*oz|kg|ml|cl|grammes?|gr|g|l|oz)\b")
        .expect("volume regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeUnit {
    Ml,
    G,
}

impl VolumeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ml => "ml",
            Self::G => "g",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ml" => Some(Self::Ml),
            "g" => Some(Self::G),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalised quantity: always expressed in `ml` or `g`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub value: f64,
    pub unit: VolumeUnit,
}

impl Volume {
    /// Exact pack-size equality (same unit, same normalised value).
    pub fn same_size(&self, other: &Volume) -> bool {
        self.unit == other.unit && (self.value - other.value).abs() < VOLUME_EPSILON
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.fract().abs() < VOLUME_EPSILON {
            write!(f, "{} {}", self.value.round() as i64, self.unit)
        } else {
            write!(f, "{:.2} {}", self.value, self.unit)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitPrice {
    pub volume: Volume,
    pub price: f64,
    /// `price / volume.value`, unrounded.
    pub price_per_unit: f64,
}

impl UnitPrice {
    /// Price for 100 ml / 100 g, the usual shelf-label figure.
    pub fn per_hundred(&self) -> f64 {
        self.price_per_unit * 100.0
    }
}

/// Extracts the first `<number> <unit>` pair from free text and normalises it.
///
/// Returns `None` when no recognised unit follows a number.
pub fn parse_volume(text: &str) -> Option<Volume> {
    let caps = VOLUME_RE.captures(text)?;
    let raw_number = caps.get(1)?.as_str().replace(',', ".");
    let number: f64 = raw_number.parse().ok()?;
    let unit_token = caps
        .get(2)?
        .as_str()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<String>();

    let (multiplier, unit) = match unit_token.as_str() {
        "ml" => (1.0, VolumeUnit::Ml),
        "cl" => (10.0, VolumeUnit::Ml),
        "l" => (1000.0, VolumeUnit::Ml),
        "oz" | "floz" | "fl.oz" => (ML_PER_OZ, VolumeUnit::Ml),
        "g" | "gr" | "gramme" | "grammes" => (1.0, VolumeUnit::G),
        "kg" => (1000.0, VolumeUnit::G),
        _ => return None,
    };

    let value = number * multiplier;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Some(Volume { value, unit })
}

/// The raw `<number> <unit>` fragment [`parse_volume`] would read, as written.
pub fn volume_text(text: &str) -> Option<&str> {
    VOLUME_RE.find(text).map(|m| m.as_str())
}

pub fn price_per_unit(price: f64, text: &str) -> Option<UnitPrice> {
    if !price.is_finite() || price < 0.0 {
        return None;
    }
    let volume = parse_volume(text)?;
    Some(UnitPrice {
        volume,
        price,
        price_per_unit: price / volume.value,
    })
}

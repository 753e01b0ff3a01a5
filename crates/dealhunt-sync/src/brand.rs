//! Brand name canonicalisation and run-scoped brand resolution.

use std::collections::HashMap;

use dealhunt_core::Brand;
use dealhunt_storage::{Store, StoreResult};
use serde::Serialize;
use strsim::levenshtein;
use tracing::debug;
use uuid::Uuid;

/// Folded spelling → canonical brand name. Keys are lowercase, accent-free
/// and single-spaced.
const ALIASES: &[(&str, &str)] = &[
    ("ysl", "Yves Saint Laurent"),
    ("yves saint laurent", "Yves Saint Laurent"),
    ("yves st laurent", "Yves Saint Laurent"),
    ("yves st-laurent", "Yves Saint Laurent"),
    ("saint laurent paris", "Yves Saint Laurent"),
    ("saint laurent", "Yves Saint Laurent"),
    ("christian dior", "Dior"),
    ("dior beauty", "Dior"),
    ("lancome", "Lancôme"),
    ("lancome paris", "Lancôme"),
    ("estee lauder", "Estée Lauder"),
    ("l'oreal paris", "L'Oréal Paris"),
    ("l'oreal", "L'Oréal Paris"),
    ("loreal paris", "L'Oréal Paris"),
    ("la roche posay", "La Roche-Posay"),
    ("la roche-posay", "La Roche-Posay"),
    ("dolce & gabbana", "Dolce & Gabbana"),
    ("dolce&gabbana", "Dolce & Gabbana"),
    ("dolce gabbana", "Dolce & Gabbana"),
    ("jean paul gaultier", "Jean Paul Gaultier"),
    ("jean-paul gaultier", "Jean Paul Gaultier"),
    ("carolina herrera new york", "Carolina Herrera"),
    ("givenchy beauty", "Givenchy"),
    ("armani beauty", "Giorgio Armani"),
    ("giorgio armani beauty", "Giorgio Armani"),
    ("clarins paris", "Clarins"),
];

/// Brands whose official casing does not follow title case.
const SPECIAL_CASING: &[&str] = &[
    "NARS",
    "MAC",
    "NYX",
    "OPI",
    "CeraVe",
    "e.l.f.",
    "KIKO Milano",
    "BYREDO",
    "HUDA BEAUTY",
    "COSRX",
    "GHD",
    "NUXE",
    "SVR",
    "MÊME",
    "Dr.Jart+",
];

const LOWERCASE_WORDS: &[&str] = &[
    "de", "du", "des", "la", "le", "les", "et", "en", "of", "the", "and", "for", "by", "a", "au",
    "aux",
];

const UPPERCASE_WORDS: &[&str] = &["nyc", "usa", "uk", "ny", "spf", "bb", "cc"];

const MAX_SUBSTRING_LEN_DIFF: usize = 3;
/// Edit distance under which two brands are reported as likely duplicates.
pub const AUDIT_MAX_DISTANCE: usize = 2;

fn fold_char(c: char, out: &mut String) {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => out.push('a'),
        'ç' => out.push('c'),
        'è' | 'é' | 'ê' | 'ë' => out.push('e'),
        'ì' | 'í' | 'î' | 'ï' => out.push('i'),
        'ñ' => out.push('n'),
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => out.push('o'),
        'ù' | 'ú' | 'û' | 'ü' => out.push('u'),
        'ý' | 'ÿ' => out.push('y'),
        'æ' => out.push_str("ae"),
        'œ' => out.push_str("oe"),
        'ß' => out.push_str("ss"),
        '\u{2019}' | '\u{2018}' | '`' => out.push('\''),
        other => out.push(other),
    }
}

/// Lowercase, accent-free, single-spaced form used for table lookups.
pub fn fold(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.to_lowercase().chars() {
        fold_char(c, &mut out);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn slugify(input: &str) -> String {
    fold(input)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_lowercase();
            if UPPERCASE_WORDS.contains(&lower.as_str()) {
                word.to_uppercase()
            } else if i > 0 && LOWERCASE_WORDS.contains(&lower.as_str()) {
                lower
            } else {
                word.split('-').map(capitalize).collect::<Vec<_>>().join("-")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical display name for a raw brand string; `None` for blank input.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        return None;
    }
    let key = fold(&trimmed);

    if let Some((_, canonical)) = ALIASES.iter().find(|(alias, _)| *alias == key) {
        return Some((*canonical).to_string());
    }
    if let Some(special) = SPECIAL_CASING.iter().find(|name| fold(name) == key) {
        return Some((*special).to_string());
    }
    if let Some((_, canonical)) = ALIASES.iter().find(|(alias, _)| {
        (key.contains(alias) || alias.contains(key.as_str()))
            && key.len().abs_diff(alias.len()) <= MAX_SUBSTRING_LEN_DIFF
    }) {
        return Some((*canonical).to_string());
    }
    Some(title_case(&trimmed))
}

/// Every alias spelling known for `canonical`.
pub fn known_aliases(canonical: &str) -> Vec<String> {
    ALIASES
        .iter()
        .filter(|(_, c)| *c == canonical)
        .map(|(alias, _)| (*alias).to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrandPair {
    pub first: String,
    pub second: String,
    pub distance: usize,
}

/// Pairs of distinct brands whose folded names are within
/// [`AUDIT_MAX_DISTANCE`] edits. For review only; resolution never merges on
/// edit distance.
pub fn near_duplicates(brands: &[Brand]) -> Vec<BrandPair> {
    let folded: Vec<String> = brands.iter().map(|b| fold(&b.name)).collect();
    let mut pairs = Vec::new();
    for i in 0..brands.len() {
        for j in (i + 1)..brands.len() {
            if brands[i].slug == brands[j].slug {
                continue;
            }
            let distance = levenshtein(&folded[i], &folded[j]);
            if distance <= AUDIT_MAX_DISTANCE {
                pairs.push(BrandPair {
                    first: brands[i].name.clone(),
                    second: brands[j].name.clone(),
                    distance,
                });
            }
        }
    }
    pairs
}

/// Brand lookups cached for the lifetime of one ingestion run.
#[derive(Debug, Default)]
pub struct BrandResolver {
    cache: HashMap<String, Option<Uuid>>,
}

impl BrandResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing brand id, without creating anything. Misses are not cached so
    /// a later `resolve_or_create` still creates the brand.
    pub async fn find_existing(&mut self, store: &dyn Store, raw: &str) -> StoreResult<Option<Uuid>> {
        let key = fold(raw);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(*hit);
        }
        let Some(canonical) = normalize(raw) else {
            return Ok(None);
        };
        let found = match store.find_brand_by_slug(&slugify(&canonical)).await? {
            Some(brand) => Some(brand),
            None => store.find_brand_by_name(&canonical).await?,
        };
        if let Some(brand) = &found {
            self.cache.insert(key, Some(brand.id));
        }
        Ok(found.map(|b| b.id))
    }

    pub async fn resolve_or_create(&mut self, store: &dyn Store, raw: &str) -> StoreResult<Option<Uuid>> {
        let key = fold(raw);
        if let Some(Some(id)) = self.cache.get(&key) {
            return Ok(Some(*id));
        }
        let Some(canonical) = normalize(raw) else {
            self.cache.insert(key, None);
            return Ok(None);
        };
        let brand = store
            .find_or_create_brand(&canonical, &slugify(&canonical), &known_aliases(&canonical))
            .await?;
        debug!(raw, brand = %brand.name, brand_id = %brand.id, "brand resolved");
        self.cache.insert(key, Some(brand.id));
        Ok(Some(brand.id))
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

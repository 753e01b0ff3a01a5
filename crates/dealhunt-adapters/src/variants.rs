//! Pack-size variant extraction from competitor product pages.

use dealhunt_core::{parse_volume, volume_text, Volume};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

use crate::tiles::parse_price;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSelectors {
    pub item: &'static str,
    pub volume: &'static str,
    pub price: &'static str,
    pub original_price: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageVariant {
    pub volume_text: String,
    pub volume: Volume,
    pub price: f64,
    pub original_price: Option<f64>,
    pub in_stock: bool,
}

/// Single price shown on a page without a size selector.
#[derive(Debug, Clone, PartialEq)]
pub struct PagePrice {
    pub price: f64,
    pub original_price: Option<f64>,
    pub volume_text: Option<String>,
    pub title: Option<String>,
    pub in_stock: bool,
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sub_text(el: &ElementRef<'_>, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    el.select(&sel)
        .next()
        .map(|n| element_text(&n))
        .filter(|t| !t.is_empty())
}

fn is_unavailable(el: &ElementRef<'_>) -> bool {
    let value = el.value();
    if value.attr("data-available") == Some("false") || value.attr("aria-disabled") == Some("true") {
        return true;
    }
    value
        .classes()
        .any(|c| c.contains("unavailable") || c.contains("out-of-stock") || c.contains("disabled"))
}

/// Variants read through a site's size-selector markup.
pub fn variants_from_selectors(document: &Html, selectors: &VariantSelectors) -> Vec<PageVariant> {
    let Ok(item_sel) = Selector::parse(selectors.item) else {
        return Vec::new();
    };
    document
        .select(&item_sel)
        .filter_map(|item| {
            let volume_label = sub_text(&item, selectors.volume)
                .or_else(|| item.value().attr("data-size").map(ToString::to_string))?;
            let volume = parse_volume(&volume_label)?;
            let price = sub_text(&item, selectors.price)
                .or_else(|| item.value().attr("data-price").map(ToString::to_string))
                .and_then(|t| parse_price(&t))?;
            let original_price = selectors
                .original_price
                .and_then(|css| sub_text(&item, css))
                .and_then(|t| parse_price(&t));
            Some(PageVariant {
                volume_text: volume_text(&volume_label)
                    .map(ToString::to_string)
                    .unwrap_or(volume_label.clone()),
                volume,
                price,
                original_price,
                in_stock: !is_unavailable(&item),
            })
        })
        .collect()
}

fn json_ld_blocks(document: &Html) -> Vec<JsonValue> {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for script in document.select(&sel) {
        let text = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(text.trim()) else {
            continue;
        };
        flatten_json_ld(value, &mut out);
    }
    out
}

fn flatten_json_ld(value: JsonValue, out: &mut Vec<JsonValue>) {
    match value {
        JsonValue::Array(items) => items.into_iter().for_each(|v| flatten_json_ld(v, out)),
        JsonValue::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                flatten_json_ld(graph, out);
            }
            out.push(JsonValue::Object(map));
        }
        _ => {}
    }
}

fn is_type(value: &JsonValue, wanted: &str) -> bool {
    match value.get("@type") {
        Some(JsonValue::String(t)) => t == wanted,
        Some(JsonValue::Array(ts)) => ts.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

fn json_price(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_price(s),
        _ => None,
    }
}

fn offer_in_stock(offer: &JsonValue) -> bool {
    offer
        .get("availability")
        .and_then(JsonValue::as_str)
        .map(|a| a.contains("InStock") || a.contains("LimitedAvailability"))
        .unwrap_or(true)
}

fn offers_of(product: &JsonValue) -> Vec<&JsonValue> {
    match product.get("offers") {
        Some(JsonValue::Array(offers)) => offers.iter().collect(),
        Some(offer @ JsonValue::Object(_)) => match offer.get("offers") {
            Some(JsonValue::Array(inner)) => inner.iter().collect(),
            _ => vec![offer],
        },
        _ => Vec::new(),
    }
}

/// Variants declared as schema.org `Product.offers`, including
/// `ProductGroup.hasVariant` members.
pub fn variants_from_json_ld(document: &Html) -> Vec<PageVariant> {
    let blocks = json_ld_blocks(document);
    let mut products: Vec<&JsonValue> = Vec::new();
    for block in &blocks {
        if is_type(block, "Product") {
            products.push(block);
        }
        if is_type(block, "ProductGroup") {
            if let Some(JsonValue::Array(members)) = block.get("hasVariant") {
                products.extend(members.iter().filter(|m| is_type(m, "Product")));
            }
        }
    }

    let mut variants = Vec::new();
    for product in products {
        let product_label = ["size", "name"]
            .iter()
            .filter_map(|k| product.get(*k).and_then(JsonValue::as_str))
            .find(|s| parse_volume(s).is_some());
        for offer in offers_of(product) {
            let label = ["size", "name", "sku", "description"]
                .iter()
                .filter_map(|k| offer.get(*k).and_then(JsonValue::as_str))
                .find(|s| parse_volume(s).is_some())
                .or(product_label);
            let Some(label) = label else { continue };
            let (Some(volume), Some(price)) = (parse_volume(label), json_price(offer.get("price")))
            else {
                continue;
            };
            let original_price = offer
                .get("priceSpecification")
                .and_then(|spec| json_price(spec.get("price")))
                .filter(|p| *p > price);
            variants.push(PageVariant {
                volume_text: volume_text(label).unwrap_or(label).to_string(),
                volume,
                price,
                original_price,
                in_stock: offer_in_stock(offer),
            });
        }
    }
    variants
}

/// Site selectors first, then JSON-LD.
pub fn extract_variants(html: &str, selectors: Option<&VariantSelectors>) -> Vec<PageVariant> {
    let document = Html::parse_document(html);
    if let Some(selectors) = selectors {
        let from_markup = variants_from_selectors(&document, selectors);
        if !from_markup.is_empty() {
            return from_markup;
        }
    }
    variants_from_json_ld(&document)
}

/// The variant whose normalised size equals `target`; never the closest one.
pub fn select_variant<'a>(variants: &'a [PageVariant], target: &Volume) -> Option<&'a PageVariant> {
    variants.iter().find(|v| v.volume.same_size(target))
}

fn meta_content(document: &Html, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr("content").map(ToString::to_string).or_else(|| Some(element_text(&n))))
        .filter(|s| !s.trim().is_empty())
}

/// Last-resort read of a page's single displayed price and title volume.
pub fn page_price(html: &str) -> Option<PagePrice> {
    let document = Html::parse_document(html);
    let price = meta_content(&document, r#"[itemprop="price"]"#)
        .or_else(|| meta_content(&document, r#"meta[property="product:price:amount"]"#))
        .or_else(|| meta_content(&document, r#"meta[property="og:price:amount"]"#))
        .and_then(|t| parse_price(&t))
        .or_else(|| {
            variants_from_json_ld(&document)
                .first()
                .map(|v| v.price)
        })?;
    let title = meta_content(&document, r#"meta[property="og:title"]"#).or_else(|| {
        Selector::parse("h1")
            .ok()
            .and_then(|sel| document.select(&sel).next().map(|n| element_text(&n)))
            .filter(|t| !t.is_empty())
    });
    let original_price = meta_content(&document, r#"[itemprop="highPrice"]"#)
        .and_then(|t| parse_price(&t))
        .filter(|p| *p > price);
    let in_stock = meta_content(&document, r#"[itemprop="availability"]"#)
        .map(|a| !a.contains("OutOfStock"))
        .unwrap_or(true);
    Some(PagePrice {
        price,
        original_price,
        volume_text: title
            .as_deref()
            .and_then(volume_text)
            .map(ToString::to_string),
        title,
        in_stock,
    })
}

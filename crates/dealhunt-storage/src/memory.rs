//! In-process [`Store`] used for offline runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use dealhunt_core::{
    Brand, CompetitorPrice, Deal, DealUpdate, NewCatalogEntry, PriceHistoryEntry, Product,
    Variant, Volume,
};
use uuid::Uuid;

use crate::store::{prices_equal, DealListing, Store, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    brands: Vec<Brand>,
    products: Vec<Product>,
    variants: Vec<Variant>,
    deals: Vec<Deal>,
    price_history: Vec<PriceHistoryEntry>,
    competitor_prices: HashMap<(Uuid, String), CompetitorPrice>,
    failing_urls: HashSet<String>,
}

/// Mutex-guarded catalog. Every operation holds the lock for its whole
/// duration, so multi-row writes are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Message("memory store lock poisoned".to_string()))
    }

    /// Makes every catalog creation for `product_url` fail, for exercising
    /// persistence-error paths.
    pub fn inject_create_failure(&self, product_url: &str) {
        if let Ok(mut state) = self.state() {
            state.failing_urls.insert(product_url.to_string());
        }
    }

    pub fn product_count(&self) -> usize {
        self.state().map(|s| s.products.len()).unwrap_or_default()
    }

    pub fn deal_count(&self) -> usize {
        self.state().map(|s| s.deals.len()).unwrap_or_default()
    }

    pub fn variant_count(&self) -> usize {
        self.state().map(|s| s.variants.len()).unwrap_or_default()
    }

    pub fn price_history_count(&self) -> usize {
        self.state().map(|s| s.price_history.len()).unwrap_or_default()
    }

    pub fn price_history(&self, product_id: Uuid) -> Vec<PriceHistoryEntry> {
        self.state()
            .map(|s| {
                s.price_history
                    .iter()
                    .filter(|h| h.product_id == product_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn products(&self) -> Vec<Product> {
        self.state().map(|s| s.products.clone()).unwrap_or_default()
    }

    pub fn deals(&self) -> Vec<Deal> {
        self.state().map(|s| s.deals.clone()).unwrap_or_default()
    }

    pub fn brands(&self) -> Vec<Brand> {
        self.state().map(|s| s.brands.clone()).unwrap_or_default()
    }

    /// Seeds a complete catalog entry, bypassing uniqueness checks.
    pub fn seed(&self, entry: NewCatalogEntry) {
        if let Ok(mut state) = self.state() {
            state.products.push(entry.product);
            state.variants.push(entry.variant);
            state.deals.push(entry.deal);
            state.price_history.push(entry.initial_price);
        }
    }
}

fn latest_price_in(state: &MemoryState, product_id: Uuid) -> Option<f64> {
    state
        .price_history
        .iter()
        .filter(|h| h.product_id == product_id)
        .max_by_key(|h| h.recorded_at)
        .map(|h| h.price)
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_product_by_url(&self, product_url: &str) -> StoreResult<Option<Product>> {
        Ok(self
            .state()?
            .products
            .iter()
            .find(|p| p.product_url == product_url)
            .cloned())
    }

    async fn find_products_by_name_and_brand(
        &self,
        normalized_name: &str,
        brand_id: Option<Uuid>,
    ) -> StoreResult<Vec<Product>> {
        Ok(self
            .state()?
            .products
            .iter()
            .filter(|p| p.normalized_name == normalized_name && p.brand_id == brand_id)
            .cloned()
            .collect())
    }

    async fn find_deal_for_product(&self, product_id: Uuid) -> StoreResult<Option<Deal>> {
        Ok(self
            .state()?
            .deals
            .iter()
            .filter(|d| d.product_id == product_id)
            .max_by_key(|d| d.updated_at)
            .cloned())
    }

    async fn find_variant(&self, variant_id: Uuid) -> StoreResult<Option<Variant>> {
        Ok(self
            .state()?
            .variants
            .iter()
            .find(|v| v.id == variant_id)
            .cloned())
    }

    async fn update_product_metadata(
        &self,
        product_id: Uuid,
        product_url: &str,
        image_url: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state()?;
        let product = state
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "product",
                key: product_id.to_string(),
            })?;
        product.product_url = product_url.to_string();
        if let Some(image_url) = image_url {
            product.image_url = Some(image_url.to_string());
        }
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn find_or_create_variant(
        &self,
        product_id: Uuid,
        volume: Volume,
        raw_volume: &str,
        external_code: Option<&str>,
    ) -> StoreResult<Variant> {
        let mut state = self.state()?;
        if let Some(existing) = state
            .variants
            .iter()
            .find(|v| v.product_id == product_id && v.volume().same_size(&volume))
        {
            return Ok(existing.clone());
        }
        let variant = Variant {
            id: Uuid::new_v4(),
            product_id,
            volume_value: volume.value,
            volume_unit: volume.unit,
            raw_volume: raw_volume.to_string(),
            external_code: external_code.map(ToString::to_string),
        };
        state.variants.push(variant.clone());
        Ok(variant)
    }

    async fn update_deal(&self, deal_id: Uuid, update: &DealUpdate) -> StoreResult<()> {
        let mut state = self.state()?;
        let deal = state
            .deals
            .iter_mut()
            .find(|d| d.id == deal_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "deal",
                key: deal_id.to_string(),
            })?;
        deal.variant_id = update.variant_id;
        deal.title = update.title.clone();
        deal.deal_price = update.deal_price;
        deal.original_price = update.original_price;
        deal.discount_percent = update.discount_percent;
        deal.discount_amount = update.discount_amount;
        deal.score = update.score;
        deal.tags = update.tags.clone();
        deal.is_expired = false;
        deal.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_deal_expired(&self, deal_id: Uuid) -> StoreResult<()> {
        let mut state = self.state()?;
        let deal = state
            .deals
            .iter_mut()
            .find(|d| d.id == deal_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "deal",
                key: deal_id.to_string(),
            })?;
        deal.is_expired = true;
        deal.updated_at = Utc::now();
        Ok(())
    }

    async fn latest_price(&self, product_id: Uuid) -> StoreResult<Option<f64>> {
        Ok(latest_price_in(&*self.state()?, product_id))
    }

    async fn append_price_history_if_changed(
        &self,
        product_id: Uuid,
        price: f64,
    ) -> StoreResult<bool> {
        let mut state = self.state()?;
        if latest_price_in(&state, product_id).is_some_and(|last| prices_equal(last, price)) {
            return Ok(false);
        }
        state.price_history.push(PriceHistoryEntry {
            id: Uuid::new_v4(),
            product_id,
            price,
            recorded_at: Utc::now(),
        });
        Ok(true)
    }

    async fn slug_exists(&self, slug: &str) -> StoreResult<bool> {
        Ok(self.state()?.products.iter().any(|p| p.slug == slug))
    }

    async fn find_brand_by_slug(&self, slug: &str) -> StoreResult<Option<Brand>> {
        Ok(self
            .state()?
            .brands
            .iter()
            .find(|b| b.slug == slug)
            .cloned())
    }

    async fn find_brand_by_name(&self, name: &str) -> StoreResult<Option<Brand>> {
        Ok(self
            .state()?
            .brands
            .iter()
            .find(|b| b.name == name)
            .cloned())
    }

    async fn create_brand(&self, brand: &Brand) -> StoreResult<()> {
        let mut state = self.state()?;
        if state.brands.iter().any(|b| b.slug == brand.slug) {
            return Err(StoreError::Conflict {
                entity: "brand",
                key: brand.slug.clone(),
            });
        }
        state.brands.push(brand.clone());
        Ok(())
    }

    async fn list_brands(&self) -> StoreResult<Vec<Brand>> {
        Ok(self.state()?.brands.clone())
    }

    async fn create_product_with_deal_and_history(
        &self,
        entry: &NewCatalogEntry,
    ) -> StoreResult<()> {
        let mut state = self.state()?;
        let product = &entry.product;

        // Validate everything before the first insert.
        if state.failing_urls.contains(&product.product_url) {
            return Err(StoreError::Message(format!(
                "injected write failure for {}",
                product.product_url
            )));
        }
        if state.products.iter().any(|p| p.slug == product.slug) {
            return Err(StoreError::Conflict {
                entity: "product slug",
                key: product.slug.clone(),
            });
        }
        if state
            .products
            .iter()
            .any(|p| p.product_url == product.product_url)
        {
            return Err(StoreError::Conflict {
                entity: "product url",
                key: product.product_url.clone(),
            });
        }
        if entry.variant.product_id != product.id
            || entry.deal.product_id != product.id
            || entry.deal.variant_id != entry.variant.id
            || entry.initial_price.product_id != product.id
        {
            return Err(StoreError::Message(
                "catalog entry rows reference different products".to_string(),
            ));
        }

        state.products.push(product.clone());
        state.variants.push(entry.variant.clone());
        state.deals.push(entry.deal.clone());
        state.price_history.push(entry.initial_price.clone());
        Ok(())
    }

    async fn list_scored_deals(&self, limit: usize) -> StoreResult<Vec<DealListing>> {
        let state = self.state()?;
        let mut deals: Vec<&Deal> = state.deals.iter().filter(|d| !d.is_expired).collect();
        deals.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut listings = Vec::new();
        for deal in deals.into_iter().take(limit) {
            let product = state.products.iter().find(|p| p.id == deal.product_id);
            let variant = state.variants.iter().find(|v| v.id == deal.variant_id);
            let (Some(product), Some(variant)) = (product, variant) else {
                continue;
            };
            let brand_name = product
                .brand_id
                .and_then(|id| state.brands.iter().find(|b| b.id == id))
                .map(|b| b.name.clone());
            listings.push(DealListing {
                deal: deal.clone(),
                product: product.clone(),
                variant: variant.clone(),
                brand_name,
            });
        }
        Ok(listings)
    }

    async fn upsert_competitor_price(&self, price: &CompetitorPrice) -> StoreResult<()> {
        self.state()?
            .competitor_prices
            .insert((price.deal_id, price.merchant_id.clone()), price.clone());
        Ok(())
    }

    async fn competitor_prices_for_deal(&self, deal_id: Uuid) -> StoreResult<Vec<CompetitorPrice>> {
        let mut prices: Vec<CompetitorPrice> = self
            .state()?
            .competitor_prices
            .values()
            .filter(|p| p.deal_id == deal_id)
            .cloned()
            .collect();
        prices.sort_by(|a, b| a.merchant_id.cmp(&b.merchant_id));
        Ok(prices)
    }
}

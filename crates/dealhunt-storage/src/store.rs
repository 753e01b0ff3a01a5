//! The catalog persistence contract consumed by ingestion and competitor matching.

use async_trait::async_trait;
use dealhunt_core::{
    Brand, CompetitorPrice, Deal, DealUpdate, NewCatalogEntry, Product, Variant, Volume,
};
use thiserror::Error;
use uuid::Uuid;

/// Two prices closer than this are the same observed price.
pub const PRICE_EPSILON: f64 = 0.005;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("{entity} conflict on {key}")]
    Conflict { entity: &'static str, key: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A deal joined with the catalog rows needed to search for it elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct DealListing {
    pub deal: Deal,
    pub product: Product,
    pub variant: Variant,
    pub brand_name: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_product_by_url(&self, product_url: &str) -> StoreResult<Option<Product>>;

    /// Equality lookup on the normalized product name and resolved brand,
    /// oldest first. Several pack sizes of one product share a name.
    async fn find_products_by_name_and_brand(
        &self,
        normalized_name: &str,
        brand_id: Option<Uuid>,
    ) -> StoreResult<Vec<Product>>;

    async fn find_deal_for_product(&self, product_id: Uuid) -> StoreResult<Option<Deal>>;

    async fn find_variant(&self, variant_id: Uuid) -> StoreResult<Option<Variant>>;

    async fn update_product_metadata(
        &self,
        product_id: Uuid,
        product_url: &str,
        image_url: Option<&str>,
    ) -> StoreResult<()>;

    async fn find_or_create_variant(
        &self,
        product_id: Uuid,
        volume: Volume,
        raw_volume: &str,
        external_code: Option<&str>,
    ) -> StoreResult<Variant>;

    async fn update_deal(&self, deal_id: Uuid, update: &DealUpdate) -> StoreResult<()>;

    async fn mark_deal_expired(&self, deal_id: Uuid) -> StoreResult<()>;

    async fn latest_price(&self, product_id: Uuid) -> StoreResult<Option<f64>>;

    /// Appends a history row unless `price` equals the most recent recorded
    /// price. Returns whether a row was written.
    async fn append_price_history_if_changed(
        &self,
        product_id: Uuid,
        price: f64,
    ) -> StoreResult<bool>;

    async fn slug_exists(&self, slug: &str) -> StoreResult<bool>;

    async fn find_brand_by_slug(&self, slug: &str) -> StoreResult<Option<Brand>>;

    async fn find_brand_by_name(&self, name: &str) -> StoreResult<Option<Brand>>;

    async fn create_brand(&self, brand: &Brand) -> StoreResult<()>;

    async fn list_brands(&self) -> StoreResult<Vec<Brand>>;

    /// Looks up by slug, then by exact name, and creates the brand with
    /// `aliases` attached when neither exists.
    async fn find_or_create_brand(
        &self,
        name: &str,
        slug: &str,
        aliases: &[String],
    ) -> StoreResult<Brand> {
        if let Some(brand) = self.find_brand_by_slug(slug).await? {
            return Ok(brand);
        }
        if let Some(brand) = self.find_brand_by_name(name).await? {
            return Ok(brand);
        }
        let brand = Brand {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug: slug.to_string(),
            aliases: aliases.to_vec(),
        };
        match self.create_brand(&brand).await {
            Ok(()) => Ok(brand),
            // Lost a race with another writer; the row now exists.
            Err(StoreError::Conflict { .. }) => self
                .find_brand_by_slug(slug)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "brand",
                    key: slug.to_string(),
                }),
            Err(err) => Err(err),
        }
    }

    /// Creates product, variant, deal and the first price-history row, or
    /// nothing at all.
    async fn create_product_with_deal_and_history(
        &self,
        entry: &NewCatalogEntry,
    ) -> StoreResult<()>;

    /// Non-expired deals, most recently updated first.
    async fn list_scored_deals(&self, limit: usize) -> StoreResult<Vec<DealListing>>;

    /// Inserts or replaces the row keyed by `(deal_id, merchant_id)`.
    async fn upsert_competitor_price(&self, price: &CompetitorPrice) -> StoreResult<()>;

    async fn competitor_prices_for_deal(&self, deal_id: Uuid) -> StoreResult<Vec<CompetitorPrice>>;
}

pub fn prices_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < PRICE_EPSILON
}

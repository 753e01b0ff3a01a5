//! Postgres-backed [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealhunt_core::{
    Brand, BrandTier, CompetitorPrice, Deal, DealUpdate, NewCatalogEntry, Product, Variant,
    Volume, VolumeUnit,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::info;
use uuid::Uuid;

use crate::store::{DealListing, Store, StoreError, StoreResult, PRICE_EPSILON};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const PRODUCT_COLUMNS: &str = "id, name, normalized_name, slug, brand_id, category_slug, \
     subcategory_slug, subsubcategory_slug, merchant_id, product_url, image_url, created_at, updated_at";

const DEAL_COLUMNS: &str = "id, product_id, variant_id, merchant_id, title, refined_title, \
     deal_price, original_price, discount_percent, discount_amount, score, tags, brand_tier, \
     is_hot, is_trending, is_expired, votes, views, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }
}

fn map_write_error(entity: &'static str, key: &str, err: sqlx::Error) -> StoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Conflict {
            entity,
            key: key.to_string(),
        },
        _ => StoreError::Database(err),
    }
}

#[derive(Debug, FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    normalized_name: String,
    slug: String,
    brand_id: Option<Uuid>,
    category_slug: Option<String>,
    subcategory_slug: Option<String>,
    subsubcategory_slug: Option<String>,
    merchant_id: String,
    product_url: String,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            name: row.name,
            normalized_name: row.normalized_name,
            slug: row.slug,
            brand_id: row.brand_id,
            category_slug: row.category_slug,
            subcategory_slug: row.subcategory_slug,
            subsubcategory_slug: row.subsubcategory_slug,
            merchant_id: row.merchant_id,
            product_url: row.product_url,
            image_url: row.image_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct VariantRow {
    id: Uuid,
    product_id: Uuid,
    volume_value: f64,
    volume_unit: String,
    raw_volume: String,
    external_code: Option<String>,
}

impl TryFrom<VariantRow> for Variant {
    type Error = StoreError;

    fn try_from(row: VariantRow) -> Result<Self, Self::Error> {
        let volume_unit = VolumeUnit::parse(&row.volume_unit).ok_or_else(|| {
            StoreError::Message(format!("variant {} has unit {}", row.id, row.volume_unit))
        })?;
        Ok(Variant {
            id: row.id,
            product_id: row.product_id,
            volume_value: row.volume_value,
            volume_unit,
            raw_volume: row.raw_volume,
            external_code: row.external_code,
        })
    }
}

#[derive(Debug, FromRow)]
struct DealRow {
    id: Uuid,
    product_id: Uuid,
    variant_id: Uuid,
    merchant_id: String,
    title: String,
    refined_title: Option<String>,
    deal_price: f64,
    original_price: f64,
    discount_percent: f64,
    discount_amount: f64,
    score: i16,
    tags: String,
    brand_tier: Option<i16>,
    is_hot: bool,
    is_trending: bool,
    is_expired: bool,
    votes: i32,
    views: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DealRow> for Deal {
    fn from(row: DealRow) -> Self {
        Deal {
            id: row.id,
            product_id: row.product_id,
            variant_id: row.variant_id,
            merchant_id: row.merchant_id,
            title: row.title,
            refined_title: row.refined_title,
            deal_price: row.deal_price,
            original_price: row.original_price,
            discount_percent: row.discount_percent,
            discount_amount: row.discount_amount,
            score: row.score.clamp(0, 100) as u8,
            tags: row.tags,
            brand_tier: row
                .brand_tier
                .and_then(|t| u8::try_from(t).ok())
                .and_then(BrandTier::from_rank),
            is_hot: row.is_hot,
            is_trending: row.is_trending,
            is_expired: row.is_expired,
            votes: row.votes,
            views: row.views,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct BrandRow {
    id: Uuid,
    name: String,
    slug: String,
    aliases: Vec<String>,
}

impl From<BrandRow> for Brand {
    fn from(row: BrandRow) -> Self {
        Brand {
            id: row.id,
            name: row.name,
            slug: row.slug,
            aliases: row.aliases,
        }
    }
}

#[derive(Debug, FromRow)]
struct CompetitorPriceRow {
    deal_id: Uuid,
    merchant_id: String,
    price: f64,
    original_price: Option<f64>,
    product_url: String,
    volume: Option<String>,
    in_stock: bool,
    last_checked: DateTime<Utc>,
}

impl From<CompetitorPriceRow> for CompetitorPrice {
    fn from(row: CompetitorPriceRow) -> Self {
        CompetitorPrice {
            deal_id: row.deal_id,
            merchant_id: row.merchant_id,
            price: row.price,
            original_price: row.original_price,
            product_url: row.product_url,
            volume: row.volume,
            in_stock: row.in_stock,
            last_checked: row.last_checked,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_product_by_url(&self, product_url: &str) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE product_url = $1"
        ))
        .bind(product_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Product::from))
    }

    async fn find_products_by_name_and_brand(
        &self,
        normalized_name: &str,
        brand_id: Option<Uuid>,
    ) -> StoreResult<Vec<Product>> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE normalized_name = $1 AND brand_id IS NOT DISTINCT FROM $2 \
             ORDER BY created_at"
        ))
        .bind(normalized_name)
        .bind(brand_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn find_deal_for_product(&self, product_id: Uuid) -> StoreResult<Option<Deal>> {
        let row = sqlx::query_as::<_, DealRow>(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE product_id = $1 \
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Deal::from))
    }

    async fn find_variant(&self, variant_id: Uuid) -> StoreResult<Option<Variant>> {
        sqlx::query_as::<_, VariantRow>(
            "SELECT id, product_id, volume_value, volume_unit, raw_volume, external_code \
             FROM variants WHERE id = $1",
        )
        .bind(variant_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Variant::try_from)
        .transpose()
    }

    async fn update_product_metadata(
        &self,
        product_id: Uuid,
        product_url: &str,
        image_url: Option<&str>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE products SET product_url = $2, image_url = COALESCE($3, image_url), \
             updated_at = now() WHERE id = $1",
        )
        .bind(product_id)
        .bind(product_url)
        .bind(image_url)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error("product url", product_url, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "product",
                key: product_id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_or_create_variant(
        &self,
        product_id: Uuid,
        volume: Volume,
        raw_volume: &str,
        external_code: Option<&str>,
    ) -> StoreResult<Variant> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query_as::<_, VariantRow>(
            "INSERT INTO variants (id, product_id, volume_value, volume_unit, raw_volume, external_code) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (product_id, volume_value, volume_unit) \
             DO UPDATE SET volume_value = EXCLUDED.volume_value \
             RETURNING id, product_id, volume_value, volume_unit, raw_volume, external_code",
        )
        .bind(Uuid::new_v4())
        .bind(product_id)
        .bind(volume.value)
        .bind(volume.unit.as_str())
        .bind(raw_volume)
        .bind(external_code)
        .fetch_one(&self.pool)
        .await?;
        Variant::try_from(row)
    }

    async fn update_deal(&self, deal_id: Uuid, update: &DealUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE deals SET variant_id = $2, title = $3, deal_price = $4, original_price = $5, \
             discount_percent = $6, discount_amount = $7, score = $8, tags = $9, \
             is_expired = FALSE, updated_at = now() WHERE id = $1",
        )
        .bind(deal_id)
        .bind(update.variant_id)
        .bind(&update.title)
        .bind(update.deal_price)
        .bind(update.original_price)
        .bind(update.discount_percent)
        .bind(update.discount_amount)
        .bind(i16::from(update.score))
        .bind(&update.tags)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "deal",
                key: deal_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_deal_expired(&self, deal_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE deals SET is_expired = TRUE, updated_at = now() WHERE id = $1")
            .bind(deal_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_price(&self, product_id: Uuid) -> StoreResult<Option<f64>> {
        let price = sqlx::query_scalar::<_, f64>(
            "SELECT price FROM price_history WHERE product_id = $1 \
             ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(price)
    }

    async fn append_price_history_if_changed(
        &self,
        product_id: Uuid,
        price: f64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO price_history (id, product_id, price, recorded_at) \
             SELECT $1, $2, $3, now() \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM ( \
                     SELECT price FROM price_history WHERE product_id = $2 \
                     ORDER BY recorded_at DESC LIMIT 1 \
                 ) latest WHERE abs(latest.price - $3) < $4 \
             )",
        )
        .bind(Uuid::new_v4())
        .bind(product_id)
        .bind(price)
        .bind(PRICE_EPSILON)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn slug_exists(&self, slug: &str) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM products WHERE slug = $1)",
        )
        .bind(slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn find_brand_by_slug(&self, slug: &str) -> StoreResult<Option<Brand>> {
        let row = sqlx::query_as::<_, BrandRow>(
            "SELECT id, name, slug, aliases FROM brands WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Brand::from))
    }

    async fn find_brand_by_name(&self, name: &str) -> StoreResult<Option<Brand>> {
        let row = sqlx::query_as::<_, BrandRow>(
            "SELECT id, name, slug, aliases FROM brands WHERE name = $1 LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Brand::from))
    }

    async fn create_brand(&self, brand: &Brand) -> StoreResult<()> {
        sqlx::query("INSERT INTO brands (id, name, slug, aliases) VALUES ($1, $2, $3, $4)")
            .bind(brand.id)
            .bind(&brand.name)
            .bind(&brand.slug)
            .bind(&brand.aliases)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error("brand", &brand.slug, e))?;
        Ok(())
    }

    async fn list_brands(&self) -> StoreResult<Vec<Brand>> {
        let rows = sqlx::query_as::<_, BrandRow>(
            "SELECT id, name, slug, aliases FROM brands ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Brand::from).collect())
    }

    async fn create_product_with_deal_and_history(
        &self,
        entry: &NewCatalogEntry,
    ) -> StoreResult<()> {
        let NewCatalogEntry {
            product,
            variant,
            deal,
            initial_price,
        } = entry;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO products ({PRODUCT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.normalized_name)
        .bind(&product.slug)
        .bind(product.brand_id)
        .bind(&product.category_slug)
        .bind(&product.subcategory_slug)
        .bind(&product.subsubcategory_slug)
        .bind(&product.merchant_id)
        .bind(&product.product_url)
        .bind(&product.image_url)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error("product", &product.slug, e))?;

        sqlx::query(
            "INSERT INTO variants (id, product_id, volume_value, volume_unit, raw_volume, external_code) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(variant.id)
        .bind(variant.product_id)
        .bind(variant.volume_value)
        .bind(variant.volume_unit.as_str())
        .bind(&variant.raw_volume)
        .bind(&variant.external_code)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO deals ({DEAL_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        ))
        .bind(deal.id)
        .bind(deal.product_id)
        .bind(deal.variant_id)
        .bind(&deal.merchant_id)
        .bind(&deal.title)
        .bind(&deal.refined_title)
        .bind(deal.deal_price)
        .bind(deal.original_price)
        .bind(deal.discount_percent)
        .bind(deal.discount_amount)
        .bind(i16::from(deal.score))
        .bind(&deal.tags)
        .bind(deal.brand_tier.map(|t| i16::from(t.rank())))
        .bind(deal.is_hot)
        .bind(deal.is_trending)
        .bind(deal.is_expired)
        .bind(deal.votes)
        .bind(deal.views)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO price_history (id, product_id, price, recorded_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(initial_price.id)
        .bind(initial_price.product_id)
        .bind(initial_price.price)
        .bind(initial_price.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_scored_deals(&self, limit: usize) -> StoreResult<Vec<DealListing>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deals = sqlx::query_as::<_, DealRow>(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE NOT is_expired \
             ORDER BY updated_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut listings = Vec::with_capacity(deals.len());
        for row in deals {
            let deal = Deal::from(row);
            let product = sqlx::query_as::<_, ProductRow>(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
            ))
            .bind(deal.product_id)
            .fetch_optional(&self.pool)
            .await?;
            let Some(product) = product.map(Product::from) else {
                continue;
            };
            let Some(variant) = self.find_variant(deal.variant_id).await? else {
                continue;
            };
            let brand_name = match product.brand_id {
                Some(brand_id) => {
                    sqlx::query_scalar::<_, String>("SELECT name FROM brands WHERE id = $1")
                        .bind(brand_id)
                        .fetch_optional(&self.pool)
                        .await?
                }
                None => None,
            };
            listings.push(DealListing {
                deal,
                product,
                variant,
                brand_name,
            });
        }
        Ok(listings)
    }

    async fn upsert_competitor_price(&self, price: &CompetitorPrice) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO competitor_prices \
             (deal_id, merchant_id, price, original_price, product_url, volume, in_stock, last_checked) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (deal_id, merchant_id) DO UPDATE SET \
             price = EXCLUDED.price, original_price = EXCLUDED.original_price, \
             product_url = EXCLUDED.product_url, volume = EXCLUDED.volume, \
             in_stock = EXCLUDED.in_stock, last_checked = EXCLUDED.last_checked",
        )
        .bind(price.deal_id)
        .bind(&price.merchant_id)
        .bind(price.price)
        .bind(price.original_price)
        .bind(&price.product_url)
        .bind(&price.volume)
        .bind(price.in_stock)
        .bind(price.last_checked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn competitor_prices_for_deal(&self, deal_id: Uuid) -> StoreResult<Vec<CompetitorPrice>> {
        let rows = sqlx::query_as::<_, CompetitorPriceRow>(
            "SELECT deal_id, merchant_id, price, original_price, product_url, volume, in_stock, \
             last_checked FROM competitor_prices WHERE deal_id = $1 ORDER BY merchant_id",
        )
        .bind(deal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CompetitorPrice::from).collect())
    }
}

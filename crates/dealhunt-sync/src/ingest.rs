//! Reconciles scraped listings against the catalog: updates deals already
//! known, classifies and creates the rest.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dealhunt_adapters::{
    BatchResult, Classification, ClassificationInput, Classifier, ClassifierError, Taxonomy,
    MAX_BATCH,
};
use dealhunt_core::{
    normalize_product_name, parse_volume, price_per_unit, Deal, DealUpdate, NewCatalogEntry,
    PriceHistoryEntry, Product, ScrapedRecord, Variant, Volume,
};
use dealhunt_storage::{Store, StoreError};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::brand::{self, BrandResolver};
use crate::scoring::{self, ScoreInput};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Minimum discount (percent) for a listing to count as a deal.
    pub min_discount_percent: f64,
    pub classifier_batch_size: usize,
    pub update_batch_size: usize,
    pub classifier_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_discount_percent: 5.0,
            classifier_batch_size: MAX_BATCH,
            update_batch_size: 50,
            classifier_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid record {product_url}: {reason}")]
    Validation { product_url: String, reason: String },
    #[error("external service failure: {0}")]
    ExternalService(String),
    #[error("product {product_id} matched by name but has volume {existing} instead of {observed}")]
    MatchAmbiguity {
        product_id: Uuid,
        existing: Volume,
        observed: Volume,
    },
    #[error("persisting {product_url} failed: {source}")]
    Persistence {
        product_url: String,
        #[source]
        source: StoreError,
    },
    #[error("classifier batch {batch_index} ({record_count} records) failed: {source}")]
    ClassifierBatch {
        batch_index: usize,
        record_count: usize,
        #[source]
        source: ClassifierError,
        /// Work committed before the failing batch.
        report: Box<IngestReport>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorKind {
    Persistence,
    Validation,
}

impl RecordErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Persistence => "persistence",
            Self::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub product_url: String,
    pub kind: RecordErrorKind,
    pub message: String,
}

impl From<&IngestError> for RecordError {
    fn from(err: &IngestError) -> Self {
        let (product_url, kind) = match err {
            IngestError::Persistence { product_url, .. } => {
                (product_url.clone(), RecordErrorKind::Persistence)
            }
            IngestError::Validation { product_url, .. } => {
                (product_url.clone(), RecordErrorKind::Validation)
            }
            _ => (String::new(), RecordErrorKind::Persistence),
        };
        Self {
            product_url,
            kind,
            message: err.to_string(),
        }
    }
}

/// Counts for one ingestion run. Every input record lands in exactly one of
/// the rejected/duplicate/updated/expired/skipped/unclassified/created
/// buckets or in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub scraped: usize,
    pub rejected_no_volume: usize,
    pub rejected_invalid_price: usize,
    pub duplicates: usize,
    pub matched: usize,
    pub ambiguous_matches: usize,
    pub updated: usize,
    pub expired: usize,
    pub price_changed: usize,
    pub skipped_low_discount: usize,
    pub classifier_batches: usize,
    pub unclassified: usize,
    pub created: usize,
    pub errors: Vec<RecordError>,
}

impl IngestReport {
    pub fn rejected(&self) -> usize {
        self.rejected_no_volume + self.rejected_invalid_price
    }

    fn push_error(&mut self, err: &IngestError) {
        self.errors.push(RecordError::from(err));
    }

    pub fn merge(&mut self, other: &IngestReport) {
        self.scraped += other.scraped;
        self.rejected_no_volume += other.rejected_no_volume;
        self.rejected_invalid_price += other.rejected_invalid_price;
        self.duplicates += other.duplicates;
        self.matched += other.matched;
        self.ambiguous_matches += other.ambiguous_matches;
        self.updated += other.updated;
        self.expired += other.expired;
        self.price_changed += other.price_changed;
        self.skipped_low_discount += other.skipped_low_discount;
        self.classifier_batches += other.classifier_batches;
        self.unclassified += other.unclassified;
        self.created += other.created;
        self.errors.extend(other.errors.iter().cloned());
    }
}

/// State shared by every record of one run: the brand cache and the slugs
/// handed out so far.
#[derive(Debug)]
pub struct IngestionContext {
    pub run_id: Uuid,
    pub merchant_id: String,
    brands: BrandResolver,
    slugs: HashSet<String>,
}

impl IngestionContext {
    pub fn new(run_id: Uuid, merchant_id: impl Into<String>) -> Self {
        Self {
            run_id,
            merchant_id: merchant_id.into(),
            brands: BrandResolver::new(),
            slugs: HashSet::new(),
        }
    }

    async fn unique_slug(&mut self, store: &dyn Store, base: &str) -> Result<String, StoreError> {
        let base = if base.is_empty() { "produit" } else { base };
        let mut candidate = base.to_string();
        let mut suffix = 2;
        while self.slugs.contains(&candidate) || store.slug_exists(&candidate).await? {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        self.slugs.insert(candidate.clone());
        Ok(candidate)
    }
}

/// A record that passed validation, with its parsed volume.
#[derive(Debug, Clone)]
struct Candidate {
    record: ScrapedRecord,
    volume: Volume,
}

#[derive(Debug)]
struct Matched {
    candidate: Candidate,
    product: Product,
    deal: Deal,
}

#[derive(Debug, Default)]
struct UpdateOutcome {
    updated: bool,
    expired: bool,
    price_changed: bool,
}

#[derive(Debug)]
struct ClassificationBatch {
    index: usize,
    candidates: Vec<Candidate>,
}

/// Fixed-size batches handed to the classifier one at a time, with a pause
/// between calls.
#[derive(Debug)]
struct ClassificationQueue {
    pending: VecDeque<ClassificationBatch>,
    delay: Duration,
    dispatched: usize,
}

impl ClassificationQueue {
    fn new(candidates: Vec<Candidate>, batch_size: usize, delay: Duration) -> Self {
        let batch_size = batch_size.clamp(1, MAX_BATCH);
        let mut pending = VecDeque::new();
        let mut iter = candidates.into_iter().peekable();
        while iter.peek().is_some() {
            let candidates: Vec<Candidate> = iter.by_ref().take(batch_size).collect();
            pending.push_back(ClassificationBatch {
                index: pending.len(),
                candidates,
            });
        }
        Self {
            pending,
            delay,
            dispatched: 0,
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    async fn next(
        &mut self,
        classifier: &dyn Classifier,
        taxonomy: &Taxonomy,
    ) -> Option<(ClassificationBatch, BatchResult)> {
        let batch = self.pending.pop_front()?;
        if self.dispatched > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.dispatched += 1;
        let inputs: Vec<ClassificationInput> = batch
            .candidates
            .iter()
            .map(|c| ClassificationInput {
                name: c.record.name.clone(),
                brand: Some(c.record.brand.clone()).filter(|b| !b.trim().is_empty()),
                volume: Some(c.record.volume.clone()),
            })
            .collect();
        let result = classifier.classify_batch(&inputs, taxonomy).await;
        Some((batch, result))
    }
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    classifier: Arc<dyn Classifier>,
    taxonomy: Arc<Taxonomy>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        classifier: Arc<dyn Classifier>,
        taxonomy: Arc<Taxonomy>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            taxonomy,
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Runs one ingestion pass. Only a classifier outage ends it early, and
    /// the returned error carries what was committed before.
    pub async fn ingest(
        &self,
        ctx: &mut IngestionContext,
        records: Vec<ScrapedRecord>,
    ) -> Result<IngestReport, IngestError> {
        let span = info_span!("ingest_run", run_id = %ctx.run_id, merchant = %ctx.merchant_id);
        async {
            let mut report = IngestReport {
                scraped: records.len(),
                ..IngestReport::default()
            };

            let candidates = self.validate(records, &mut report);
            let (matched, unmatched) = self.match_existing(ctx, candidates, &mut report).await;
            report.matched = matched.len();
            self.update_existing(matched, &mut report).await;
            self.create_new(ctx, unmatched, report).await
        }
        .instrument(span)
        .await
    }

    fn validate(&self, records: Vec<ScrapedRecord>, report: &mut IngestReport) -> Vec<Candidate> {
        let mut seen_urls = HashSet::new();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let Some(volume) = parse_volume(&record.volume) else {
                debug!(error = %rejection(&record, "no parseable volume"), "record rejected");
                report.rejected_no_volume += 1;
                continue;
            };
            if !record.current_price.is_finite() || record.current_price <= 0.0 {
                debug!(error = %rejection(&record, "missing price"), "record rejected");
                report.rejected_invalid_price += 1;
                continue;
            }
            if !seen_urls.insert(record.product_url.clone()) {
                report.duplicates += 1;
                continue;
            }
            out.push(Candidate { record, volume });
        }
        out
    }

    async fn match_existing(
        &self,
        ctx: &mut IngestionContext,
        candidates: Vec<Candidate>,
        report: &mut IngestReport,
    ) -> (Vec<Matched>, Vec<Candidate>) {
        let mut matched = Vec::new();
        let mut unmatched = Vec::new();
        for candidate in candidates {
            match self.find_match(ctx, &candidate).await {
                Ok(Some((product, deal))) => matched.push(Matched {
                    candidate,
                    product,
                    deal,
                }),
                Ok(None) => unmatched.push(candidate),
                Err(IngestError::MatchAmbiguity {
                    product_id,
                    existing,
                    observed,
                }) => {
                    warn!(
                        %product_id,
                        existing = %existing,
                        observed = %observed,
                        url = %candidate.record.product_url,
                        "name and brand match with a different volume; treating as a new product"
                    );
                    report.ambiguous_matches += 1;
                    unmatched.push(candidate);
                }
                Err(err) => {
                    warn!(url = %candidate.record.product_url, error = %err, "match lookup failed");
                    report.push_error(&err);
                }
            }
        }
        (matched, unmatched)
    }

    /// URL first; the name+brand fallback matches the first candidate whose
    /// deal volume is the same size. An ambiguity is reported only when every
    /// candidate differs in size.
    async fn find_match(
        &self,
        ctx: &mut IngestionContext,
        candidate: &Candidate,
    ) -> Result<Option<(Product, Deal)>, IngestError> {
        let record = &candidate.record;
        let persistence = |source| IngestError::Persistence {
            product_url: record.product_url.clone(),
            source,
        };

        if let Some(product) = self
            .store
            .find_product_by_url(&record.product_url)
            .await
            .map_err(persistence)?
        {
            return match self.store.find_deal_for_product(product.id).await.map_err(persistence)? {
                Some(deal) => Ok(Some((product, deal))),
                None => Err(persistence(StoreError::NotFound {
                    entity: "deal",
                    key: product.id.to_string(),
                })),
            };
        }

        let brand_id = ctx
            .brands
            .find_existing(self.store.as_ref(), &record.brand)
            .await
            .map_err(persistence)?;
        // A named brand the store has never seen cannot own an existing product.
        if brand_id.is_none() && brand::normalize(&record.brand).is_some() {
            return Ok(None);
        }
        let normalized = normalize_product_name(&record.name);
        let products = self
            .store
            .find_products_by_name_and_brand(&normalized, brand_id)
            .await
            .map_err(persistence)?;

        let mut mismatch = None;
        for product in products {
            let Some(deal) =
                self.store.find_deal_for_product(product.id).await.map_err(persistence)?
            else {
                continue;
            };
            let Some(variant) =
                self.store.find_variant(deal.variant_id).await.map_err(persistence)?
            else {
                continue;
            };
            if variant.volume().same_size(&candidate.volume) {
                return Ok(Some((product, deal)));
            }
            mismatch.get_or_insert((product.id, variant.volume()));
        }
        match mismatch {
            Some((product_id, existing)) => Err(IngestError::MatchAmbiguity {
                product_id,
                existing,
                observed: candidate.volume,
            }),
            None => Ok(None),
        }
    }

    async fn update_existing(&self, matched: Vec<Matched>, report: &mut IngestReport) {
        let batch_size = self.config.update_batch_size.max(1);
        for chunk in matched.chunks(batch_size) {
            let outcomes = join_all(chunk.iter().map(|m| self.update_one(m))).await;
            for (item, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(outcome) => {
                        report.updated += usize::from(outcome.updated);
                        report.expired += usize::from(outcome.expired);
                        report.price_changed += usize::from(outcome.price_changed);
                    }
                    Err(source) => {
                        let err = IngestError::Persistence {
                            product_url: item.candidate.record.product_url.clone(),
                            source,
                        };
                        warn!(error = %err, "update failed");
                        report.push_error(&err);
                    }
                }
            }
        }
    }

    async fn update_one(&self, matched: &Matched) -> Result<UpdateOutcome, StoreError> {
        let Matched {
            candidate,
            product,
            deal,
        } = matched;
        let record = &candidate.record;
        let mut outcome = UpdateOutcome::default();

        self.store
            .update_product_metadata(product.id, &record.product_url, record.image_url.as_deref())
            .await?;
        let variant = self
            .store
            .find_or_create_variant(
                product.id,
                candidate.volume,
                &record.volume,
                record.external_code.as_deref(),
            )
            .await?;

        if record.discount_percent >= self.config.min_discount_percent {
            let ppu = price_per_unit(record.current_price, &record.volume).map(|u| u.price_per_unit);
            let scored = scoring::score(&ScoreInput {
                discount_percent: record.discount_percent,
                brand_tier: deal.brand_tier,
                price_per_unit: ppu,
                category_slug: product.category_slug.as_deref(),
                subcategory_slug: product.subcategory_slug.as_deref(),
                name: &record.name,
                is_trending: deal.is_trending,
                is_hot: deal.is_hot,
                votes: deal.votes,
            });
            self.store
                .update_deal(
                    deal.id,
                    &DealUpdate {
                        variant_id: variant.id,
                        title: record.name.clone(),
                        deal_price: record.current_price,
                        original_price: record.original_price,
                        discount_percent: record.discount_percent,
                        discount_amount: discount_amount(record),
                        score: scored.score,
                        tags: scored.tag_string(),
                    },
                )
                .await?;
            outcome.updated = true;
        } else if !deal.is_expired {
            self.store.mark_deal_expired(deal.id).await?;
            outcome.expired = true;
        }

        outcome.price_changed = self
            .store
            .append_price_history_if_changed(product.id, record.current_price)
            .await?;
        Ok(outcome)
    }

    async fn create_new(
        &self,
        ctx: &mut IngestionContext,
        unmatched: Vec<Candidate>,
        mut report: IngestReport,
    ) -> Result<IngestReport, IngestError> {
        let (eligible, below): (Vec<_>, Vec<_>) = unmatched
            .into_iter()
            .partition(|c| c.record.discount_percent >= self.config.min_discount_percent);
        report.skipped_low_discount += below.len();

        let mut queue = ClassificationQueue::new(
            eligible,
            self.config.classifier_batch_size,
            self.config.classifier_delay,
        );
        info!(batches = queue.len(), "classifying new listings");

        while let Some((batch, result)) = queue.next(self.classifier.as_ref(), &self.taxonomy).await {
            report.classifier_batches += 1;
            let classified = match result {
                BatchResult::Classified(map) => map,
                BatchResult::Failed(source) => {
                    let record_count = batch.candidates.len();
                    warn!(batch_index = batch.index, record_count, error = %source, "classifier batch failed");
                    return Err(IngestError::ClassifierBatch {
                        batch_index: batch.index,
                        record_count,
                        source,
                        report: Box::new(report),
                    });
                }
            };

            for (position, candidate) in batch.candidates.into_iter().enumerate() {
                let Some(classification) = classified.get(&position) else {
                    info!(url = %candidate.record.product_url, "classifier skipped record");
                    report.unclassified += 1;
                    continue;
                };
                match self.create_one(ctx, &candidate, classification).await {
                    Ok(()) => report.created += 1,
                    Err(source) => {
                        let err = IngestError::Persistence {
                            product_url: candidate.record.product_url.clone(),
                            source,
                        };
                        warn!(error = %err, "create failed");
                        report.push_error(&err);
                    }
                }
            }
        }
        Ok(report)
    }

    async fn create_one(
        &self,
        ctx: &mut IngestionContext,
        candidate: &Candidate,
        classification: &Classification,
    ) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        let record = &candidate.record;
        let brand_id = ctx.brands.resolve_or_create(store, &record.brand).await?;
        let brand_name = brand::normalize(&record.brand).unwrap_or_default();
        let slug = ctx
            .unique_slug(
                store,
                &brand::slugify(&format!("{brand_name} {} {}", record.name, candidate.volume)),
            )
            .await?;

        let entry = build_entry(ctx, candidate, classification, brand_id, slug);
        store.create_product_with_deal_and_history(&entry).await?;
        debug!(slug = %entry.product.slug, score = entry.deal.score, "created catalog entry");
        Ok(())
    }
}

fn rejection(record: &ScrapedRecord, reason: &str) -> IngestError {
    IngestError::Validation {
        product_url: record.product_url.clone(),
        reason: reason.to_string(),
    }
}

fn discount_amount(record: &ScrapedRecord) -> f64 {
    (record.original_price - record.current_price).max(0.0)
}

fn build_entry(
    ctx: &IngestionContext,
    candidate: &Candidate,
    classification: &Classification,
    brand_id: Option<Uuid>,
    slug: String,
) -> NewCatalogEntry {
    let record = &candidate.record;
    let now = Utc::now();
    let product_id = Uuid::new_v4();
    let variant_id = Uuid::new_v4();

    let ppu = price_per_unit(record.current_price, &record.volume).map(|u| u.price_per_unit);
    let scored = scoring::score(&ScoreInput {
        discount_percent: record.discount_percent,
        brand_tier: Some(classification.brand_tier),
        price_per_unit: ppu,
        category_slug: Some(classification.category_slug.as_str()),
        subcategory_slug: classification.subcategory_slug.as_deref(),
        name: &record.name,
        ..ScoreInput::default()
    });

    NewCatalogEntry {
        product: Product {
            id: product_id,
            name: record.name.clone(),
            normalized_name: normalize_product_name(&record.name),
            slug,
            brand_id,
            category_slug: Some(classification.category_slug.clone()),
            subcategory_slug: classification.subcategory_slug.clone(),
            subsubcategory_slug: classification.subsubcategory_slug.clone(),
            merchant_id: ctx.merchant_id.clone(),
            product_url: record.product_url.clone(),
            image_url: record.image_url.clone(),
            created_at: now,
            updated_at: now,
        },
        variant: Variant {
            id: variant_id,
            product_id,
            volume_value: candidate.volume.value,
            volume_unit: candidate.volume.unit,
            raw_volume: record.volume.clone(),
            external_code: record.external_code.clone(),
        },
        deal: Deal {
            id: Uuid::new_v4(),
            product_id,
            variant_id,
            merchant_id: ctx.merchant_id.clone(),
            title: record.name.clone(),
            refined_title: Some(classification.refined_title.clone())
                .filter(|t| !t.trim().is_empty()),
            deal_price: record.current_price,
            original_price: record.original_price,
            discount_percent: record.discount_percent,
            discount_amount: discount_amount(record),
            score: scored.score,
            tags: scored.tag_string(),
            brand_tier: Some(classification.brand_tier),
            is_hot: false,
            is_trending: false,
            is_expired: false,
            votes: 0,
            views: 0,
            created_at: now,
            updated_at: now,
        },
        initial_price: PriceHistoryEntry {
            id: Uuid::new_v4(),
            product_id,
            price: record.current_price,
            recorded_at: now,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str) -> Candidate {
        Candidate {
            record: ScrapedRecord {
                name: name.to_string(),
                brand: String::new(),
                product_url: format!("https://example.test/{name}"),
                external_code: None,
                current_price: 10.0,
                original_price: 20.0,
                discount_percent: 50.0,
                image_url: None,
                volume: "50 ml".to_string(),
                category: String::new(),
                rating: None,
                review_count: None,
            },
            volume: parse_volume("50 ml").unwrap(),
        }
    }

    #[test]
    fn queue_splits_into_fixed_batches_in_order() {
        let candidates: Vec<_> = (0..120).map(|i| candidate(&format!("p{i}"))).collect();
        let queue = ClassificationQueue::new(candidates, 50, Duration::ZERO);
        let sizes: Vec<_> = queue.pending.iter().map(|b| b.candidates.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        let indexes: Vec<_> = queue.pending.iter().map(|b| b.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(queue.pending[1].candidates[0].record.name, "p50");
    }

    #[test]
    fn oversized_batch_setting_is_capped() {
        let candidates: Vec<_> = (0..60).map(|i| candidate(&format!("p{i}"))).collect();
        let queue = ClassificationQueue::new(candidates, 500, Duration::ZERO);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn discount_amount_never_negative() {
        let mut c = candidate("x");
        assert_eq!(discount_amount(&c.record), 10.0);
        c.record.original_price = 5.0;
        assert_eq!(discount_amount(&c.record), 0.0);
    }

    #[test]
    fn record_errors_keep_url_and_kind() {
        let err = IngestError::Persistence {
            product_url: "https://example.test/a".into(),
            source: StoreError::Message("boom".into()),
        };
        let record = RecordError::from(&err);
        assert_eq!(record.kind, RecordErrorKind::Persistence);
        assert_eq!(record.product_url, "https://example.test/a");
        assert!(record.message.contains("boom"));
    }
}

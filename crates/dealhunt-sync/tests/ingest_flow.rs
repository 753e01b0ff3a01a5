use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealhunt_adapters::{
    BatchResult, Classification, ClassificationInput, Classifier, ClassifierError, Taxonomy,
};
use dealhunt_core::{BrandTier, ScrapedRecord};
use dealhunt_storage::{MemoryStore, Store};
use dealhunt_sync::{IngestConfig, IngestError, IngestionContext, Ingestor};
use uuid::Uuid;

/// Classifies everything as women's perfume, optionally failing one call.
struct ScriptedClassifier {
    fail_on_call: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail_on_call: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing_on(call: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_on_call: Some(call),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify_batch(&self, inputs: &[ClassificationInput], _taxonomy: &Taxonomy) -> BatchResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call) {
            return BatchResult::Failed(ClassifierError::Message("classifier offline".into()));
        }
        BatchResult::Classified(
            inputs
                .iter()
                .enumerate()
                .map(|(i, input)| {
                    (
                        i,
                        Classification {
                            category_slug: "parfum".into(),
                            subcategory_slug: Some("parfum-femme".into()),
                            subsubcategory_slug: None,
                            brand_tier: BrandTier::Luxury,
                            refined_title: input.name.clone(),
                        },
                    )
                })
                .collect(),
        )
    }
}

fn record(name: &str, brand: &str, url: &str, price: f64, volume: &str) -> ScrapedRecord {
    let original_price = 100.0;
    ScrapedRecord {
        name: name.into(),
        brand: brand.into(),
        product_url: url.into(),
        external_code: None,
        current_price: price,
        original_price,
        discount_percent: ((original_price - price) / original_price * 100.0).round(),
        image_url: None,
        volume: volume.into(),
        category: "Parfum".into(),
        rating: None,
        review_count: None,
    }
}

fn ingestor(store: &Arc<MemoryStore>, classifier: Arc<ScriptedClassifier>) -> Ingestor {
    Ingestor::new(
        store.clone(),
        classifier,
        Arc::new(Taxonomy::default()),
        IngestConfig {
            classifier_delay: Duration::ZERO,
            ..IngestConfig::default()
        },
    )
}

fn ctx() -> IngestionContext {
    IngestionContext::new(Uuid::new_v4(), "nocibe")
}

fn two_records() -> Vec<ScrapedRecord> {
    vec![
        record("Libre Eau de Parfum", "YSL", "https://www.nocibe.fr/p/libre-1", 79.0, "50 ml"),
        record("Idôle Eau de Parfum", "LANCOME", "https://www.nocibe.fr/p/idole-2", 60.0, "75ml"),
    ]
}

#[tokio::test]
async fn rerunning_unchanged_records_writes_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());

    let first = ingestor.ingest(&mut ctx(), two_records()).await.unwrap();
    assert_eq!(first.created, 2);
    assert_eq!(store.price_history_count(), 2);

    let second = ingestor.ingest(&mut ctx(), two_records()).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.matched, 2);
    assert_eq!(second.updated, 2);
    assert_eq!(second.price_changed, 0);
    assert_eq!(store.product_count(), 2);
    assert_eq!(store.deal_count(), 2);
    assert_eq!(store.variant_count(), 2);
    assert_eq!(store.price_history_count(), 2);
}

#[tokio::test]
async fn price_change_appends_exactly_one_history_row() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());
    ingestor.ingest(&mut ctx(), two_records()).await.unwrap();

    let mut changed = two_records();
    changed[0] = record("Libre Eau de Parfum", "YSL", "https://www.nocibe.fr/p/libre-1", 69.0, "50 ml");
    let report = ingestor.ingest(&mut ctx(), changed).await.unwrap();

    assert_eq!(report.price_changed, 1);
    assert_eq!(store.price_history_count(), 3);
    let product = store
        .find_product_by_url("https://www.nocibe.fr/p/libre-1")
        .await
        .unwrap()
        .unwrap();
    let history = store.price_history(product.id);
    assert_eq!(history.len(), 2);
    let deal = store.find_deal_for_product(product.id).await.unwrap().unwrap();
    assert_eq!(deal.deal_price, 69.0);
    assert_eq!(deal.discount_percent, 31.0);
}

#[tokio::test]
async fn records_without_volume_or_price_never_reach_the_classifier() {
    let store = Arc::new(MemoryStore::new());
    let classifier = ScriptedClassifier::ok();
    let ingestor = ingestor(&store, classifier.clone());

    let records = vec![
        record("Coffret Découverte", "Nuxe", "https://www.nocibe.fr/p/a", 20.0, ""),
        record("Palette", "NARS", "https://www.nocibe.fr/p/b", 20.0, "Édition limitée"),
        record("Huile", "Nuxe", "https://www.nocibe.fr/p/c", 0.0, "100 ml"),
    ];
    let report = ingestor.ingest(&mut ctx(), records).await.unwrap();

    assert_eq!(report.rejected_no_volume, 2);
    assert_eq!(report.rejected_invalid_price, 1);
    assert_eq!(report.created, 0);
    assert_eq!(classifier.calls(), 0);
    assert_eq!(store.product_count(), 0);
}

#[tokio::test]
async fn classifier_outage_fails_its_batch_and_keeps_earlier_batches() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::failing_on(1));

    let records: Vec<_> = (0..60)
        .map(|i| {
            record(
                &format!("Eau de Toilette {i}"),
                "Dior",
                &format!("https://www.nocibe.fr/p/edt-{i}"),
                50.0,
                "100 ml",
            )
        })
        .collect();
    let err = ingestor.ingest(&mut ctx(), records).await.unwrap_err();

    match err {
        IngestError::ClassifierBatch {
            batch_index,
            record_count,
            report,
            ..
        } => {
            assert_eq!(batch_index, 1);
            assert_eq!(record_count, 10);
            assert_eq!(report.created, 50);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.product_count(), 50);
    assert_eq!(store.deal_count(), 50);
}

#[tokio::test]
async fn write_failure_is_reported_without_touching_siblings() {
    let store = Arc::new(MemoryStore::new());
    store.inject_create_failure("https://www.nocibe.fr/p/idole-2");
    let ingestor = ingestor(&store, ScriptedClassifier::ok());

    let mut records = two_records();
    records.push(record("Sauvage", "Dior", "https://www.nocibe.fr/p/sauvage-3", 70.0, "100 ml"));
    let report = ingestor.ingest(&mut ctx(), records).await.unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].product_url, "https://www.nocibe.fr/p/idole-2");
    assert_eq!(store.product_count(), 2);
    assert_eq!(store.deal_count(), 2);
    assert_eq!(store.variant_count(), 2);
    assert_eq!(store.price_history_count(), 2);
}

#[tokio::test]
async fn same_name_and_brand_with_other_volume_is_a_new_product() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());
    ingestor.ingest(&mut ctx(), two_records()).await.unwrap();

    let bigger = vec![record(
        "Libre Eau de Parfum",
        "Yves Saint Laurent",
        "https://www.nocibe.fr/p/libre-90ml",
        99.0,
        "90 ml",
    )];
    let report = ingestor.ingest(&mut ctx(), bigger).await.unwrap();

    assert_eq!(report.ambiguous_matches, 1);
    assert_eq!(report.matched, 0);
    assert_eq!(report.created, 1);
    assert_eq!(store.product_count(), 3);
    let first = store
        .find_product_by_url("https://www.nocibe.fr/p/libre-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.price_history(first.id).len(), 1);
}

#[tokio::test]
async fn moved_url_with_same_volume_updates_the_existing_product() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());
    ingestor.ingest(&mut ctx(), two_records()).await.unwrap();

    let moved = vec![record(
        "Libre  eau de parfum",
        "Saint Laurent Paris",
        "https://www.nocibe.fr/fr/p/libre-new-url",
        79.0,
        "5 cl",
    )];
    let report = ingestor.ingest(&mut ctx(), moved).await.unwrap();

    assert_eq!(report.matched, 1);
    assert_eq!(report.created, 0);
    assert_eq!(store.product_count(), 2);
    assert!(store
        .find_product_by_url("https://www.nocibe.fr/fr/p/libre-new-url")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn moved_url_picks_the_same_size_among_several_pack_sizes() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());
    let sizes = vec![
        record("Libre Eau de Parfum", "YSL", "https://www.nocibe.fr/p/libre-50", 79.0, "50 ml"),
        record("Libre Eau de Parfum", "YSL", "https://www.nocibe.fr/p/libre-90", 99.0, "90 ml"),
    ];
    assert_eq!(ingestor.ingest(&mut ctx(), sizes).await.unwrap().created, 2);

    let moved = vec![record(
        "Libre Eau de Parfum",
        "YSL",
        "https://www.nocibe.fr/fr/p/libre-90-new",
        89.0,
        "90 ml",
    )];
    let report = ingestor.ingest(&mut ctx(), moved).await.unwrap();

    assert_eq!(report.matched, 1);
    assert_eq!(report.ambiguous_matches, 0);
    assert_eq!(report.created, 0);
    assert_eq!(report.price_changed, 1);
    assert_eq!(store.product_count(), 2);
    let ninety = store
        .find_product_by_url("https://www.nocibe.fr/fr/p/libre-90-new")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.price_history(ninety.id).len(), 2);
    let fifty = store
        .find_product_by_url("https://www.nocibe.fr/p/libre-50")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.price_history(fifty.id).len(), 1);
}

#[tokio::test]
async fn unknown_brand_never_matches_an_unbranded_product() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());
    let unbranded = vec![record(
        "Huile Prodigieuse",
        "",
        "https://www.nocibe.fr/p/huile-1",
        30.0,
        "100 ml",
    )];
    ingestor.ingest(&mut ctx(), unbranded).await.unwrap();

    let branded = vec![record(
        "Huile Prodigieuse",
        "Nuxe",
        "https://www.nocibe.fr/p/huile-nuxe",
        30.0,
        "100 ml",
    )];
    let report = ingestor.ingest(&mut ctx(), branded).await.unwrap();

    assert_eq!(report.matched, 0);
    assert_eq!(report.created, 1);
    assert_eq!(store.product_count(), 2);
    assert_eq!(store.brands().len(), 1);
    let unbranded = store
        .find_product_by_url("https://www.nocibe.fr/p/huile-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unbranded.brand_id, None);
}

#[tokio::test]
async fn low_discount_expires_known_deals_and_skips_new_ones() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());
    ingestor.ingest(&mut ctx(), two_records()).await.unwrap();

    let records = vec![
        record("Libre Eau de Parfum", "YSL", "https://www.nocibe.fr/p/libre-1", 98.0, "50 ml"),
        record("Crème Mains", "Nuxe", "https://www.nocibe.fr/p/creme-4", 97.0, "50 ml"),
    ];
    let report = ingestor.ingest(&mut ctx(), records).await.unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped_low_discount, 1);
    assert_eq!(report.created, 0);
    assert_eq!(report.price_changed, 1);
    let product = store
        .find_product_by_url("https://www.nocibe.fr/p/libre-1")
        .await
        .unwrap()
        .unwrap();
    let deal = store.find_deal_for_product(product.id).await.unwrap().unwrap();
    assert!(deal.is_expired);
    assert_eq!(store.deal_count(), 2);
}

#[tokio::test]
async fn brand_spellings_collapse_to_one_brand_and_slugs_stay_unique() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = ingestor(&store, ScriptedClassifier::ok());

    let records = vec![
        record("Libre", "YSL", "https://www.nocibe.fr/p/libre-a", 79.0, "50 ml"),
        record("Libre", "Yves St Laurent", "https://www.nocibe.fr/p/libre-b", 79.0, "50 ml"),
    ];
    let report = ingestor.ingest(&mut ctx(), records).await.unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(store.brands().len(), 1);
    let mut slugs: Vec<_> = store.products().into_iter().map(|p| p.slug).collect();
    slugs.sort();
    assert_eq!(
        slugs,
        vec![
            "yves-saint-laurent-libre-50-ml".to_string(),
            "yves-saint-laurent-libre-50-ml-2".to_string(),
        ]
    );
    let deal = &store.deals()[0];
    assert_eq!(deal.brand_tier, Some(BrandTier::Luxury));
    assert!(deal.tags.contains("luxury"));
}

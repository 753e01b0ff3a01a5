//! Per-run report files and Parquet snapshots under `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use dealhunt_adapters::Retailer;
use dealhunt_storage::DealListing;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::ingest::{IngestReport, RecordError};

/// Errors listed individually in the markdown and JSON reports.
pub const MAX_REPORTED_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub database_url: String,
}

/// Scrape and ingest results for one retailer in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetailerRun {
    pub retailer: Retailer,
    pub merchant_id: String,
    pub scrape_errors: Vec<String>,
    pub report: IngestReport,
    /// Set when the retailer's ingestion stopped early.
    pub fatal: Option<String>,
}

impl RetailerRun {
    pub fn new(retailer: Retailer, merchant_id: impl Into<String>) -> Self {
        Self {
            retailer,
            merchant_id: merchant_id.into(),
            scrape_errors: Vec::new(),
            report: IngestReport::default(),
            fatal: None,
        }
    }

    pub fn error_count(&self) -> usize {
        self.scrape_errors.len() + self.report.errors.len() + usize::from(self.fatal.is_some())
    }

    fn error_rows(&self) -> Vec<ErrorRow> {
        let retailer = self.retailer.as_str().to_string();
        let mut rows = Vec::with_capacity(self.error_count());
        if let Some(fatal) = &self.fatal {
            rows.push(ErrorRow {
                retailer: retailer.clone(),
                kind: "fatal".into(),
                product_url: None,
                message: fatal.clone(),
            });
        }
        rows.extend(self.scrape_errors.iter().map(|message| ErrorRow {
            retailer: retailer.clone(),
            kind: "scrape".into(),
            product_url: None,
            message: message.clone(),
        }));
        rows.extend(self.report.errors.iter().map(|e: &RecordError| ErrorRow {
            retailer: retailer.clone(),
            kind: e.kind.as_str().to_string(),
            product_url: Some(e.product_url.clone()),
            message: e.message.clone(),
        }));
        rows
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRow {
    pub retailer: String,
    pub kind: String,
    pub product_url: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub scraped: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub matched: usize,
    pub ambiguous_matches: usize,
    pub updated: usize,
    pub expired: usize,
    pub price_changed: usize,
    pub skipped_low_discount: usize,
    pub unclassified: usize,
    pub created: usize,
    pub errors: usize,
}

impl RunCounts {
    fn add(&mut self, run: &RetailerRun) {
        let r = &run.report;
        self.scraped += r.scraped;
        self.rejected += r.rejected();
        self.duplicates += r.duplicates;
        self.matched += r.matched;
        self.ambiguous_matches += r.ambiguous_matches;
        self.updated += r.updated;
        self.expired += r.expired;
        self.price_changed += r.price_changed;
        self.skipped_low_discount += r.skipped_low_discount;
        self.unclassified += r.unclassified;
        self.created += r.created;
        self.errors += run.error_count();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestDelta {
    pub run: RunRecord,
    pub totals: RunCounts,
    pub retailers: Vec<RetailerDelta>,
    pub errors: Vec<ErrorRow>,
    pub errors_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetailerDelta {
    pub retailer: Retailer,
    pub merchant_id: String,
    pub counts: RunCounts,
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn build_delta(record: &RunRecord, runs: &[RetailerRun]) -> IngestDelta {
    let mut totals = RunCounts::default();
    let mut retailers = Vec::with_capacity(runs.len());
    for run in runs {
        totals.add(run);
        let mut counts = RunCounts::default();
        counts.add(run);
        retailers.push(RetailerDelta {
            retailer: run.retailer,
            merchant_id: run.merchant_id.clone(),
            counts,
            fatal: run.fatal.clone(),
        });
    }
    let all_errors: Vec<ErrorRow> = runs.iter().flat_map(RetailerRun::error_rows).collect();
    IngestDelta {
        run: record.clone(),
        totals,
        retailers,
        errors_total: all_errors.len(),
        errors: all_errors.into_iter().take(MAX_REPORTED_ERRORS).collect(),
    }
}

fn summary_markdown(delta: &IngestDelta) -> String {
    let t = &delta.totals;
    let mut lines = vec![
        "# Dealhunt Run Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", delta.run.run_id),
        format!("- Started: {}", delta.run.started_at),
        format!("- Finished: {}", delta.run.finished_at),
        format!("- Status: {}", delta.run.status),
        String::new(),
        "## Totals".to_string(),
        format!("- scraped: {}", t.scraped),
        format!("- rejected: {}", t.rejected),
        format!("- matched: {}", t.matched),
        format!("- updated: {}", t.updated),
        format!("- expired: {}", t.expired),
        format!("- price changed: {}", t.price_changed),
        format!("- created: {}", t.created),
        format!("- skipped (low discount): {}", t.skipped_low_discount),
        format!("- errors: {}", t.errors),
        String::new(),
        "## Retailers".to_string(),
    ];
    for r in &delta.retailers {
        let mut line = format!(
            "- {}: scraped {}, created {}, updated {}, price changed {}, errors {}",
            r.retailer.display_name(),
            r.counts.scraped,
            r.counts.created,
            r.counts.updated,
            r.counts.price_changed,
            r.counts.errors
        );
        if let Some(fatal) = &r.fatal {
            line.push_str(&format!(" (aborted: {fatal})"));
        }
        lines.push(line);
    }
    if !delta.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        for e in &delta.errors {
            match &e.product_url {
                Some(url) => lines.push(format!("- [{}/{}] {url}: {}", e.retailer, e.kind, e.message)),
                None => lines.push(format!("- [{}/{}] {}", e.retailer, e.kind, e.message)),
            }
        }
        if delta.errors_total > delta.errors.len() {
            lines.push(format!("- ... and {} more", delta.errors_total - delta.errors.len()));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn write_reports(reports_dir: &Path, record: &RunRecord, runs: &[RetailerRun]) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let delta = build_delta(record, runs);
    fs::write(reports_dir.join("run_summary.md"), summary_markdown(&delta))
        .await
        .context("writing run_summary.md")?;

    let delta_json = serde_json::to_vec_pretty(&delta).context("serializing ingest delta")?;
    fs::write(reports_dir.join("ingest_delta.json"), delta_json)
        .await
        .context("writing ingest_delta.json")?;
    Ok(())
}

pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    deals: &[DealListing],
    runs: &[RetailerRun],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let deals_path = snapshot_dir.join("deals.parquet");
    let errors_path = snapshot_dir.join("errors.parquet");
    write_deals_parquet(&deals_path, deals)?;
    let error_rows: Vec<ErrorRow> = runs.iter().flat_map(RetailerRun::error_rows).collect();
    write_errors_parquet(&errors_path, &error_rows)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("deals", reports_dir, &deals_path)?,
            manifest_entry("errors", reports_dir, &errors_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_deals_parquet(path: &Path, deals: &[DealListing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("deal_id", DataType::Utf8, false),
        ArrowField::new("merchant_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("brand", DataType::Utf8, true),
        ArrowField::new("volume", DataType::Utf8, false),
        ArrowField::new("deal_price", DataType::Float64, false),
        ArrowField::new("original_price", DataType::Float64, false),
        ArrowField::new("discount_percent", DataType::Float64, false),
        ArrowField::new("score", DataType::UInt32, false),
        ArrowField::new("brand_tier", DataType::UInt32, true),
        ArrowField::new("tags", DataType::Utf8, false),
        ArrowField::new("updated_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(deals.iter().map(|d| Some(d.deal.id.to_string())).collect::<Vec<_>>());
    let merchants = StringArray::from(
        deals
            .iter()
            .map(|d| Some(d.deal.merchant_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(deals.iter().map(|d| Some(d.deal.title.as_str())).collect::<Vec<_>>());
    let brands = StringArray::from(deals.iter().map(|d| d.brand_name.as_deref()).collect::<Vec<_>>());
    let volumes = StringArray::from(
        deals
            .iter()
            .map(|d| Some(d.variant.volume().to_string()))
            .collect::<Vec<_>>(),
    );
    let deal_prices = Float64Array::from(deals.iter().map(|d| d.deal.deal_price).collect::<Vec<_>>());
    let original_prices =
        Float64Array::from(deals.iter().map(|d| d.deal.original_price).collect::<Vec<_>>());
    let discounts = Float64Array::from(deals.iter().map(|d| d.deal.discount_percent).collect::<Vec<_>>());
    let scores = UInt32Array::from(deals.iter().map(|d| u32::from(d.deal.score)).collect::<Vec<_>>());
    let tiers = UInt32Array::from(
        deals
            .iter()
            .map(|d| d.deal.brand_tier.map(|t| u32::from(t.rank())))
            .collect::<Vec<_>>(),
    );
    let tags = StringArray::from(deals.iter().map(|d| Some(d.deal.tags.as_str())).collect::<Vec<_>>());
    let updated = StringArray::from(
        deals
            .iter()
            .map(|d| Some(d.deal.updated_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(merchants),
            Arc::new(titles),
            Arc::new(brands),
            Arc::new(volumes),
            Arc::new(deal_prices),
            Arc::new(original_prices),
            Arc::new(discounts),
            Arc::new(scores),
            Arc::new(tiers),
            Arc::new(tags),
            Arc::new(updated),
        ],
    )
    .context("building deals record batch")?;
    write_parquet(path, batch)
}

fn write_errors_parquet(path: &Path, rows: &[ErrorRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("retailer", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("product_url", DataType::Utf8, true),
        ArrowField::new("message", DataType::Utf8, false),
    ]));
    let retailers = StringArray::from(rows.iter().map(|r| Some(r.retailer.as_str())).collect::<Vec<_>>());
    let kinds = StringArray::from(rows.iter().map(|r| Some(r.kind.as_str())).collect::<Vec<_>>());
    let urls = StringArray::from(rows.iter().map(|r| r.product_url.as_deref()).collect::<Vec<_>>());
    let messages = StringArray::from(rows.iter().map(|r| Some(r.message.as_str())).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(retailers),
            Arc::new(kinds),
            Arc::new(urls),
            Arc::new(messages),
        ],
    )
    .context("building errors record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the `runs` most recent run directories.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Dealhunt Report".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join("ingest_delta.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: IngestDelta = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let t = &delta.totals;

        lines.push(format!("## Run `{run_id}` ({})", delta.run.status));
        lines.push(format!("- finished: {}", delta.run.finished_at));
        lines.push(format!(
            "- scraped {} / matched {} / created {} / updated {} / price changed {} / errors {}",
            t.scraped, t.matched, t.created, t.updated, t.price_changed, t.errors
        ));
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RecordErrorKind;

    fn run_with_errors(n: usize) -> RetailerRun {
        let mut run = RetailerRun::new(Retailer::Nocibe, "nocibe");
        run.report.scraped = n + 3;
        run.report.created = 3;
        run.report.errors = (0..n)
            .map(|i| RecordError {
                product_url: format!("https://www.nocibe.fr/p/x-{i}"),
                kind: RecordErrorKind::Persistence,
                message: "database error".into(),
            })
            .collect();
        run.scrape_errors.push("page 2 timed out".into());
        run
    }

    fn record() -> RunRecord {
        RunRecord {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: "completed".into(),
            database_url: "memory".into(),
        }
    }

    #[test]
    fn delta_caps_itemised_errors_but_counts_all() {
        let delta = build_delta(&record(), &[run_with_errors(70)]);
        assert_eq!(delta.errors.len(), MAX_REPORTED_ERRORS);
        assert_eq!(delta.errors_total, 71);
        assert_eq!(delta.totals.errors, 71);
        assert_eq!(delta.errors[1].kind, "persistence");
        let md = summary_markdown(&delta);
        assert!(md.contains("... and 21 more"));
    }

    #[tokio::test]
    async fn reports_and_snapshots_land_in_run_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let record = record();
        let reports_dir = tmp.path().join("reports").join(record.run_id.to_string());
        let runs = vec![run_with_errors(2)];

        write_reports(&reports_dir, &record, &runs).await.unwrap();
        let manifest = export_parquet_snapshots(&reports_dir, &[], &runs).await.unwrap();

        assert!(reports_dir.join("run_summary.md").exists());
        assert!(reports_dir.join("snapshots/deals.parquet").exists());
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manifest).unwrap()).unwrap();
        assert_eq!(manifest["files"].as_array().unwrap().len(), 2);
        assert_eq!(manifest["files"][1]["path"], "snapshots/errors.parquet");

        let digest = report_daily_markdown(5, Some(tmp.path().to_path_buf())).unwrap();
        assert!(digest.contains(&record.run_id.to_string()));
        assert!(digest.contains("created 3"));
    }
}

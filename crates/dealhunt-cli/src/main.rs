use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dealhunt_core::BrandTier;
use dealhunt_storage::{MemoryStore, Store};
use dealhunt_sync::{
    build_competitor_job, connect_store, ensure_workspace_dirs, near_duplicates, report_daily_markdown,
    score, CompetitorConfig, ScoreInput, SyncConfig, SyncPipeline, SyncRunSummary,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealhunt-cli")]
#[command(about = "Dealhunt command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every enabled source once, or keep running on the cron schedule.
    Sync {
        /// Keep the catalog in memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    Migrate,
    /// Look up competitor prices for the most recently updated deals.
    Competitors {
        #[arg(long, default_value_t = 25)]
        limit: usize,
        #[arg(long, default_value_t = 900)]
        deadline_secs: u64,
    },
    /// List brands whose names are suspiciously close.
    BrandAudit,
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
    /// Score a hypothetical deal and print the breakdown as JSON.
    Score {
        #[arg(long)]
        discount: f64,
        /// 1 = luxury, 2 = premium, 3 = mass.
        #[arg(long)]
        tier: Option<u8>,
        #[arg(long)]
        ppu: Option<f64>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        subcategory: Option<String>,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value_t = 0)]
        votes: i32,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} sources={} scraped={} created={} updated={} errors={} reports={}",
        summary.run_id,
        summary.enabled_sources,
        summary.scraped,
        summary.created,
        summary.updated,
        summary.errors,
        summary.reports_dir
    );
    if !summary.failed_sources.is_empty() {
        println!("failed sources: {}", summary.failed_sources.join(", "));
    }
}

async fn sync(memory: bool) -> Result<()> {
    let config = SyncConfig::from_env();
    ensure_workspace_dirs(&config).await?;
    let store: Arc<dyn Store> = if memory {
        info!("using in-memory catalog");
        Arc::new(MemoryStore::new())
    } else {
        let store: Arc<dyn Store> = connect_store(&config).await?;
        store
    };
    let classifier = Arc::new(config.classifier()?);
    let pipeline = Arc::new(SyncPipeline::new(config, store, classifier)?);

    match pipeline.maybe_build_scheduler().await? {
        Some(mut sched) => {
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        None => print_summary(&pipeline.run_once().await?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing("info,dealhunt=debug")?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { memory: false }) {
        Commands::Sync { memory } => sync(memory).await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            connect_store(&config).await?.migrate().await?;
            println!("migrations applied to {}", config.redacted_database_url());
        }
        Commands::Competitors {
            limit,
            deadline_secs,
        } => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            let job = build_competitor_job(
                &config,
                store,
                CompetitorConfig {
                    max_deals: limit,
                    deadline: Duration::from_secs(deadline_secs),
                    ..CompetitorConfig::default()
                },
            )?;
            let report = job.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::BrandAudit => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            let brands = store.list_brands().await?;
            let pairs = near_duplicates(&brands);
            if pairs.is_empty() {
                println!("no near-duplicate brands among {}", brands.len());
            }
            for pair in pairs {
                println!("{} <-> {} (distance {})", pair.first, pair.second, pair.distance);
            }
        }
        Commands::Report {
            runs,
            workspace_root,
        } => {
            let root = workspace_root.or_else(|| Some(SyncConfig::from_env().workspace_root));
            println!("{}", report_daily_markdown(runs, root)?);
        }
        Commands::Score {
            discount,
            tier,
            ppu,
            category,
            subcategory,
            name,
            votes,
        } => {
            let brand_tier = match tier {
                Some(rank) => match BrandTier::from_rank(rank) {
                    Some(tier) => Some(tier),
                    None => bail!("--tier must be 1, 2 or 3"),
                },
                None => None,
            };
            let result = score(&ScoreInput {
                discount_percent: discount,
                brand_tier,
                price_per_unit: ppu,
                category_slug: category.as_deref(),
                subcategory_slug: subcategory.as_deref(),
                name: &name,
                votes,
                ..ScoreInput::default()
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

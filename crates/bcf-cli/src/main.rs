use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bcf_adapters::parse_override_sheet;
use bcf_core::{JobType, SyncJob, SyncStatus};
use bcf_sync::{PipelineConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "bcf-cli")]
#[command(about = "Bathroom catalog sync and compatibility service")]
struct Cli {
    /// Debug-level logging unless BCF_LOG or RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP api, background sync worker and scheduler.
    Serve,
    /// Incremental sync from a snapshot file or URL, run in the foreground.
    Sync {
        #[arg(long)]
        snapshot: String,
    },
    /// Regenerate every product's edges.
    Recompute,
    /// Catalog, edge and dirty counts.
    Stats,
    /// Most recent sync jobs.
    Jobs {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Re-run a failed job whose queue entry survived a restart.
    Resubmit { job_id: Uuid },
    /// Upsert forced include/exclude rules from an override sheet.
    ImportOverrides { path: PathBuf },
    Migrate,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = std::env::var("BCF_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default.as_str().to_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn pipeline(config: PipelineConfig) -> Result<SyncPipeline> {
    let pool = bcf_sync::open(&config.database_url).await?;
    SyncPipeline::new(config, pool)
}

fn print_job(job: &SyncJob) {
    let c = &job.counts;
    println!(
        "{} {} {} added={} updated={} deleted={} rejected={} recomputed={} edges={} rule_failures={}{}",
        job.id,
        job.job_type,
        job.status,
        c.products_added,
        c.products_updated,
        c.products_deleted,
        c.rows_rejected,
        c.products_recomputed,
        c.edges_written,
        c.rule_failures,
        job.error_message
            .as_deref()
            .map(|e| format!(" error={e}"))
            .unwrap_or_default(),
    );
}

/// Runs an enqueued job in this process and turns a failed job into an error exit.
async fn run_now(pipeline: &SyncPipeline, job: SyncJob) -> Result<()> {
    let done = pipeline.process(job.id).await?;
    print_job(&done);
    if done.status == SyncStatus::Failed {
        bail!(
            "sync job {} failed: {}",
            done.id,
            done.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Serve => bcf_web::serve(config).await?,
        Commands::Sync { snapshot } => {
            let pipeline = pipeline(config).await?;
            let job = pipeline
                .jobs()
                .enqueue(JobType::LocalSnapshot, &snapshot, json!({ "trigger": "cli" }))
                .await?;
            run_now(&pipeline, job).await?;
        }
        Commands::Recompute => {
            let pipeline = pipeline(config).await?;
            let job = pipeline.enqueue_full_recompute("cli").await?;
            run_now(&pipeline, job).await?;
        }
        Commands::Stats => {
            let pipeline = pipeline(config).await?;
            let store = pipeline.store();
            println!("products: {}", store.product_count().await?);
            for (category, n) in store.counts_by_category().await? {
                println!("  {category}: {n}");
            }
            println!("edges: {}", store.edge_count().await?);
            println!("dirty: {}", store.dirty_count().await?);
            if let Some(job) = pipeline.jobs().recent(1).await?.first() {
                print!("last job: ");
                print_job(job);
            }
        }
        Commands::Jobs { limit } => {
            let pipeline = pipeline(config).await?;
            for job in pipeline.jobs().recent(limit.max(1)).await? {
                print_job(&job);
            }
        }
        Commands::Resubmit { job_id } => {
            let pipeline = pipeline(config).await?;
            let job = pipeline.jobs().resubmit(job_id).await?;
            println!("resubmitted {job_id} as {}", job.id);
        }
        Commands::ImportOverrides { path } => {
            let pipeline = pipeline(config).await?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let rules = parse_override_sheet(&bytes, &pipeline.config().layout)
                .with_context(|| format!("parsing {}", path.display()))?;
            let written = pipeline.store().upsert_overrides(&rules).await?;
            println!("imported {written} override rules from {}", path.display());
        }
        Commands::Migrate => {
            bcf_sync::open(&config.database_url).await?;
            println!("migrations applied to {}", config.database_url);
        }
    }

    Ok(())
}

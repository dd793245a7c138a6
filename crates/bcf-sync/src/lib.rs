//! Catalog synchronization: diff, apply, incremental recompute, and the durable job queue
//! that drives them.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod catalog;
pub mod config;
pub mod diff;
pub mod error;
pub mod index;
pub mod jobs;
pub mod overrides;
pub mod pipeline;
pub mod recompute;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use catalog::{ApplyOutcome, CatalogStore, ChunkWrite, MatchReason};
pub use config::{load_category_table, PipelineConfig};
pub use diff::{compute_diff, CatalogDiff, UpdatedProduct};
pub use error::SyncError;
pub use index::ProductIndex;
pub use jobs::{JobController, ORPHAN_MESSAGE};
pub use overrides::{enrich_forced, merge, MergeOrder, MergedEdge};
pub use pipeline::{CompletionHook, NoopCompletionHook, SyncPipeline};
pub use recompute::{RecomputeEngine, RecomputeSummary};
pub use scheduler::maybe_build_scheduler;
pub use state::{CatalogSnapshot, CatalogState};
pub use worker::{SyncWorker, WakeSignal};

pub const CRATE_NAME: &str = "bcf-sync";

/// Opens the catalog database, creating the file if needed.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));
    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running catalog migrations")
}

/// `connect` followed by `migrate`.
pub async fn open(database_url: &str) -> anyhow::Result<SqlitePool> {
    let pool = connect(database_url).await?;
    migrate(&pool).await?;
    Ok(pool)
}

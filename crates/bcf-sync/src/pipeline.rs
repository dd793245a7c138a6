use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bcf_adapters::{parse_snapshot, source_for_payload_ref, DimensionalRules};
use bcf_core::{Category, JobType, Product, ProductId, QueueEntry, RuleEvaluator, SyncCounts, SyncJob};
use bcf_storage::{SnapshotArchive, SnapshotFetcher};
use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};
use sqlx::SqlitePool;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::config::PipelineConfig;
use crate::diff::{compute_diff, CatalogDiff};
use crate::error::SyncError;
use crate::index::ProductIndex;
use crate::jobs::JobController;
use crate::recompute::{RecomputeEngine, RecomputeSummary};
use crate::state::CatalogState;

/// Called after a job reaches `completed` and the new catalog state is published.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_completed(&self, job: &SyncJob);
}

#[derive(Default)]
pub struct NoopCompletionHook;

#[async_trait]
impl CompletionHook for NoopCompletionHook {
    async fn on_completed(&self, _job: &SyncJob) {}
}

/// Result of the work part of a job, before the terminal transition.
struct JobOutput {
    counts: SyncCounts,
    index: ProductIndex,
}

pub struct SyncPipeline {
    config: PipelineConfig,
    store: CatalogStore,
    jobs: JobController,
    engine: RecomputeEngine,
    fetcher: Arc<SnapshotFetcher>,
    archive: SnapshotArchive,
    state: Arc<CatalogState>,
    hooks: Vec<Arc<dyn CompletionHook>>,
}

impl SyncPipeline {
    /// Builds a pipeline with the dimensional rule set and the configured category table.
    pub fn new(config: PipelineConfig, pool: SqlitePool) -> anyhow::Result<Self> {
        let table = config.category_table()?;
        let fetcher = SnapshotFetcher::new(config.fetch_config())
            .context("building snapshot fetcher")?;
        let engine = RecomputeEngine::new(Arc::new(DimensionalRules::default()), table)
            .with_chunk_size(config.recompute_chunk_size)
            .with_max_rule_failure_fraction(config.max_rule_failure_fraction);
        Ok(Self {
            archive: SnapshotArchive::new(config.artifacts_dir.clone())
                .with_retention(config.archive_retention),
            store: CatalogStore::new(pool.clone()),
            jobs: JobController::new(pool),
            engine,
            fetcher: Arc::new(fetcher),
            state: Arc::new(CatalogState::new()),
            hooks: Vec::new(),
            config,
        })
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn RuleEvaluator>) -> Self {
        self.engine = RecomputeEngine::new(evaluator, self.engine.table().clone())
            .with_chunk_size(self.config.recompute_chunk_size)
            .with_max_rule_failure_fraction(self.config.max_rule_failure_fraction);
        self
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn CompletionHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_state(mut self, state: Arc<CatalogState>) -> Self {
        self.state = state;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn jobs(&self) -> &JobController {
        &self.jobs
    }

    pub fn state(&self) -> &Arc<CatalogState> {
        &self.state
    }

    pub async fn enqueue_full_recompute(&self, trigger: &str) -> Result<SyncJob, SyncError> {
        self.jobs
            .enqueue(JobType::FullRecompute, "", json!({ "trigger": trigger }))
            .await
    }

    /// Claims and runs the oldest pending job. `None` when the queue holds no pending work.
    pub async fn run_pending_once(&self) -> Result<Option<SyncJob>, SyncError> {
        while let Some((job, _)) = self.jobs.next_pending().await? {
            match self.process(job.id).await {
                Ok(done) => return Ok(Some(done)),
                Err(SyncError::InvalidJobState { id, .. }) => {
                    warn!(job_id = %id, "sync job claimed elsewhere, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Claims one pending job and runs it to a terminal state. Errors returned here are
    /// bookkeeping failures; job failures are recorded on the returned job.
    pub async fn process(&self, id: Uuid) -> Result<SyncJob, SyncError> {
        let job = self.jobs.get(id).await?.ok_or(SyncError::UnknownJob(id))?;
        let entry = self
            .jobs
            .queue_entry(id)
            .await?
            .ok_or(SyncError::InvalidJobState {
                id,
                status: job.status,
                action: "processing without a queue entry",
            })?;
        if !self.jobs.claim(id).await? {
            let current = self.jobs.get(id).await?.ok_or(SyncError::UnknownJob(id))?;
            return Err(SyncError::InvalidJobState {
                id,
                status: current.status,
                action: "claim",
            });
        }

        let span = info_span!("sync_job", job_id = %id, job_type = %job.job_type);
        let mut metadata = match job.metadata.clone() {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };

        info!(parent: &span, payload_ref = %entry.payload_ref, "sync job started");
        let result = self
            .execute(&job, &entry, &mut metadata)
            .instrument(span.clone())
            .await;
        let metadata = JsonValue::Object(metadata);

        match result {
            Ok(output) => {
                self.jobs.complete(id, output.counts, &metadata).await?;
                self.state.publish(output.index, id);
                let done = self.jobs.get(id).await?.ok_or(SyncError::UnknownJob(id))?;
                for hook in &self.hooks {
                    hook.on_completed(&done).await;
                }
                info!(parent: &span, counts = ?done.counts, "sync job completed");
                Ok(done)
            }
            Err(err) => {
                warn!(parent: &span, error = %err, "sync job failed");
                if !err.is_pre_apply() {
                    self.state.invalidate();
                }
                self.jobs.fail(id, &err.to_string(), &metadata).await?;
                self.jobs.get(id).await?.ok_or(SyncError::UnknownJob(id))
            }
        }
    }

    async fn execute(
        &self,
        job: &SyncJob,
        entry: &QueueEntry,
        metadata: &mut Map<String, JsonValue>,
    ) -> Result<JobOutput, SyncError> {
        match job.job_type {
            JobType::FullRecompute => self.recompute_all(job.id).await,
            JobType::Webhook | JobType::LocalSnapshot => {
                self.sync_snapshot(job, entry, metadata).await
            }
        }
    }

    async fn sync_snapshot(
        &self,
        job: &SyncJob,
        entry: &QueueEntry,
        metadata: &mut Map<String, JsonValue>,
    ) -> Result<JobOutput, SyncError> {
        let source = source_for_payload_ref(&entry.payload_ref, Arc::clone(&self.fetcher))?;
        let bytes = source.load(job.id).await?;

        let archived = self
            .archive
            .store(Utc::now(), job.job_type, &bytes)
            .await
            .map_err(|err| SyncError::Archive(format!("{err:#}")))?;
        metadata.insert(
            "archive_path".to_string(),
            json!(archived.relative_path.display().to_string()),
        );
        metadata.insert("content_hash".to_string(), json!(archived.content_hash));
        metadata.insert("bytes".to_string(), json!(archived.byte_size));

        let parsed = parse_snapshot(&bytes, &self.config.layout, self.config.parse_policy())?;
        let rows_rejected = parsed.rejections.len() as u64;
        info!(
            rows = parsed.total_rows,
            products = parsed.records.len(),
            rejected = rows_rejected,
            "snapshot parsed"
        );

        let incoming: Vec<Product> = parsed.records.into_iter().map(Product::from_record).collect();
        let stored = self.store.load_products().await?;
        let diff = compute_diff(&stored, incoming);
        drop(stored);

        let propagate_to = if self.config.propagate_candidate_changes {
            self.propagation_targets(&diff)
        } else {
            BTreeSet::new()
        };
        let outcome = self
            .store
            .apply_diff(&diff, &propagate_to)
            .await
            .map_err(SyncError::Apply)?;
        info!(
            added = outcome.added,
            updated = outcome.updated,
            deleted = outcome.deleted,
            unchanged = diff.unchanged,
            propagated = outcome.propagated,
            "catalog diff applied"
        );
        metadata.insert("propagated".to_string(), json!(outcome.propagated));

        let products = self.store.load_products().await?;
        let index = ProductIndex::build(products);
        let dirty = self.store.dirty_ids().await?;
        let summary = self.engine.run(&self.store, &index, &dirty, job.id).await?;

        Ok(JobOutput {
            counts: counts(outcome.added, outcome.updated, outcome.deleted, rows_rejected, summary),
            index,
        })
    }

    /// Same recompute path with every identifier dirty.
    async fn recompute_all(&self, job_id: Uuid) -> Result<JobOutput, SyncError> {
        let index = ProductIndex::build(self.store.load_products().await?);
        let all: Vec<ProductId> = index.ids().cloned().collect();
        let summary = self.engine.run(&self.store, &index, &all, job_id).await?;
        Ok(JobOutput {
            counts: counts(0, 0, 0, 0, summary),
            index,
        })
    }

    /// Source categories whose candidate pools change under `diff`.
    fn propagation_targets(&self, diff: &CatalogDiff) -> BTreeSet<Category> {
        diff.touched_categories()
            .into_iter()
            .flat_map(|target| self.engine.table().sources_for(target))
            .collect()
    }
}

fn counts(
    added: u64,
    updated: u64,
    deleted: u64,
    rows_rejected: u64,
    summary: RecomputeSummary,
) -> SyncCounts {
    SyncCounts {
        products_added: added,
        products_updated: updated,
        products_deleted: deleted,
        rows_rejected,
        products_recomputed: summary.products_recomputed,
        edges_written: summary.edges_written,
        rule_failures: summary.rule_failures,
    }
}

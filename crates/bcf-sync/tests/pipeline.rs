use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bcf_core::{
    Category, Evaluation, JobType, Match, Product, ProductId, RuleError, RuleEvaluator, Sidecar,
    SyncJob, SyncStatus,
};
use bcf_sync::{
    CompletionHook, PipelineConfig, SyncError, SyncPipeline, SyncWorker, WakeSignal,
    ORPHAN_MESSAGE,
};
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

/// Matches every candidate in the pool with the same score.
struct FixedScore;

impl RuleEvaluator for FixedScore {
    fn evaluate(
        &self,
        _base: &Product,
        _target: Category,
        pool: &[&Product],
    ) -> Result<Evaluation, RuleError> {
        Ok(Evaluation::matched(
            pool.iter()
                .map(|p| Match {
                    target_id: p.id.clone(),
                    score: 95,
                    sidecar: Sidecar::default(),
                })
                .collect(),
        ))
    }
}

struct Refuse;

impl RuleEvaluator for Refuse {
    fn evaluate(
        &self,
        base: &Product,
        _target: Category,
        _pool: &[&Product],
    ) -> Result<Evaluation, RuleError> {
        Err(RuleError::Message(format!("cannot evaluate {}", base.id)))
    }
}

#[derive(Default)]
struct CountingHook(AtomicUsize);

#[async_trait]
impl CompletionHook for CountingHook {
    async fn on_completed(&self, _job: &SyncJob) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("catalog.db").display())
}

fn config(dir: &TempDir) -> PipelineConfig {
    PipelineConfig {
        database_url: database_url(dir),
        artifacts_dir: dir.path().join("artifacts"),
        workspace_root: dir.path().to_path_buf(),
        recompute_chunk_size: 2,
        ..PipelineConfig::default()
    }
}

async fn pipeline_with(config: PipelineConfig, evaluator: Arc<dyn RuleEvaluator>) -> SyncPipeline {
    let pool = bcf_sync::open(&config.database_url).await.unwrap();
    SyncPipeline::new(config, pool)
        .unwrap()
        .with_evaluator(evaluator)
}

async fn pipeline(dir: &TempDir) -> SyncPipeline {
    pipeline_with(config(dir), Arc::new(FixedScore)).await
}

fn write_snapshot(dir: &Path, name: &str, rows: JsonValue) -> String {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec(&json!({ "rows": rows })).unwrap()).unwrap();
    path.display().to_string()
}

async fn sync(pipeline: &SyncPipeline, payload_ref: &str) -> SyncJob {
    pipeline
        .jobs()
        .enqueue(JobType::LocalSnapshot, payload_ref, json!({}))
        .await
        .unwrap();
    pipeline.run_pending_once().await.unwrap().unwrap()
}

async fn recompute_all(pipeline: &SyncPipeline) -> SyncJob {
    pipeline.enqueue_full_recompute("test").await.unwrap();
    pipeline.run_pending_once().await.unwrap().unwrap()
}

async fn edge_scores(pipeline: &SyncPipeline, base: &str) -> Vec<(String, u8)> {
    pipeline
        .store()
        .edges_for(&ProductId::new(base).unwrap(), None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.compatible_id.to_string(), e.score))
        .collect()
}

fn base_and_door() -> JsonValue {
    json!([
        {"SKU": "P1", "Category": "Shower Bases", "Width": 60},
        {"SKU": "P2", "Category": "Shower Doors", "Min Width": 56},
    ])
}

#[tokio::test]
async fn repeated_sync_and_full_recompute_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    let snapshot = write_snapshot(dir.path(), "s1.json", base_and_door());

    let first = sync(&pipeline, &snapshot).await;
    assert_eq!(first.status, SyncStatus::Completed, "{:?}", first.error_message);
    assert_eq!(first.counts.products_added, 2);
    assert_eq!(first.counts.products_recomputed, 2);
    assert_eq!(first.counts.edges_written, 1);
    let edges = pipeline.store().all_edges().await.unwrap();

    let second = sync(&pipeline, &snapshot).await;
    assert_eq!(second.status, SyncStatus::Completed);
    assert_eq!(second.counts.products_added, 0);
    assert_eq!(second.counts.products_updated, 0);
    assert_eq!(second.counts.products_recomputed, 0);
    assert_eq!(pipeline.store().all_edges().await.unwrap(), edges);

    let full = recompute_all(&pipeline).await;
    assert_eq!(full.job_type, JobType::FullRecompute);
    assert_eq!(full.counts.products_recomputed, 2);
    assert_eq!(pipeline.store().all_edges().await.unwrap(), edges);
    assert_eq!(pipeline.store().dirty_count().await.unwrap(), 0);
}

#[tokio::test]
async fn new_candidate_marks_unchanged_bases_dirty() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;
    assert_eq!(edge_scores(&pipeline, "P1").await, vec![("P2".to_string(), 95)]);

    let job = sync(
        &pipeline,
        &write_snapshot(
            dir.path(),
            "s2.json",
            json!([
                {"SKU": "P1", "Category": "Shower Bases", "Width": 60},
                {"SKU": "P2", "Category": "Shower Doors", "Min Width": 56},
                {"SKU": "P3", "Category": "Shower Doors", "Min Width": 58},
            ]),
        ),
    )
    .await;

    assert_eq!(job.counts.products_added, 1);
    assert_eq!(job.counts.products_recomputed, 2);
    assert_eq!(
        edge_scores(&pipeline, "P1").await,
        vec![("P2".to_string(), 95), ("P3".to_string(), 95)]
    );
}

#[tokio::test]
async fn without_propagation_a_full_recompute_fills_the_gap() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_with(
        PipelineConfig {
            propagate_candidate_changes: false,
            ..config(&dir)
        },
        Arc::new(FixedScore),
    )
    .await;
    sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;
    let job = sync(
        &pipeline,
        &write_snapshot(
            dir.path(),
            "s2.json",
            json!([
                {"SKU": "P1", "Category": "Shower Bases", "Width": 60},
                {"SKU": "P2", "Category": "Shower Doors", "Min Width": 56},
                {"SKU": "P3", "Category": "Shower Doors", "Min Width": 58},
            ]),
        ),
    )
    .await;

    assert_eq!(job.counts.products_recomputed, 1);
    assert_eq!(edge_scores(&pipeline, "P1").await, vec![("P2".to_string(), 95)]);

    recompute_all(&pipeline).await;
    assert_eq!(
        edge_scores(&pipeline, "P1").await,
        vec![("P2".to_string(), 95), ("P3".to_string(), 95)]
    );
}

#[tokio::test]
async fn deleting_a_product_removes_edges_in_both_directions() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("rules")).unwrap();
    std::fs::write(
        dir.path().join("rules/categories.yaml"),
        "version: 1\npairs:\n  - source: Shower Bases\n    targets: [Shower Doors]\n  - source: Shower Doors\n    targets: [Shower Bases]\n",
    )
    .unwrap();
    let pipeline = pipeline(&dir).await;

    sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;
    assert_eq!(pipeline.store().edge_count().await.unwrap(), 2);

    let job = sync(
        &pipeline,
        &write_snapshot(
            dir.path(),
            "s2.json",
            json!([{"SKU": "P1", "Category": "Shower Bases", "Width": 60}]),
        ),
    )
    .await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.counts.products_deleted, 1);
    assert_eq!(pipeline.store().edge_count().await.unwrap(), 0);
    assert_eq!(pipeline.store().product_count().await.unwrap(), 1);

    let reasons = pipeline
        .store()
        .reasons_for(&ProductId::new("P1").unwrap())
        .await
        .unwrap();
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0].target_category, Category::ShowerDoors);
    assert_eq!(reasons[0].reason, "no compatible Shower Doors");
}

#[tokio::test]
async fn attribute_change_is_an_update() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;

    let job = sync(
        &pipeline,
        &write_snapshot(
            dir.path(),
            "s2.json",
            json!([
                {"SKU": "P1", "Category": "Shower Bases", "Width": 61},
                {"SKU": "P2", "Category": "Shower Doors", "Min Width": 56},
            ]),
        ),
    )
    .await;

    assert_eq!(job.counts.products_updated, 1);
    assert_eq!(job.counts.products_added, 0);
    assert_eq!(job.counts.products_recomputed, 1);
}

#[tokio::test]
async fn transport_failure_leaves_catalog_untouched() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;
    let before = pipeline.store().product_count().await.unwrap();

    let missing = dir.path().join("nope.json").display().to_string();
    let job = sync(&pipeline, &missing).await;

    assert_eq!(job.status, SyncStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("transport failed"));
    assert_eq!(pipeline.store().product_count().await.unwrap(), before);
    assert!(pipeline.jobs().queue_entry(job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn oversized_snapshot_is_a_transport_failure() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_with(
        PipelineConfig {
            max_snapshot_bytes: 8,
            ..config(&dir)
        },
        Arc::new(FixedScore),
    )
    .await;

    let job = sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;
    assert_eq!(job.status, SyncStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("transport failed"));
    assert_eq!(pipeline.store().product_count().await.unwrap(), 0);
}

#[tokio::test]
async fn empty_snapshot_fails_validation() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;

    let job = sync(&pipeline, &write_snapshot(dir.path(), "empty.json", json!([]))).await;
    assert_eq!(job.status, SyncStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("validation failed"));
    assert_eq!(pipeline.store().product_count().await.unwrap(), 2);
    assert_eq!(pipeline.store().edge_count().await.unwrap(), 1);
}

#[tokio::test]
async fn snapshot_is_archived_and_recorded() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    let job = sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;

    let hash = job.metadata["content_hash"].as_str().unwrap();
    assert_eq!(hash.len(), 64);
    let relative = job.metadata["archive_path"].as_str().unwrap();
    assert!(relative.ends_with(&format!("local_snapshot/{hash}.json")));
    assert!(pipeline.config().artifacts_dir.join(relative).exists());
}

#[tokio::test]
async fn workbook_snapshots_sync_and_archive_as_xlsx() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog/snapshot.xlsx");
    let snapshot = dir.path().join("feed.xlsx");
    std::fs::copy(&fixture, &snapshot).unwrap();

    let job = sync(&pipeline, &snapshot.display().to_string()).await;
    assert_eq!(job.status, SyncStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.counts.products_added, 6);
    assert_eq!(job.counts.rows_rejected, 0);

    let hash = job.metadata["content_hash"].as_str().unwrap();
    let relative = job.metadata["archive_path"].as_str().unwrap();
    assert!(relative.ends_with(&format!("local_snapshot/{hash}.xlsx")));
    assert!(!edge_scores(&pipeline, "SB-6032-L").await.is_empty());
}

#[tokio::test]
async fn leftover_dirty_products_are_picked_up_by_the_next_sync() {
    let dir = TempDir::new().unwrap();
    let snapshot = write_snapshot(dir.path(), "s1.json", base_and_door());

    let failing = pipeline_with(
        PipelineConfig {
            max_rule_failure_fraction: 0.0,
            ..config(&dir)
        },
        Arc::new(Refuse),
    )
    .await;
    let job = sync(&failing, &snapshot).await;
    assert_eq!(job.status, SyncStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("recompute failed"));
    assert_eq!(failing.store().product_count().await.unwrap(), 2);
    assert_eq!(failing.store().dirty_count().await.unwrap(), 2);
    drop(failing);

    let pipeline = pipeline(&dir).await;
    let job = sync(&pipeline, &snapshot).await;
    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(job.counts.products_added, 0);
    assert_eq!(job.counts.products_recomputed, 2);
    assert_eq!(edge_scores(&pipeline, "P1").await, vec![("P2".to_string(), 95)]);
}

#[tokio::test]
async fn bases_that_fail_evaluation_stay_dirty_after_a_completed_sync() {
    let dir = TempDir::new().unwrap();
    let snapshot = write_snapshot(dir.path(), "s1.json", base_and_door());

    let tolerant = pipeline_with(
        PipelineConfig {
            max_rule_failure_fraction: 1.0,
            ..config(&dir)
        },
        Arc::new(Refuse),
    )
    .await;
    let job = sync(&tolerant, &snapshot).await;
    assert_eq!(job.status, SyncStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.counts.rule_failures, 1);
    assert_eq!(job.counts.products_recomputed, 1);
    assert_eq!(tolerant.store().dirty_count().await.unwrap(), 1);

    let again = sync(&tolerant, &snapshot).await;
    assert_eq!(again.counts.rule_failures, 1);
    assert_eq!(tolerant.store().dirty_count().await.unwrap(), 1);
    drop(tolerant);

    let pipeline = pipeline(&dir).await;
    let job = sync(&pipeline, &snapshot).await;
    assert_eq!(job.counts.products_recomputed, 1);
    assert_eq!(edge_scores(&pipeline, "P1").await, vec![("P2".to_string(), 95)]);
    assert_eq!(pipeline.store().dirty_count().await.unwrap(), 0);
}

#[tokio::test]
async fn pending_job_survives_restart() {
    let dir = TempDir::new().unwrap();
    let snapshot = write_snapshot(dir.path(), "s1.json", base_and_door());
    let job = {
        let pipeline = pipeline(&dir).await;
        pipeline
            .jobs()
            .enqueue(JobType::Webhook, &snapshot, json!({"channel": "feed"}))
            .await
            .unwrap()
    };

    let pipeline = pipeline(&dir).await;
    assert!(pipeline.jobs().recover_orphans().await.unwrap().is_empty());
    let stored = pipeline.jobs().get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Pending);
    assert_eq!(stored.metadata["channel"], "feed");
    let entry = pipeline.jobs().queue_entry(job.id).await.unwrap().unwrap();
    assert_eq!(entry.payload_ref, snapshot);

    let done = pipeline.run_pending_once().await.unwrap().unwrap();
    assert_eq!(done.id, job.id);
    assert_eq!(done.status, SyncStatus::Completed);
    assert!(pipeline.jobs().queue_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn orphaned_job_is_failed_and_can_be_resubmitted() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    let snapshot = write_snapshot(dir.path(), "s1.json", base_and_door());
    let job = pipeline
        .jobs()
        .enqueue(JobType::Webhook, &snapshot, json!({"channel": "feed"}))
        .await
        .unwrap();

    assert!(pipeline.jobs().claim(job.id).await.unwrap());
    assert!(!pipeline.jobs().claim(job.id).await.unwrap());

    let orphans = pipeline.jobs().recover_orphans().await.unwrap();
    assert_eq!(orphans, vec![job.id]);
    let failed = pipeline.jobs().get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, SyncStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some(ORPHAN_MESSAGE));
    assert!(pipeline.jobs().queue_entry(job.id).await.unwrap().is_some());
    assert!(pipeline.run_pending_once().await.unwrap().is_none());

    let retry = pipeline.jobs().resubmit(job.id).await.unwrap();
    assert_ne!(retry.id, job.id);
    assert_eq!(retry.status, SyncStatus::Pending);
    assert_eq!(retry.job_type, JobType::Webhook);
    assert_eq!(retry.metadata["channel"], "feed");
    assert_eq!(retry.metadata["resubmitted_from"], job.id.to_string());
    assert!(pipeline.jobs().queue_entry(job.id).await.unwrap().is_none());

    let done = pipeline.run_pending_once().await.unwrap().unwrap();
    assert_eq!(done.id, retry.id);
    assert_eq!(done.status, SyncStatus::Completed);

    let err = pipeline.jobs().resubmit(retry.id).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidJobState { .. }));
    let err = pipeline.jobs().resubmit(job.id).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidJobState { .. }));
}

#[tokio::test]
async fn processing_an_already_claimed_job_reports_its_current_status() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    let snapshot = write_snapshot(dir.path(), "s1.json", base_and_door());
    let job = pipeline
        .jobs()
        .enqueue(JobType::Webhook, &snapshot, json!({}))
        .await
        .unwrap();
    assert!(pipeline.jobs().claim(job.id).await.unwrap());

    let err = pipeline.process(job.id).await.unwrap_err();
    match err {
        SyncError::InvalidJobState { id, status, action } => {
            assert_eq!(id, job.id);
            assert_eq!(status, SyncStatus::Processing);
            assert_eq!(action, "claim");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn recent_jobs_are_newest_first() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(pipeline.enqueue_full_recompute("test").await.unwrap().id);
    }
    let recent: Vec<_> = pipeline
        .jobs()
        .recent(2)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(recent, vec![ids[2], ids[1]]);
}

#[tokio::test]
async fn completion_publishes_state_and_runs_hooks() {
    let dir = TempDir::new().unwrap();
    let hook = Arc::new(CountingHook::default());
    let pipeline = pipeline(&dir)
        .await
        .with_hooks(vec![hook.clone() as Arc<dyn CompletionHook>]);

    let job = sync(&pipeline, &write_snapshot(dir.path(), "s1.json", base_and_door())).await;
    let snapshot = pipeline.state().peek().unwrap();
    assert_eq!(snapshot.job_id, Some(job.id));
    assert_eq!(snapshot.index.len(), 2);
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);

    sync(&pipeline, &dir.path().join("nope.json").display().to_string()).await;
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_drains_queue_on_wake_and_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let pipeline = Arc::new(
        pipeline_with(
            PipelineConfig {
                poll_interval: Duration::from_secs(3600),
                ..config(&dir)
            },
            Arc::new(FixedScore),
        )
        .await,
    );
    let wake: WakeSignal = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(SyncWorker::new(Arc::clone(&pipeline), Arc::clone(&wake)).run(shutdown_rx));

    let snapshot = write_snapshot(dir.path(), "s1.json", base_and_door());
    let job = pipeline
        .jobs()
        .enqueue(JobType::Webhook, &snapshot, json!({}))
        .await
        .unwrap();
    wake.notify_one();

    let mut status = SyncStatus::Pending;
    for _ in 0..100 {
        status = pipeline.jobs().get(job.id).await.unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status, SyncStatus::Completed);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap().unwrap();
}

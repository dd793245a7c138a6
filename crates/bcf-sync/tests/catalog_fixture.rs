use std::path::{Path, PathBuf};

use bcf_adapters::parse_override_sheet;
use bcf_core::{Category, JobType, ProductId, SyncStatus};
use bcf_sync::{enrich_forced, merge, MergeOrder, PipelineConfig, SyncPipeline};
use serde_json::json;
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/catalog")
        .join(name)
}

fn id(raw: &str) -> ProductId {
    ProductId::new(raw).unwrap()
}

async fn synced_catalog(dir: &TempDir) -> SyncPipeline {
    let config = PipelineConfig {
        database_url: format!("sqlite://{}", dir.path().join("catalog.db").display()),
        artifacts_dir: dir.path().join("artifacts"),
        workspace_root: Path::new(env!("CARGO_MANIFEST_DIR")).join("../.."),
        max_rejected_row_fraction: 0.2,
        ..PipelineConfig::default()
    };
    let pool = bcf_sync::open(&config.database_url).await.unwrap();
    let pipeline = SyncPipeline::new(config, pool).unwrap();

    pipeline
        .jobs()
        .enqueue(
            JobType::LocalSnapshot,
            &fixture("snapshot.json").display().to_string(),
            json!({}),
        )
        .await
        .unwrap();
    let job = pipeline.run_pending_once().await.unwrap().unwrap();
    assert_eq!(job.status, SyncStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.counts.products_added, 9);
    assert_eq!(job.counts.rows_rejected, 1);
    pipeline
}

#[tokio::test]
async fn dimensional_rules_populate_edges_and_reasons() {
    let dir = TempDir::new().unwrap();
    let pipeline = synced_catalog(&dir).await;

    let walls: Vec<(String, u8)> = pipeline
        .store()
        .edges_for(&id("SB-6032-L"), Some(Category::Walls))
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.compatible_id.to_string(), e.score))
        .collect();
    assert_eq!(
        walls,
        vec![("W-6032".to_string(), 100), ("W-CUT".to_string(), 80)]
    );

    let reasons = pipeline.store().reasons_for(&id("SB-4836")).await.unwrap();
    let walls_reason = reasons
        .iter()
        .find(|r| r.target_category == Category::Walls)
        .unwrap();
    assert_eq!(walls_reason.reason, "Corner install only");
}

#[tokio::test]
async fn imported_overrides_merge_over_computed_edges() {
    let dir = TempDir::new().unwrap();
    let pipeline = synced_catalog(&dir).await;

    let bytes = std::fs::read(fixture("overrides.json")).unwrap();
    let rules = parse_override_sheet(&bytes, &pipeline.config().layout).unwrap();
    assert_eq!(pipeline.store().upsert_overrides(&rules).await.unwrap(), 3);
    // Re-import overwrites rather than duplicates.
    pipeline.store().upsert_overrides(&rules).await.unwrap();

    let tub_rules = pipeline.store().overrides_for(&id("BT-6030")).await.unwrap();
    assert_eq!(tub_rules.len(), 1);
    let computed = pipeline
        .store()
        .edges_for(&id("BT-6030"), Some(Category::Walls))
        .await
        .unwrap();
    let merged = merge(&computed, tub_rules.first(), MergeOrder::Computed);
    let pairs: Vec<(&str, u8, bool)> = merged
        .iter()
        .map(|e| (e.compatible_id.as_str(), e.score, e.forced))
        .collect();
    assert_eq!(pairs, vec![("W-CUT", 80, false), ("W-6032", 100, true)]);

    let base_rules = pipeline.store().overrides_for(&id("SB-6032-L")).await.unwrap();
    let doors_rule = base_rules
        .iter()
        .find(|r| r.target_category == Category::ShowerDoors);
    let computed = pipeline
        .store()
        .edges_for(&id("SB-6032-L"), Some(Category::ShowerDoors))
        .await
        .unwrap();
    let mut merged = merge(&computed, doors_rule, MergeOrder::Computed);
    let snapshot = pipeline.state().get(pipeline.store()).await.unwrap();
    enrich_forced(&mut merged, &snapshot.index);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].compatible_id.as_str(), "SD-5660");
    assert_eq!(merged[1].compatible_id.as_str(), "SD-4448");
    assert_eq!(merged[1].door_type.as_deref(), Some("Pivot"));

    let walls_rule = base_rules
        .iter()
        .find(|r| r.target_category == Category::Walls);
    let computed = pipeline
        .store()
        .edges_for(&id("SB-6032-L"), Some(Category::Walls))
        .await
        .unwrap();
    let merged = merge(&computed, walls_rule, MergeOrder::Computed);
    let ids: Vec<&str> = merged.iter().map(|e| e.compatible_id.as_str()).collect();
    assert_eq!(ids, vec!["W-6032"]);
}

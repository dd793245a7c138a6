//! Axum surface for the catalog: webhook intake, sync status, compatibility reads and stats.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bcf_core::{Category, CategoryTable, JobType, OverrideRule};
use bcf_sync::{
    enrich_forced, maybe_build_scheduler, merge, CatalogState, CatalogStore, JobController,
    MergeOrder, MergedEdge, PipelineConfig, SyncError, SyncPipeline, SyncWorker, WakeSignal,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

mod cache;

pub use cache::ResponseCache;

pub const CRATE_NAME: &str = "bcf-web";

const DEFAULT_STATUS_LIMIT: u32 = 10;
const MAX_STATUS_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: CatalogStore,
    pub jobs: JobController,
    pub catalog: Arc<CatalogState>,
    pub table: CategoryTable,
    pub cache: Arc<ResponseCache>,
    pub wake: WakeSignal,
    pub webhook_secret: Option<String>,
}

impl AppState {
    /// Shares the pipeline's store, job table and catalog state. `cache` should also be
    /// registered as a completion hook on the pipeline.
    pub fn from_pipeline(
        pipeline: &SyncPipeline,
        table: CategoryTable,
        cache: Arc<ResponseCache>,
        wake: WakeSignal,
    ) -> Self {
        Self {
            store: pipeline.store().clone(),
            jobs: pipeline.jobs().clone(),
            catalog: Arc::clone(pipeline.state()),
            table,
            cache,
            wake,
            webhook_secret: pipeline.config().webhook_secret.clone(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/webhook", post(webhook_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/products/{id}/compatibility", get(compatibility_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

/// Runs the HTTP server with the sync worker and the optional scheduler until Ctrl-C.
pub async fn serve(config: PipelineConfig) -> anyhow::Result<()> {
    let pool = bcf_sync::open(&config.database_url).await?;
    let table = config.category_table()?;
    let cache = Arc::new(ResponseCache::new(config.cache_max_entries));
    let port = config.web_port;
    let pipeline = Arc::new(
        SyncPipeline::new(config, pool)?
            .with_hooks(vec![cache.clone() as Arc<dyn bcf_sync::CompletionHook>]),
    );
    let wake: WakeSignal = Arc::new(Notify::new());
    let state = AppState::from_pipeline(&pipeline, table, cache, Arc::clone(&wake));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(
        SyncWorker::new(Arc::clone(&pipeline), Arc::clone(&wake)).run(shutdown_rx),
    );
    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline), Arc::clone(&wake)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving catalog api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving http")?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    let _ = shutdown_tx.send(true);
    worker.await.context("joining sync worker")??;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(PipelineConfig::from_env()).await
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn server_error(err: SyncError) -> Response {
    error!(error = %err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[derive(Debug, Deserialize, Default)]
struct KeyQuery {
    key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WebhookPayload {
    channel_id: Option<String>,
    channel_name: Option<String>,
    user_id: Option<String>,
    publication_status: Option<String>,
    product_feed_export_url: Option<String>,
}

/// Authenticates, then either drops the notification or records a pending job. No catalog
/// work happens here; the worker is only woken.
async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
    body: Bytes,
) -> Response {
    let authorized = match (&state.webhook_secret, &query.key) {
        (Some(secret), Some(key)) => secret == key,
        _ => false,
    };
    if !authorized {
        warn!("webhook rejected: bad key");
        return api_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return api_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}")),
    };
    let Some(status) = payload.publication_status.as_deref() else {
        return api_error(StatusCode::BAD_REQUEST, "missing publication_status");
    };
    if status != "completed" {
        info!(status, "webhook ignored: publication not completed");
        return (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "ignored", "publication_status": status })),
        )
            .into_response();
    }
    let Some(url) = payload
        .product_feed_export_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
    else {
        return api_error(StatusCode::BAD_REQUEST, "missing product_feed_export_url");
    };
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return api_error(StatusCode::BAD_REQUEST, "product_feed_export_url must be http(s)");
    }

    let metadata = json!({
        "channel_id": payload.channel_id,
        "channel_name": payload.channel_name,
        "user_id": payload.user_id,
        "source_url": url,
    });
    match state.jobs.enqueue(JobType::Webhook, url, metadata).await {
        Ok(job) => {
            state.wake.notify_one();
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "accepted", "sync_id": job.id })),
            )
                .into_response()
        }
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct StatusQuery {
    sync_id: Option<String>,
    limit: Option<u32>,
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if let Some(raw) = query.sync_id.as_deref() {
        let Ok(id) = Uuid::parse_str(raw.trim()) else {
            return api_error(StatusCode::BAD_REQUEST, format!("invalid sync_id `{raw}`"));
        };
        return match state.jobs.get(id).await {
            Ok(Some(job)) => Json(json!({ "job": job })).into_response(),
            Ok(None) => api_error(StatusCode::NOT_FOUND, format!("unknown sync_id {id}")),
            Err(err) => server_error(err),
        };
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_STATUS_LIMIT)
        .clamp(1, MAX_STATUS_LIMIT);
    match state.jobs.recent(limit).await {
        Ok(jobs) => Json(json!({ "jobs": jobs })).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CompatibilityQuery {
    category: Option<String>,
    sort: Option<String>,
}

#[derive(Debug, Serialize)]
struct CategoryMatches {
    category: Category,
    matches: Vec<MergedEdge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn compatibility_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<CompatibilityQuery>,
) -> Response {
    let category = match query.category.as_deref().filter(|c| !c.trim().is_empty()) {
        None => None,
        Some(raw) => match Category::parse(raw) {
            Some(category) => Some(category),
            None => return api_error(StatusCode::BAD_REQUEST, format!("unknown category `{raw}`")),
        },
    };
    let order = match query.sort.as_deref() {
        None | Some("") => MergeOrder::Computed,
        Some("score") => MergeOrder::ScoreDesc,
        Some(other) => return api_error(StatusCode::BAD_REQUEST, format!("unknown sort `{other}`")),
    };

    let cache_key = ResponseCache::key(&[
        "compatibility",
        key.trim(),
        category.map(Category::as_str).unwrap_or(""),
        if order == MergeOrder::ScoreDesc { "score" } else { "" },
    ]);
    if let Some(body) = state.cache.get(&cache_key).await {
        return Json(body).into_response();
    }

    match compatibility_body(&state, &key, category, order).await {
        Ok(Some(body)) => {
            state.cache.insert(cache_key, body.clone()).await;
            Json(body).into_response()
        }
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("unknown product `{key}`")),
        Err(err) => server_error(err),
    }
}

async fn compatibility_body(
    state: &AppState,
    key: &str,
    category: Option<Category>,
    order: MergeOrder,
) -> Result<Option<JsonValue>, SyncError> {
    let snapshot = state.catalog.get(&state.store).await?;
    let Some(product) = snapshot.index.resolve(key) else {
        return Ok(None);
    };

    let targets: Vec<Category> = match category {
        Some(category) => vec![category],
        None => state.table.targets_for(product.category).to_vec(),
    };
    let edges = state.store.edges_for(&product.id, category).await?;
    let rules: Vec<OverrideRule> = state.store.overrides_for(&product.id).await?;
    let reasons = state.store.reasons_for(&product.id).await?;

    let mut categories = Vec::with_capacity(targets.len());
    for target in targets {
        let computed: Vec<_> = edges
            .iter()
            .filter(|e| e.target_category == target)
            .cloned()
            .collect();
        let rule = rules.iter().find(|r| r.target_category == target);
        let mut matches = merge(&computed, rule, order);
        enrich_forced(&mut matches, &snapshot.index);
        let reason = if matches.is_empty() {
            reasons
                .iter()
                .find(|r| r.target_category == target)
                .map(|r| r.reason.clone())
        } else {
            None
        };
        categories.push(CategoryMatches {
            category: target,
            matches,
            reason,
        });
    }

    Ok(Some(json!({
        "product": {
            "id": product.id,
            "category": product.category,
            "parent_id": product.parent_id,
            "unique_id": product.unique_id,
        },
        "categories": categories,
    })))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match stats_body(&state).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => server_error(err),
    }
}

async fn stats_body(state: &AppState) -> Result<JsonValue, SyncError> {
    let by_category = state.store.counts_by_category().await?;
    let by_category: serde_json::Map<String, JsonValue> = by_category
        .into_iter()
        .map(|(category, n)| (category.as_str().to_string(), json!(n)))
        .collect();
    let last_job = state.jobs.recent(1).await?.into_iter().next();
    Ok(json!({
        "products": state.store.product_count().await?,
        "products_by_category": by_category,
        "edges": state.store.edge_count().await?,
        "dirty": state.store.dirty_count().await?,
        "last_job": last_job,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bcf_core::SyncStatus;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        dir: TempDir,
        pipeline: SyncPipeline,
        state: AppState,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            database_url: format!("sqlite://{}", dir.path().join("web.db").display()),
            artifacts_dir: dir.path().join("artifacts"),
            workspace_root: dir.path().to_path_buf(),
            webhook_secret: Some("s3cret".to_string()),
            ..PipelineConfig::default()
        };
        let pool = bcf_sync::open(&config.database_url).await.unwrap();
        let cache = Arc::new(ResponseCache::new(16));
        let pipeline = SyncPipeline::new(config, pool)
            .unwrap()
            .with_hooks(vec![cache.clone() as Arc<dyn bcf_sync::CompletionHook>]);
        let state = AppState::from_pipeline(
            &pipeline,
            CategoryTable::builtin(),
            cache,
            Arc::new(Notify::new()),
        );
        Harness {
            dir,
            pipeline,
            state,
        }
    }

    async fn load_catalog(h: &Harness) {
        let path = h.dir.path().join("snapshot.json");
        let rows = json!({"rows": [
            {"SKU": "SB-6032", "Category": "Shower Bases", "Unique ID": 5001, "Brand": "Acme",
             "Max Door Width": 58, "Nominal Dimensions": "60 x 32", "Fits Return Panel Size": "32"},
            {"SKU": "SD-5660", "Category": "Shower Doors", "Brand": "Acme", "Min Width": 56,
             "Max Width": 60, "Glass Thickness": "8mm", "Door Type": "Sliding"},
            {"SKU": "SD-4448", "Category": "Shower Doors", "Min Width": 44, "Max Width": 48,
             "Door Type": "Pivot"},
        ]});
        std::fs::write(&path, serde_json::to_vec(&rows).unwrap()).unwrap();
        h.pipeline
            .jobs()
            .enqueue(JobType::LocalSnapshot, &path.display().to_string(), json!({}))
            .await
            .unwrap();
        let job = h.pipeline.run_pending_once().await.unwrap().unwrap();
        assert_eq!(job.status, SyncStatus::Completed, "{:?}", job.error_message);
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, JsonValue) {
        let resp = app(state.clone()).oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn completed_payload() -> JsonValue {
        json!({
            "channel_id": "chan-1",
            "channel_name": "Feed",
            "publication_status": "completed",
            "product_feed_export_url": "https://feeds.example.com/export.json"
        })
    }

    #[tokio::test]
    async fn webhook_rejects_bad_key_without_creating_a_job() {
        let h = harness().await;
        let (status, _) = call(&h.state, post_json("/api/webhook?key=nope", completed_payload())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&h.state, post_json("/api/webhook", completed_payload())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(h.state.jobs.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_ignores_unfinished_publications() {
        let h = harness().await;
        let (status, body) = call(
            &h.state,
            post_json(
                "/api/webhook?key=s3cret",
                json!({"publication_status": "in_progress", "product_feed_export_url": "https://x/y"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "ignored");
        assert!(h.state.jobs.recent(10).await.unwrap().is_empty());
        assert!(h.state.jobs.queue_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_requires_a_feed_url() {
        let h = harness().await;
        let (status, _) = call(
            &h.state,
            post_json("/api/webhook?key=s3cret", json!({"publication_status": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&h.state, post_json("/api/webhook?key=s3cret", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn accepted_webhook_is_queued_and_reported() {
        let h = harness().await;
        let (status, body) =
            call(&h.state, post_json("/api/webhook?key=s3cret", completed_payload())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "accepted");
        let sync_id = body["sync_id"].as_str().unwrap().to_string();

        let entries = h.state.jobs.queue_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload_ref, "https://feeds.example.com/export.json");

        let (status, body) = call(&h.state, get(&format!("/api/sync/status?sync_id={sync_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["status"], "pending");
        assert_eq!(body["job"]["job_type"], "webhook");
        assert_eq!(body["job"]["metadata"]["channel_id"], "chan-1");

        let (status, body) = call(&h.state, get("/api/sync/status?limit=500")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let h = harness().await;
        let (status, _) = call(
            &h.state,
            get(&format!("/api/sync/status?sync_id={}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&h.state, get("/api/sync/status?sync_id=garbage")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn compatibility_merges_overrides_and_explains_gaps() {
        let h = harness().await;
        load_catalog(&h).await;
        h.state
            .store
            .upsert_overrides(&[OverrideRule {
                base_id: bcf_core::ProductId::new("SB-6032").unwrap(),
                target_category: Category::ShowerDoors,
                include: vec![bcf_core::ProductId::new("SD-4448").unwrap()],
                exclude: vec![],
            }])
            .await
            .unwrap();

        let (status, body) = call(&h.state, get("/api/products/5001/compatibility")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["product"]["id"], "SB-6032");

        let categories = body["categories"].as_array().unwrap();
        assert_eq!(categories.len(), 4);
        let doors = &categories[0];
        assert_eq!(doors["category"], "Shower Doors");
        let matches = doors["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0]["compatible_id"], "SD-5660");
        assert_eq!(matches[0]["score"], 90);
        assert_eq!(matches[0]["glass_thickness"], "8mm");
        assert_eq!(matches[1]["compatible_id"], "SD-4448");
        assert_eq!(matches[1]["forced"], true);
        assert_eq!(matches[1]["door_type"], "Pivot");

        let walls = &categories[1];
        assert_eq!(walls["category"], "Walls");
        assert!(walls["matches"].as_array().unwrap().is_empty());
        assert_eq!(walls["reason"], "no compatible Walls for 60 x 32");
        assert_eq!(h.state.cache.len().await, 1);
    }

    #[tokio::test]
    async fn compatibility_filters_and_validates_category() {
        let h = harness().await;
        load_catalog(&h).await;

        let (status, body) = call(
            &h.state,
            get("/api/products/sb-6032/compatibility?category=shower%20doors&sort=score"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["categories"].as_array().unwrap().len(), 1);

        let (status, _) = call(&h.state, get("/api/products/SB-6032/compatibility?category=sinks")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&h.state, get("/api/products/NOPE/compatibility")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completed_sync_clears_cached_responses() {
        let h = harness().await;
        load_catalog(&h).await;
        call(&h.state, get("/api/products/SB-6032/compatibility")).await;
        assert_eq!(h.state.cache.len().await, 1);

        h.pipeline.enqueue_full_recompute("test").await.unwrap();
        h.pipeline.run_pending_once().await.unwrap().unwrap();
        assert_eq!(h.state.cache.len().await, 0);
    }

    #[tokio::test]
    async fn stats_report_catalog_and_last_job() {
        let h = harness().await;
        load_catalog(&h).await;
        let (status, body) = call(&h.state, get("/api/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["products"], 3);
        assert_eq!(body["products_by_category"]["Shower Doors"], 2);
        assert_eq!(body["edges"], 1);
        assert_eq!(body["dirty"], 0);
        assert_eq!(body["last_job"]["status"], "completed");
    }
}

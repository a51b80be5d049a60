//! Thin REST control surface: translate path/query params, call one `Core`
//! method, map the result to JSON or an `ApiError`. No business logic lives
//! here — it belongs to `Scheduler`, `ScanExecutor`, and `HistoryStore`.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use dirsize_common::{NasConfigPublic, ScanResult, ScanStatus};

use crate::error::ApiError;
use crate::state::Core;
use crate::storage::FolderFilter;

pub fn router(core: Core) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/health", get(health_detail))
        .route("/scans", get(list_scans))
        .route("/scans/:slug", get(get_scan))
        .route("/scans/:slug/status", get(get_scan_status))
        .route("/scans/:slug/progress", get(get_scan_progress))
        .route("/scans/:slug/results", get(get_scan_results))
        .route("/scans/:slug/history", get(get_scan_history))
        .route("/scans/:slug/trigger", post(trigger_scan))
        .route("/scans/:slug/results", delete(delete_scan_results))
        .route("/config/reload", post(reload_config))
        .route("/storage/stats", get(storage_stats))
        .route("/folders", get(get_all_folders))
        .route("/folders", delete(delete_folder_results))
        .route("/cleanup/preview", get(cleanup_preview))
        .route("/cleanup", post(cleanup))
        .route("/results", delete(delete_all_results))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(core)
}

#[derive(Debug, Serialize)]
struct ScanSummary {
    name: String,
    slug: String,
    status: ScanStatus,
    enabled: bool,
    last_run: Option<chrono::DateTime<chrono::Utc>>,
    next_run: Option<chrono::DateTime<chrono::Utc>>,
    trigger_description: String,
    shares: Vec<String>,
    folders: Vec<String>,
    paths: Vec<String>,
    nas: NasConfigPublic,
    interval: String,
}

async fn build_summary(core: &Core, slug: &str) -> Option<ScanSummary> {
    let descriptor = core.scheduler.descriptor(slug).await?;
    let job_info = core.scheduler.get_job_info(&descriptor.slug).await;
    let live_running = core.executor.live_state().is_running(&descriptor.slug).await;
    let last_completed = core
        .store
        .get_latest_result(&descriptor.slug)
        .await
        .ok()
        .flatten();

    let status = if live_running {
        ScanStatus::Running
    } else {
        last_completed
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(ScanStatus::Pending)
    };

    Some(ScanSummary {
        name: descriptor.name.clone(),
        slug: descriptor.slug.clone(),
        status,
        enabled: descriptor.enabled,
        last_run: last_completed.as_ref().map(|r| r.timestamp),
        next_run: job_info.as_ref().and_then(|j| j.next_run),
        trigger_description: job_info
            .map(|j| j.trigger_description)
            .unwrap_or_else(|| "unscheduled".to_string()),
        shares: descriptor.shares,
        folders: descriptor.folders,
        paths: descriptor.paths,
        nas: NasConfigPublic::from(&descriptor.nas),
        interval: descriptor.interval,
    })
}

async fn liveness(State(core): State<Core>) -> Json<crate::health::LivenessResponse> {
    Json(core.health.liveness())
}

async fn readiness(State(core): State<Core>) -> Json<crate::health::ReadinessResponse> {
    let db = core.health.check_database(&core.store).await;
    Json(core.health.readiness(&[db]))
}

async fn health_detail(State(core): State<Core>) -> Json<crate::health::HealthResponse> {
    let db = core.health.check_database(&core.store).await;
    let running = core.scheduler.is_running().await;
    let job_count = core.scheduler.list_jobs().await.len();
    let scheduler_health = core.health.check_scheduler(running, job_count);
    let warnings = core.scheduler.duplicate_warnings().await;
    Json(
        core.health
            .build_response(vec![db, scheduler_health], warnings),
    )
}

async fn list_scans(State(core): State<Core>) -> Json<Vec<ScanSummary>> {
    let mut out = Vec::new();
    for descriptor in core.scheduler.descriptors().await {
        if let Some(summary) = build_summary(&core, &descriptor.slug).await {
            out.push(summary);
        }
    }
    Json(out)
}

async fn get_scan(
    State(core): State<Core>,
    Path(slug): Path<String>,
) -> Result<Json<ScanSummary>, ApiError> {
    build_summary(&core, &slug)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("scan '{slug}' not found")))
}

async fn get_scan_status(
    State(core): State<Core>,
    Path(slug): Path<String>,
) -> Result<Json<ScanSummary>, ApiError> {
    get_scan(State(core), Path(slug)).await
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    slug: String,
    running: bool,
    percent_complete: Option<f64>,
    current_path: Option<String>,
}

async fn get_scan_progress(
    State(core): State<Core>,
    Path(slug): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    core.scheduler
        .descriptor(&slug)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("scan '{slug}' not found")))?;

    let live = core.executor.live_state().snapshot(&slug).await;
    let percent = match &live {
        Some(state) => {
            let baseline = core.store.get_latest_completed_result(&slug).await?;
            baseline.and_then(|b| crate::progress::estimate(state, &b))
        }
        None => None,
    };

    Ok(Json(ProgressResponse {
        slug: slug.clone(),
        running: live.as_ref().map(|s| s.is_running()).unwrap_or(false),
        percent_complete: percent,
        current_path: live.and_then(|s| s.current_path),
    }))
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    #[serde(default)]
    latest: bool,
}

async fn get_scan_results(
    State(core): State<Core>,
    Path(slug): Path<String>,
    Query(q): Query<LatestQuery>,
) -> Result<Json<Vec<ScanResult>>, ApiError> {
    if q.latest {
        let result = core.store.get_latest_result(&slug).await?;
        Ok(Json(result.into_iter().collect()))
    } else {
        Ok(Json(core.store.get_all_results(&slug).await?))
    }
}

async fn get_scan_history(
    State(core): State<Core>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<ScanResult>>, ApiError> {
    Ok(Json(core.store.get_all_results(&slug).await?))
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    slug: String,
    triggered: bool,
    message: String,
}

async fn trigger_scan(
    State(core): State<Core>,
    Path(slug): Path<String>,
) -> Result<Json<TriggerResponse>, ApiError> {
    match core.scheduler.trigger_now(&slug).await {
        None => Err(ApiError::NotFound(format!("scan '{slug}' not found"))),
        Some(true) => Ok(Json(TriggerResponse {
            slug,
            triggered: true,
            message: "scan enqueued".to_string(),
        })),
        Some(false) => Ok(Json(TriggerResponse {
            slug,
            triggered: false,
            message: "scan already running".to_string(),
        })),
    }
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    added: usize,
    removed: usize,
    updated: usize,
    warnings: Vec<String>,
}

async fn reload_config(State(core): State<Core>) -> Result<Json<ReloadResponse>, ApiError> {
    let loaded = crate::config::Config::load(core.config_path.as_path())?;
    let diff = core.scheduler.reload(loaded.scans.clone()).await;
    *core.config.write().await = loaded;
    let warnings = core.scheduler.duplicate_warnings().await;
    Ok(Json(ReloadResponse {
        added: diff.added,
        removed: diff.removed,
        updated: diff.updated,
        warnings,
    }))
}

async fn storage_stats(
    State(core): State<Core>,
) -> Result<Json<crate::storage::StorageStats>, ApiError> {
    Ok(Json(core.store.storage_stats().await?))
}

fn folder_filter_from_query(params: &HashMap<String, String>) -> FolderFilter {
    FolderFilter {
        nas_host: params.get("nasHost").cloned(),
        folder_path: params.get("folderPath").cloned(),
        slug: params.get("slug").cloned(),
    }
}

async fn get_all_folders(
    State(core): State<Core>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<(String, String)>>, ApiError> {
    let filter = folder_filter_from_query(&params);
    Ok(Json(core.store.get_all_folders(&filter).await?))
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    days: Option<i64>,
    #[serde(flatten)]
    filter: HashMap<String, String>,
}

async fn cleanup_preview(
    State(core): State<Core>,
    Query(q): Query<CleanupQuery>,
) -> Result<Json<crate::storage::CleanupSummary>, ApiError> {
    let filter = folder_filter_from_query(&q.filter);
    Ok(Json(
        core.store
            .cleanup_old_results(q.days, &filter, true)
            .await?,
    ))
}

async fn cleanup(
    State(core): State<Core>,
    Query(q): Query<CleanupQuery>,
) -> Result<Json<crate::storage::CleanupSummary>, ApiError> {
    let filter = folder_filter_from_query(&q.filter);
    Ok(Json(
        core.store
            .cleanup_old_results(q.days, &filter, false)
            .await?,
    ))
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    rows_affected: u64,
}

async fn delete_folder_results(
    State(core): State<Core>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let filter = folder_filter_from_query(&params);
    let rows_affected = core.store.delete_folder_results(&filter).await?;
    Ok(Json(DeletedResponse { rows_affected }))
}

async fn delete_scan_results(
    State(core): State<Core>,
    Path(slug): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let rows_affected = core.store.clear_results(Some(&slug)).await?;
    Ok(Json(DeletedResponse { rows_affected }))
}

async fn delete_all_results(
    State(core): State<Core>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let rows_affected = core.store.delete_all_results().await?;
    Ok(Json(DeletedResponse { rows_affected }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_filter_reads_expected_query_keys() {
        let mut params = HashMap::new();
        params.insert("nasHost".to_string(), "nas1".to_string());
        params.insert("slug".to_string(), "docs".to_string());
        let filter = folder_filter_from_query(&params);
        assert_eq!(filter.nas_host.as_deref(), Some("nas1"));
        assert_eq!(filter.slug.as_deref(), Some("docs"));
        assert!(filter.folder_path.is_none());
    }
}

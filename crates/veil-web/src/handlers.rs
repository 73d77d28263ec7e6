//! HTTP处理器

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use veil_core::EventBus;
use veil_pipeline::StudyRegistry;
use veil_storage::BlobStore;

/// 处理器共享的应用上下文
#[derive(Clone)]
pub struct AppContext {
    pub registry: Arc<StudyRegistry>,
    pub store: Arc<BlobStore>,
    pub events: Arc<EventBus>,
}

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "DICOM Veil Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "studies": "/api/v1/studies",
            "events": "/api/v1/events",
            "event_stream": "/api/v1/events/stream"
        }
    }))
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// 在册研究列表
pub async fn list_studies(State(ctx): State<AppContext>) -> impl IntoResponse {
    let studies = ctx.registry.list().await;
    let totals = ctx.registry.totals().await;
    Json(json!({
        "studies": studies,
        "totals": totals
    }))
}

/// 单个研究状态
pub async fn get_study(
    State(ctx): State<AppContext>,
    Path(study_uid): Path<String>,
) -> impl IntoResponse {
    match ctx.registry.get(&study_uid).await {
        Some(summary) => Json(summary).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "study not found", "study_uid": study_uid })),
        )
            .into_response(),
    }
}

/// 归档制品下载
pub async fn download_archive(
    State(ctx): State<AppContext>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    debug!(archive_key = %key, "归档下载请求");
    match ctx.store.get(&key).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/gzip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", key),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(veil_core::VeilError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "archive not found", "archive_key": key })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// 最近的生命周期事件历史
pub async fn recent_events(State(ctx): State<AppContext>) -> impl IntoResponse {
    let events = ctx.events.recent().await;
    Json(json!({
        "total": events.len(),
        "events": events
    }))
}

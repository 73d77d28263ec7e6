//! Web服务器

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers::{
    api_root, download_archive, get_study, health, list_studies, recent_events, AppContext,
};
use crate::sse::event_stream;
use veil_core::{Result, VeilError};

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, ctx: AppContext) -> Self {
        Self {
            addr,
            app: create_app(ctx),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Web服务启动: {}", self.addr);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .await
            .map_err(|e| VeilError::Internal(format!("Web服务退出: {}", e)))?;
        Ok(())
    }
}

pub fn create_app(ctx: AppContext) -> Router {
    Router::new()
        // 根路径与健康检查
        .route("/", get(api_root))
        .route("/health", get(health))
        // API路由
        .nest("/api/v1", api_routes())
        .with_state(ctx)
        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

/// API v1 路由
fn api_routes() -> Router<AppContext> {
    Router::new()
        .route("/studies", get(list_studies))
        .route("/studies/:study_uid", get(get_study))
        .route("/archives/:key", get(download_archive))
        .route("/events", get(recent_events))
        .route("/events/stream", get(event_stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::util::ServiceExt;
    use veil_core::config::SeriesFilterConfig;
    use veil_core::models::tags;
    use veil_core::{DicomDataset, EventBus};
    use veil_pipeline::{SeriesFilter, StudyRegistry};
    use veil_storage::BlobStore;

    async fn test_app(dir: &std::path::Path) -> (Router, AppContext) {
        let ctx = AppContext {
            registry: Arc::new(StudyRegistry::new(SeriesFilter::new(
                &SeriesFilterConfig::default(),
            ))),
            store: Arc::new(BlobStore::open(dir).await.unwrap()),
            events: Arc::new(EventBus::default()),
        };
        (create_app(ctx.clone()), ctx)
    }

    fn instance(study: &str) -> DicomDataset {
        let mut dataset = DicomDataset::new();
        dataset.set(tags::STUDY_INSTANCE_UID, study);
        dataset.set(tags::SERIES_INSTANCE_UID, format!("{}.1", study));
        dataset.set(tags::SOP_INSTANCE_UID, format!("{}.1.1", study));
        dataset.set(tags::MODALITY, "CT");
        dataset
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _ctx) = test_app(dir.path()).await;
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_study_listing_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (app, ctx) = test_app(dir.path()).await;
        ctx.registry.upsert(&instance("1.2.3")).await;

        let (status, body) = get_json(app.clone(), "/api/v1/studies").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totals"]["studies"], 1);
        assert_eq!(body["studies"][0]["study_uid"], "1.2.3");

        let (status, body) = get_json(app.clone(), "/api/v1/studies/1.2.3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instance_count"], 1);

        let (status, _body) = get_json(app, "/api/v1/studies/9.9.9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_archive_download() {
        let dir = tempfile::tempdir().unwrap();
        let (app, ctx) = test_app(dir.path()).await;

        let staged = ctx
            .store
            .put_staged("2.25.7.tar.gz", b"archive-bytes")
            .await
            .unwrap();
        ctx.store.commit(staged).await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/archives/2.25.7.tar.gz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/gzip"
        );
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"archive-bytes");

        let (status, _body) = get_json(app, "/api/v1/archives/absent.tar.gz").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_history_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (app, ctx) = test_app(dir.path()).await;
        ctx.events
            .emit(veil_core::StudyEvent::new(
                "1.2.3",
                veil_core::LifecycleStatus::Created,
                1,
                1,
            ))
            .await;

        let (status, body) = get_json(app, "/api/v1/events").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["events"][0]["status"], "created");
    }
}

//! JSON admin API over the profile orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dip_core::ExtractionOutcome;
use dip_manager::ProfileOptions;
use dip_sync::ProfileOrchestrator;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "dip-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProfileOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ProfileOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize)]
struct DecisionQuery {
    url: String,
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Debug, Serialize)]
struct ImportResult {
    imported: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/decision", get(decision_handler))
        .route("/feedback/{domain}", post(feedback_handler))
        .route("/profiles/{domain}/export", get(export_handler))
        .route("/profiles/import", post(import_handler))
        .route("/optimize", post(optimize_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: SocketAddr, orchestrator: Arc<ProfileOrchestrator>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admin api listening");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.get_system_health().await).into_response()
}

async fn decision_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DecisionQuery>,
) -> Response {
    let options = ProfileOptions {
        force_refresh: query.force_refresh,
        ..ProfileOptions::default()
    };
    let decision = state
        .orchestrator
        .get_profile_for_extraction(&query.url, &options)
        .await;
    Json(decision).into_response()
}

async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Json(outcome): Json<ExtractionOutcome>,
) -> Response {
    match state.orchestrator.update_from_extraction(&domain, &outcome).await {
        Some(profile) => Json(json!({
            "updated": true,
            "extraction_count": profile.metadata.extraction_count,
            "revision": profile.revision,
        }))
        .into_response(),
        None => Json(json!({ "updated": false })).into_response(),
    }
}

async fn export_handler(State(state): State<Arc<AppState>>, Path(domain): Path<String>) -> Response {
    match state.orchestrator.export_dip(&domain).await {
        Some(exported) => Json(exported).into_response(),
        None => not_found(&domain),
    }
}

async fn import_handler(State(state): State<Arc<AppState>>, Json(payload): Json<Value>) -> Response {
    let imported = state.orchestrator.import_dip(&payload).await;
    let status = if imported {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(ImportResult { imported })).into_response()
}

async fn optimize_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.optimize().await {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "optimization pass already running" })),
        )
            .into_response(),
    }
}

fn not_found(domain: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no profile for {domain}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use dip_adapters::FixturePageAnalyzer;
    use dip_manager::ProfileManager;
    use dip_storage::MemoryProfileStore;
    use dip_sync::DipConfig;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let config = DipConfig::default();
        let manager = Arc::new(ProfileManager::new(
            config.manager_config(),
            Arc::new(FixturePageAnalyzer::new(fixtures)),
            Arc::new(MemoryProfileStore::new()),
        ));
        app(AppState::new(Arc::new(ProfileOrchestrator::new(config, manager))))
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_cache_and_scheduler() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["cache"]["size"], 0);
        assert_eq!(body["scheduler"]["running"], false);
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn decision_then_feedback_then_export() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/decision?url=https://news.example.org/world")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let decision = json_body(resp).await;
        assert_eq!(decision["strategy"]["preferred"], "browser");
        assert_eq!(decision["metadata"]["is_fallback"], false);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/feedback/news.example.org",
                json!({"success": true, "duration": 1200}),
            ))
            .await
            .unwrap();
        let feedback = json_body(resp).await;
        assert_eq!(feedback["updated"], true);
        assert_eq!(feedback["extraction_count"], 1);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/profiles/news.example.org/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let exported = json_body(resp).await;
        assert_eq!(exported["framework"], "nextjs");
        assert_eq!(exported["has_rate_limit"], true);
        assert_eq!(exported["avg_extraction_time_ms"], 1200.0);
    }

    #[tokio::test]
    async fn unknown_domain_decision_falls_back() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/decision?url=https://unknown.example/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let decision = json_body(resp).await;
        assert_eq!(decision["metadata"]["is_fallback"], true);
        assert_eq!(decision["strategy"]["confidence"], 0.3);
    }

    #[tokio::test]
    async fn import_reports_validation_result() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(post_json("/profiles/import", json!({"domain": "example.com"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(resp).await, json!({"imported": false}));

        let resp = app
            .oneshot(post_json(
                "/profiles/import",
                json!({"domain": "example.com", "version": "1.0"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({"imported": true}));
    }

    #[tokio::test]
    async fn export_of_missing_profile_is_404() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/profiles/example.com/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn optimize_returns_report() {
        let resp = test_app()
            .oneshot(Request::builder().method("POST").uri("/optimize").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report = json_body(resp).await;
        assert_eq!(report["examined"], 0);
        assert!(report["candidates"].as_array().unwrap().is_empty());
    }
}

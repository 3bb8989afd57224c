//! HTTP Surface
//!
//! Operational endpoints: health, Prometheus metrics, quota inspection,
//! atomic configuration reload, and the optional development harness.
//! Request routing itself is a library call, not an HTTP proxy; these
//! endpoints observe and administer the router.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::RouterConfig;
use crate::harness::{self, SimUsageRequest};
use crate::metrics::MetricsExporter;
use crate::router::Router;

/// Shared handles behind every endpoint
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub exporter: MetricsExporter,
    pub config_path: PathBuf,
}

/// Build the application router
///
/// The sim-usage endpoint is mounted only when the current configuration
/// enables the development harness.
pub fn app(state: AppState) -> axum::Router {
    let mut app = axum::Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/quotas", get(quotas_handler))
        .route("/v1/quotas/reload", post(reload_handler));

    if state.router.config().dev_harness_enabled {
        app = app.route("/v1/dev/sim-usage", post(sim_usage_handler));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind and serve until shutdown
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = app(state);
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.exporter.render(Utc::now()) {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => {
            error!(%err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn quotas_handler(State(state): State<AppState>) -> Response {
    let now = Utc::now();
    let config = state.router.config();
    let snapshots: Vec<serde_json::Value> = state
        .router
        .store()
        .snapshots(now)
        .into_iter()
        .map(|(key, snap)| {
            json!({
                "lane": key.lane,
                "model": key.model,
                "limit": snap.limit,
                "consumed": snap.consumed,
                "reserved": snap.reserved,
                "remaining": snap.remaining,
                "window_end": snap.window_end,
            })
        })
        .collect();

    Json(json!({
        "config": &*config,
        "buckets": snapshots,
        "outstanding_reservations": state.router.store().outstanding(),
        "dropped_log_events": state.router.recorder().dropped_events(),
    }))
    .into_response()
}

async fn reload_handler(State(state): State<AppState>) -> Response {
    let config = match RouterConfig::load(&state.config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, path = %state.config_path.display(), "config reload rejected");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    state.router.reload(config, Utc::now());
    Json(json!({"status": "reloaded"})).into_response()
}

async fn sim_usage_handler(
    State(state): State<AppState>,
    Json(request): Json<SimUsageRequest>,
) -> Response {
    // The route is mounted from the startup snapshot; a reload may have
    // turned the harness off since, so the current config decides.
    if !state.router.config().dev_harness_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    match harness::replay(Arc::clone(&state.router), request).await {
        Ok(injected) => Json(json!({"injected": injected})).into_response(),
        Err(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ConfigHandle, LaneConfig};
    use crate::lane::Lane;
    use crate::quota::QuotaStore;
    use crate::usage::UsageRecorder;
    use std::collections::HashMap;

    const MODEL: &str = "claude-haiku-4.5";

    fn state(dir: &tempfile::TempDir, dev_harness: bool) -> AppState {
        let config = RouterConfig {
            lanes: vec![LaneConfig {
                lane: Lane::Anthropic,
                models: HashMap::from([(MODEL.to_string(), 10_000)]),
            }],
            window_secs: 3600,
            grace_secs: 120,
            breaker: BreakerConfig::default(),
            dev_harness_enabled: dev_harness,
            usage_log_path: "logs/usage.jsonl".into(),
        };
        let store = Arc::new(QuotaStore::from_config(&config, Utc::now()));
        let recorder =
            Arc::new(UsageRecorder::open(dir.path().join("usage.jsonl")).unwrap());
        let router = Arc::new(Router::new(
            Arc::new(ConfigHandle::new(config)),
            Arc::clone(&store),
            Arc::clone(&recorder),
        ));
        AppState {
            exporter: MetricsExporter::new(store, recorder),
            router,
            config_path: dir.path().join("config.json"),
        }
    }

    async fn get_status(app: axum::Router, uri: &str) -> StatusCode {
        use tower::ServiceExt;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn test_health_and_metrics_respond() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(&dir, false));
        assert_eq!(get_status(app.clone(), "/health").await, StatusCode::OK);
        assert_eq!(get_status(app, "/metrics").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sim_usage_hidden_without_harness() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(&dir, false));

        use tower::ServiceExt;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/dev/sim-usage")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"model":"claude-haiku-4.5","in":1,"out":1}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sim_usage_injects_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, true);
        let router = Arc::clone(&state.router);
        let app = app(state);

        use tower::ServiceExt;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/dev/sim-usage")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"model":"claude-haiku-4.5","in":100,"out":200,"repeat":3}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let snap = router
            .store()
            .snapshot(Lane::Anthropic, MODEL, Utc::now())
            .unwrap();
        assert_eq!(snap.consumed, 900);
    }

    #[tokio::test]
    async fn test_sim_usage_disabled_by_reload() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, true);
        let router = Arc::clone(&state.router);
        let app = app(state);

        let mut config = (*router.config()).clone();
        config.dev_harness_enabled = false;
        router.reload(config, Utc::now());

        use tower::ServiceExt;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/dev/sim-usage")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"model":"claude-haiku-4.5","in":100,"out":200}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Nothing was injected through the stale route.
        let snap = router
            .store()
            .snapshot(Lane::Anthropic, MODEL, Utc::now())
            .unwrap();
        assert_eq!(snap.consumed, 0);
    }

    #[tokio::test]
    async fn test_reload_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(&dir, false));

        use tower::ServiceExt;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/quotas/reload")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quotas_reports_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(&dir, false));

        use tower::ServiceExt;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/quotas")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["buckets"][0]["limit"], 10_000);
        assert_eq!(value["buckets"][0]["lane"], "anthropic");
    }
}

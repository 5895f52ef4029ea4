pub mod chunks;
pub mod health;
pub mod lock;
pub mod pipelines;
pub mod snapshots;

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use transfer_engine::archive::checksum::{digests_match, sha256_hex};

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .nest("/api/chunks", chunks::router(state.clone()))
        .merge(pipelines::router(state.clone()))
        .nest("/api/snapshots", snapshots::router(state.clone()))
        .route("/api/lock", get(lock::current_lock))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(api)
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rejects requests without `Authorization: Bearer <ADMIN_TOKEN>`.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(AppError::Unauthorized("admin token not configured".into()));
    };
    // Compare digests so the check does not leak the token length
    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| {
            digests_match(&sha256_hex(expected.as_bytes()), &sha256_hex(token.trim().as_bytes()))
        });

    if !authorized {
        return Err(AppError::Unauthorized("missing or invalid admin token".into()));
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use transfer_engine::{Config, TransferContext};

    const TOKEN: &str = "s3cret";

    fn app(dir: &TempDir) -> Router {
        let data_dir = dir.path().join("data");
        let config = AppConfig {
            port: 0,
            db_path: data_dir.join("transfer-server.db"),
            data_dir: data_dir.clone(),
            engine_config: None,
            admin_token: Some(TOKEN.into()),
            log_level: "info".into(),
            sweep_cron: "0 0 * * * *".into(),
        };
        std::fs::create_dir_all(&data_dir).unwrap();
        let pool = create_pool(&config.db_path.to_string_lossy()).unwrap();
        migrate(&pool, &data_dir).unwrap();

        let mut engine = Config::for_site(&dir.path().join("www"), &data_dir);
        engine.site.site_url = "http://site.test".into();
        let paths = engine.site_paths();
        for path in [&paths.uploads, &paths.plugins, &paths.mu_plugins, &paths.themes] {
            std::fs::create_dir_all(path).unwrap();
        }
        let ctx = TransferContext::open(engine).unwrap();
        create_router(Arc::new(AppState::new(pool, config, ctx)))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>, auth: bool) -> (StatusCode, Value) {
        let mut req = axum::http::Request::builder().method(method).uri(uri);
        if auth {
            req = req.header(AUTHORIZATION, format!("Bearer {}", TOKEN));
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_api_requires_admin_token() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let (status, body) = send(&app, Method::GET, "/health", None, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, Method::GET, "/api/lock", None, false).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, body) = send(&app, Method::GET, "/api/lock", None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_chunk_upload_over_http() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let (status, init) = send(&app, Method::POST, "/api/chunks/upload", Some(json!({"total_chunks": 1})), true).await;
        assert_eq!(status, StatusCode::OK);
        let job_id = init["job_id"].as_str().unwrap().to_string();

        let uri = format!("/api/chunks/upload/{}", job_id);
        let (status, body) = send(&app, Method::POST, &uri, Some(json!({"index": 3, "chunk": "aGVsbG8="})), true).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);

        let (status, progress) = send(&app, Method::POST, &uri, Some(json!({"index": 0, "chunk": "aGVsbG8="})), true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["completed"], true);
        assert_eq!(progress["next_index"], 1);

        let (status, job) = send(&app, Method::GET, &format!("/api/chunks/{}", job_id), None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["size"], 5);

        let (status, body) = send(&app, Method::DELETE, &format!("/api/chunks/{}", job_id), None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
        let (status, _) = send(&app, Method::GET, &format!("/api/chunks/{}", job_id), None, true).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_export_runs_in_background_and_lands_in_history() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let (status, started) = send(&app, Method::POST, "/api/exports", Some(json!({"label": "nightly"})), true).await;
        assert_eq!(status, StatusCode::ACCEPTED, "{}", started);
        let storage = started["storage"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for _ in 0..250 {
            let (status, body) = send(&app, Method::GET, &format!("/api/pipelines/{}", storage), None, true).await;
            assert_eq!(status, StatusCode::OK);
            last = body;
            if last["status"]["state"] == "done" || last["status"]["state"] == "error" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(last["status"]["state"], "done", "{}", last);
        assert!(last["params"]["archive_path"].is_string());

        // History is written right after the status file
        let mut runs = Value::Null;
        for _ in 0..50 {
            let (status, body) = send(&app, Method::GET, "/api/runs?limit=5", None, true).await;
            assert_eq!(status, StatusCode::OK);
            runs = body;
            if runs[0]["status"] == "done" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let run = &runs.as_array().unwrap()[0];
        assert_eq!(run["storage"], storage.as_str());
        assert_eq!(run["kind"], "export");
        assert_eq!(run["status"], "done");
        assert!(run["finished_at"].is_string());

        let (status, body) = send(&app, Method::POST, &format!("/api/imports/{}/confirm", storage), None, true).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["state"], "done");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshots_and_rejected_requests() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let (status, _) = send(&app, Method::POST, "/api/imports", Some(json!({})), true).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, snapshot) = send(&app, Method::POST, "/api/snapshots", Some(json!({"label": "before"})), true).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = snapshot["id"].as_str().unwrap().to_string();
        let (status, list) = send(&app, Method::GET, "/api/snapshots", None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, Method::POST, "/api/chunks/download", Some(json!({"source": "../escape.zip"})), true).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, Method::POST, "/api/imports", Some(json!({"archive": "missing.zip"})), true).await;
        // A failed upload step gives the job lock back
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{}", body);
        let (_, lock) = send(&app, Method::GET, "/api/lock", None, true).await;
        assert_eq!(lock, Value::Null);

        let (status, _) = send(&app, Method::POST, &format!("/api/snapshots/{}/restore", id), None, true).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, Method::DELETE, &format!("/api/snapshots/{}", id), None, true).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, Method::GET, &format!("/api/snapshots/{}", id), None, true).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

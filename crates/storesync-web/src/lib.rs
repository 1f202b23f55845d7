//! Axum service that accepts full replacement snapshots from the storefront admin.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use storesync_core::{CATALOG_SNAPSHOT_FILE, SETTINGS_SNAPSHOT_FILE};
use storesync_storage::{write_snapshot, PersistError};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "storesync-web";

const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("STORESYNC_WEB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("STORESYNC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8787),
            data_dir: std::env::var("STORESYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./src/data")),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
}

impl AppState {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn path_for(&self, kind: SnapshotKind) -> PathBuf {
        self.data_dir.join(kind.file_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Settings,
    Catalog,
}

impl SnapshotKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Settings => SETTINGS_SNAPSHOT_FILE,
            Self::Catalog => CATALOG_SNAPSHOT_FILE,
        }
    }

    /// Structural check only: settings are an object, the catalog an array of objects.
    pub fn validate(self, payload: &Value) -> Result<(), WriteError> {
        match (self, payload) {
            (Self::Settings, Value::Object(_)) => Ok(()),
            (Self::Settings, other) => Err(WriteError::MalformedWritePayload(format!(
                "settings payload must be a JSON object, got {}",
                json_type(other)
            ))),
            (Self::Catalog, Value::Array(items)) => {
                match items.iter().position(|item| !item.is_object()) {
                    None => Ok(()),
                    Some(index) => Err(WriteError::MalformedWritePayload(format!(
                        "catalog entry {index} must be a JSON object, got {}",
                        json_type(&items[index])
                    ))),
                }
            }
            (Self::Catalog, other) => Err(WriteError::MalformedWritePayload(format!(
                "catalog payload must be a JSON array, got {}",
                json_type(other)
            ))),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{0}")]
    MalformedWritePayload(String),
    #[error(transparent)]
    PersistenceFailed(#[from] PersistError),
}

impl IntoResponse for WriteError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            Self::MalformedWritePayload(_) => (StatusCode::BAD_REQUEST, "malformed_payload"),
            Self::PersistenceFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence_failed"),
        };
        let body = json!({
            "ok": false,
            "error": {"kind": kind, "message": self.to_string()},
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteAck {
    pub ok: bool,
    pub kind: SnapshotKind,
    pub path: String,
    pub bytes: usize,
    pub sha256: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/snapshots/settings",
            get(read_settings_handler)
                .put(write_settings_handler)
                .post(write_settings_handler),
        )
        .route(
            "/snapshots/catalog",
            get(read_catalog_handler)
                .put(write_catalog_handler)
                .post(write_catalog_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, data_dir = %config.data_dir.display(), "snapshot write service listening");
    axum::serve(listener, app(AppState::new(config.data_dir)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down snapshot write service");
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn write_settings_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<WriteAck>, WriteError> {
    replace_snapshot(&state, SnapshotKind::Settings, &body)
        .await
        .map(Json)
}

async fn write_catalog_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<WriteAck>, WriteError> {
    replace_snapshot(&state, SnapshotKind::Catalog, &body)
        .await
        .map(Json)
}

async fn read_settings_handler(State(state): State<Arc<AppState>>) -> Response {
    current_snapshot(&state, SnapshotKind::Settings).await
}

async fn read_catalog_handler(State(state): State<Arc<AppState>>) -> Response {
    current_snapshot(&state, SnapshotKind::Catalog).await
}

/// Validate a caller-supplied payload and persist it as the full replacement
/// for `kind`. Nothing is written when validation fails.
pub async fn replace_snapshot(
    state: &AppState,
    kind: SnapshotKind,
    body: &[u8],
) -> Result<WriteAck, WriteError> {
    let payload: Value = serde_json::from_slice(body).map_err(|err| {
        WriteError::MalformedWritePayload(format!("body is not valid JSON: {err}"))
    })?;
    if let Err(err) = kind.validate(&payload) {
        warn!(?kind, error = %err, "rejected snapshot payload");
        return Err(err);
    }

    let path = state.path_for(kind);
    let written = write_snapshot(&path, &payload).await.map_err(|err| {
        error!(?kind, error = %err, "snapshot write failed");
        WriteError::from(err)
    })?;
    info!(?kind, path = %written.path.display(), bytes = written.bytes, "snapshot replaced");
    Ok(WriteAck {
        ok: true,
        kind,
        path: written.path.display().to_string(),
        bytes: written.bytes,
        sha256: written.sha256,
    })
}

async fn current_snapshot(state: &AppState, kind: SnapshotKind) -> Response {
    let path = state.path_for(kind);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": {"kind": "not_found", "message": format!("{} has not been written yet", kind.file_name())}})),
        )
            .into_response(),
        Err(err) => {
            error!(path = %path.display(), error = %err, "reading snapshot failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": {"kind": "read_failed", "message": err.to_string()}})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn send(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(app(AppState::new(dir.path())), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn settings_replace_persists_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(dir.path().join("data")));

        let (status, ack) = send(
            app.clone(),
            "PUT",
            "/snapshots/settings",
            r#"{"store_name":"Acme","currency":"USD"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["ok"], json!(true));
        assert_eq!(ack["kind"], json!("settings"));

        let content = std::fs::read_to_string(dir.path().join("data/store-settings.json")).unwrap();
        assert_eq!(content, "{\n  \"currency\": \"USD\",\n  \"store_name\": \"Acme\"\n}");

        let (status, current) = send(app, "GET", "/snapshots/settings", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current["store_name"], json!("Acme"));
    }

    #[tokio::test]
    async fn non_array_catalog_is_rejected_and_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("products.json");
        std::fs::write(&catalog, "[\n  {\n    \"id\": \"p1\"\n  }\n]").unwrap();
        let app = app(AppState::new(dir.path()));

        let (status, body) = send(app.clone(), "POST", "/snapshots/catalog", r#"{"id":"p2"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], json!("malformed_payload"));

        let (status, _) = send(app.clone(), "PUT", "/snapshots/catalog", "[1, 2]").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app, "PUT", "/snapshots/catalog", "[{\"id\": ").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not valid JSON"));

        assert_eq!(
            std::fs::read_to_string(&catalog).unwrap(),
            "[\n  {\n    \"id\": \"p1\"\n  }\n]"
        );
    }

    #[tokio::test]
    async fn catalog_replace_and_missing_snapshot_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(dir.path()));

        let (status, _) = send(app.clone(), "GET", "/snapshots/catalog", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app.clone(), "PUT", "/snapshots/catalog", "[]").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("products.json")).unwrap(),
            "[]"
        );

        let (status, current) = send(app, "GET", "/snapshots/catalog", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current, json!([]));
    }

    #[tokio::test]
    async fn unwritable_snapshot_reports_persistence_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("products.json/keep")).unwrap();
        let app = app(AppState::new(dir.path()));

        let (status, body) = send(app, "PUT", "/snapshots/catalog", r#"[{"id":"p1"}]"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["error"]["kind"], json!("persistence_failed"));
        assert!(dir.path().join("products.json/keep").is_dir());
    }

    #[tokio::test]
    async fn settings_must_be_an_object() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(
            app(AppState::new(dir.path())),
            "PUT",
            "/snapshots/settings",
            "[]",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("must be a JSON object"));
        assert!(!dir.path().join("store-settings.json").exists());
    }
}

//! In-process HTTP backend for tests: serves model artifacts and update checks.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const ARTIFACT_LEN: usize = 1024;
const SLOW_CHUNK: usize = 128;
const SLOW_DELAY: Duration = Duration::from_millis(40);

#[derive(Default)]
struct Backend {
    artifact_hits: AtomicUsize,
    update: Mutex<serde_json::Value>,
    last_current_version: Mutex<Option<String>>,
}

pub(crate) struct ArtifactServer {
    addr: SocketAddr,
    backend: Arc<Backend>,
}

impl ArtifactServer {
    pub(crate) async fn start() -> Self {
        let backend = Arc::new(Backend {
            update: Mutex::new(serde_json::json!({ "hasUpdate": false, "version": 1 })),
            ..Backend::default()
        });
        let app = Router::new()
            .route("/model/:version", get(model))
            .route("/slow/:version", get(slow_model))
            .route("/empty", get(|| async { StatusCode::OK }))
            .route("/status/:code", get(status))
            .route("/garbage", get(|| async { "definitely not json" }))
            .route("/update", get(update))
            .with_state(backend.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, backend }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Deterministic 1 KiB artifact for `version`.
    pub(crate) fn artifact(version: u32) -> Vec<u8> {
        (0..ARTIFACT_LEN)
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(version) as u8)
            .collect()
    }

    /// Number of artifact requests (`/model`, `/slow`) served so far.
    pub(crate) fn hits(&self) -> usize {
        self.backend.artifact_hits.load(Ordering::SeqCst)
    }

    pub(crate) fn set_update(&self, payload: serde_json::Value) {
        *self.backend.update.lock().unwrap() = payload;
    }

    pub(crate) fn last_current_version(&self) -> Option<String> {
        self.backend.last_current_version.lock().unwrap().clone()
    }
}

async fn model(State(backend): State<Arc<Backend>>, Path(version): Path<u32>) -> Vec<u8> {
    backend.artifact_hits.fetch_add(1, Ordering::SeqCst);
    ArtifactServer::artifact(version)
}

async fn slow_model(
    State(backend): State<Arc<Backend>>,
    Path(version): Path<u32>,
) -> impl IntoResponse {
    backend.artifact_hits.fetch_add(1, Ordering::SeqCst);
    let data = ArtifactServer::artifact(version);
    let chunks: Vec<Vec<u8>> = data.chunks(SLOW_CHUNK).map(|c| c.to_vec()).collect();
    let stream = futures_util::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(SLOW_DELAY).await;
        Ok::<_, std::io::Error>(chunk)
    });
    (
        [(header::CONTENT_LENGTH, data.len().to_string())],
        Body::from_stream(stream),
    )
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn update(
    State(backend): State<Arc<Backend>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    *backend.last_current_version.lock().unwrap() = params.get("currentVersion").cloned();
    Json(backend.update.lock().unwrap().clone())
}

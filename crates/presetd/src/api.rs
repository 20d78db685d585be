use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::routing::put;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::app::ControlError;
use crate::device::DeviceError;
use crate::presets::Descriptor;
use crate::presets::PresetError;
use crate::presets::PresetSlot;
use crate::store::Device;
use crate::store::Preset;
use crate::sync::SyncError;
use crate::sync::SyncPhase;
use crate::sync::SyncResult;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Response for GET /v1/sync
#[derive(Serialize)]
struct SyncStatusResponse {
    phase: SyncPhase,
    last: Option<SyncResult>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Body of PUT /v1/devices/{id}/presets/{slot}
#[derive(Debug, Deserialize)]
struct AssignPresetRequest {
    name: String,
    url: String,
}

/// Shared application state
struct AppState {
    version: &'static str,
    app: Arc<App>,
}

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Sync(SyncError),
    Preset(PresetError),
    Control(ControlError),
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError::Sync(e)
    }
}

impl From<PresetError> for ApiError {
    fn from(e: PresetError) -> Self {
        ApiError::Preset(e)
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError::Control(e)
    }
}

fn device_status(e: &DeviceError) -> StatusCode {
    match e {
        DeviceError::PresetsUnsupported { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DeviceError::Unreachable { .. }
        | DeviceError::Protocol { .. }
        | DeviceError::Rejected { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Sync(e) => {
                let status = match e {
                    SyncError::InProgress => StatusCode::CONFLICT,
                    SyncError::DiscoveryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
            ApiError::Preset(e) => {
                let status = match &e {
                    PresetError::UnknownDevice(_) => StatusCode::NOT_FOUND,
                    PresetError::Invalid(_) => StatusCode::BAD_REQUEST,
                    PresetError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    PresetError::Device(e) => device_status(e),
                };
                (status, e.to_string())
            }
            ApiError::Control(e) => {
                let status = match &e {
                    ControlError::UnknownDevice(_) => StatusCode::NOT_FOUND,
                    ControlError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    ControlError::Device(e) => device_status(e),
                };
                (status, e.to_string())
            }
        };

        if status.is_server_error() {
            tracing::error!("{}", message);
        }
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn parse_slot(slot: u32) -> Result<PresetSlot, ApiError> {
    PresetSlot::try_from(slot).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Handler for GET /descriptor/{device_id}/{slot}
///
/// Called by the speaker itself when a preset button is pressed. Unassigned slots still
/// get a well-formed descriptor so the device never stalls on an error page.
#[tracing::instrument(skip(state))]
async fn descriptor(
    State(state): State<Arc<AppState>>,
    Path((device_id, slot)): Path<(String, u32)>,
) -> Result<Json<Descriptor>, ApiError> {
    let slot = parse_slot(slot)?;
    Ok(Json(state.app.resolve(&device_id, slot).into_descriptor()))
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Handler for POST /v1/sync
#[tracing::instrument(skip(state))]
async fn run_sync(State(state): State<Arc<AppState>>) -> Result<Json<SyncResult>, ApiError> {
    Ok(Json(state.app.sync().await?))
}

/// Handler for GET /v1/sync
#[tracing::instrument(skip(state))]
async fn sync_status(State(state): State<Arc<AppState>>) -> Json<SyncStatusResponse> {
    Json(SyncStatusResponse {
        phase: state.app.sync_phase(),
        last: state.app.last_sync().map(|result| (*result).clone()),
    })
}

#[tracing::instrument(skip(state))]
async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<Device>> {
    Json(state.app.list_devices())
}

#[tracing::instrument(skip(state))]
async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    state
        .app
        .device(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown device: {}", id)))
}

#[tracing::instrument(skip(state))]
async fn remove_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(state.app.remove_device(&id).await?))
}

#[tracing::instrument(skip(state))]
async fn now_playing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(match state.app.now_playing(&id).await? {
        Some(playing) => Json(playing).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[tracing::instrument(skip(state))]
async fn list_presets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Preset>>, ApiError> {
    Ok(Json(state.app.list_presets(&id)?))
}

#[tracing::instrument(skip(state))]
async fn assign_preset(
    State(state): State<Arc<AppState>>,
    Path((id, slot)): Path<(String, u32)>,
    Json(request): Json<AssignPresetRequest>,
) -> Result<Json<Preset>, ApiError> {
    let slot = parse_slot(slot)?;
    let preset = state
        .app
        .assign_preset(&id, slot, &request.name, &request.url)
        .await?;
    Ok(Json(preset))
}

#[tracing::instrument(skip(state))]
async fn clear_preset(
    State(state): State<Arc<AppState>>,
    Path((id, slot)): Path<(String, u32)>,
) -> Result<StatusCode, ApiError> {
    let slot = parse_slot(slot)?;
    state.app.clear_preset(&id, slot).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
async fn press_preset(
    State(state): State<Arc<AppState>>,
    Path((id, slot)): Path<(String, u32)>,
) -> Result<StatusCode, ApiError> {
    let slot = parse_slot(slot)?;
    state.app.press_preset(&id, slot).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the API router with all endpoints
fn create_router(app: Arc<App>) -> Router {
    let state = Arc::new(AppState {
        version: env!("CARGO_PKG_VERSION"),
        app,
    });

    Router::new()
        .route("/descriptor/:device_id/:slot", get(descriptor))
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/sync", get(sync_status).post(run_sync))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/:id", get(get_device).delete(remove_device))
        .route("/v1/devices/:id/now_playing", get(now_playing))
        .route("/v1/devices/:id/presets", get(list_presets))
        .route(
            "/v1/devices/:id/presets/:slot",
            put(assign_preset).delete(clear_preset),
        )
        .route("/v1/devices/:id/presets/:slot/press", post(press_preset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server
///
/// Serves both the control API and the descriptor endpoint speakers call back into.
/// Runs until the provided shutdown signal is triggered.
pub async fn serve(
    app: Arc<App>,
    listen: IpAddr,
    port: u16,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let router = create_router(app);

    let addr = SocketAddr::new(listen, port);
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP server shutting down gracefully");
        })
        .await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use axum::http::header;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;

    fn router() -> Router {
        let (config, _) = Config::from_toml_str(
            r#"
[server]
public_url = "http://192.0.2.1:8000"

[discovery]
backend = "fixture"
"#,
        )
        .unwrap();
        create_router(Arc::new(App::from_config(&config).unwrap()))
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_ping() {
        let router = router();
        let (status, body) = send(&router, "GET", "/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unassigned_descriptor_is_empty() {
        let router = router();
        let (status, body) = send(&router, "GET", "/descriptor/F1X7C0DE0001/4", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "");
        assert_eq!(body["audio"]["streamUrl"], "");
    }

    #[tokio::test]
    async fn test_descriptor_slot_out_of_range() {
        let router = router();
        let (status, _) = send(&router, "GET", "/descriptor/F1X7C0DE0001/7", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&router, "GET", "/descriptor/F1X7C0DE0001/0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_then_assign_and_resolve() {
        let router = router();

        let (status, body) = send(&router, "POST", "/v1/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["discovered"], 3);
        assert_eq!(body["synced"], 3);

        let (status, body) = send(&router, "GET", "/v1/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);

        let (status, body) = send(
            &router,
            "PUT",
            "/v1/devices/F1X7C0DE0002/presets/1",
            Some(serde_json::json!({"name": "Jazz FM", "url": "http://stream/jazz"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Jazz FM");

        let (_, body) = send(&router, "GET", "/descriptor/F1X7C0DE0002/1", None).await;
        assert_eq!(body["name"], "Jazz FM");
        assert_eq!(body["audio"]["streamUrl"], "http://stream/jazz");

        let (status, _) = send(&router, "DELETE", "/v1/devices/F1X7C0DE0002/presets/1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&router, "GET", "/descriptor/F1X7C0DE0002/1", None).await;
        assert_eq!(body["name"], "");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let router = router();

        let (status, body) = send(&router, "GET", "/v1/devices/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown device: missing");

        let (status, _) = send(
            &router,
            "PUT",
            "/v1/devices/missing/presets/1",
            Some(serde_json::json!({"name": "Jazz", "url": "http://stream/jazz"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&router, "POST", "/v1/sync", None).await;
        let (status, _) = send(
            &router,
            "PUT",
            "/v1/devices/F1X7C0DE0001/presets/2",
            Some(serde_json::json!({"name": "Jazz", "url": "ftp://stream/jazz"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_status_reports_last_result() {
        let router = router();
        let (_, body) = send(&router, "GET", "/v1/sync", None).await;
        assert_eq!(body["phase"], "idle");
        assert!(body["last"].is_null());

        send(&router, "POST", "/v1/sync", None).await;
        let (_, body) = send(&router, "GET", "/v1/sync", None).await;
        assert_eq!(body["phase"], "done");
        assert_eq!(body["last"]["synced"], 3);
    }
}

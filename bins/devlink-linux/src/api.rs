//! HTTP facade over the shell.
//!
//! # Endpoints
//!
//! - `GET  /api/sessions` known devices
//! - `GET  /api/state` link and provisioning state of the active device
//! - `GET  /api/diagnostics` runtime counters
//! - `GET  /api/plugins` plugin list with lifecycle state
//! - `GET  /api/panels/:name` latest values rendered by one panel
//! - `GET  /api/telemetry/*topic` cached values matching a topic pattern
//! - `POST /api/commands` publish a command, optionally waiting for the reply
//! - `POST /api/connect`, `POST /api/disconnect`, `POST /api/portal/probe`
//! - `POST /api/provisioning/{scan,credentials,retry,reset}`

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use devlink_core::PluginId;
use devlink_plugins::PanelStore;
use devlink_runtime::{
    BusError, Command, Endpoint, ProvisioningError, Shell, TransportError,
};

#[derive(Clone)]
pub struct AppState {
    pub shell: Arc<Shell>,
    pub panels: PanelStore,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(sessions))
        .route("/api/state", get(device_state))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/plugins", get(plugins))
        .route("/api/panels/:name", get(panel))
        .route("/api/telemetry/*topic", get(telemetry))
        .route("/api/commands", post(command))
        .route("/api/connect", post(connect))
        .route("/api/disconnect", post(disconnect))
        .route("/api/portal/probe", post(probe_portal))
        .nest("/api/provisioning", provisioning_routes())
        .with_state(state)
}

fn provisioning_routes() -> Router<AppState> {
    Router::new()
        .route("/scan", post(scan))
        .route("/credentials", post(credentials))
        .route("/retry", post(retry))
        .route("/reset", post(factory_reset))
}

/// An error rendered as `{ "error": message }`.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        let status = match &e {
            TransportError::NotConnected | TransportError::QueueFull => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TransportError::ConnectTimeout { .. } | TransportError::ReplyTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            TransportError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::BAD_GATEWAY,
        };
        ApiError(status, e.to_string())
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Transport(e) => e.into(),
            BusError::Rejected { .. } => ApiError(StatusCode::BAD_GATEWAY, e.to_string()),
            BusError::SchemaViolation(_) | BusError::Pattern(_) => {
                ApiError(StatusCode::BAD_REQUEST, e.to_string())
            }
            BusError::UndeclaredTopic { .. } | BusError::Reserved { .. } => {
                ApiError(StatusCode::FORBIDDEN, e.to_string())
            }
        }
    }
}

impl From<ProvisioningError> for ApiError {
    fn from(e: ProvisioningError) -> Self {
        match e {
            ProvisioningError::Bus(e) => e.into(),
            ProvisioningError::InvalidCredentials(_) => {
                ApiError(StatusCode::BAD_REQUEST, e.to_string())
            }
            ProvisioningError::InvalidTransition { .. } => {
                ApiError(StatusCode::CONFLICT, e.to_string())
            }
        }
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.shell.sessions()))
}

async fn device_state(State(state): State<AppState>) -> Json<Value> {
    let link = *state.shell.link_state().borrow();
    let provisioning = state.shell.active_state().borrow().clone();
    Json(json!({
        "link": link,
        "provisioning": provisioning,
        "active": state.shell.active_session(),
    }))
}

async fn diagnostics(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.shell.diagnostics()))
}

async fn plugins(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.shell.plugins()))
}

async fn panel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .panels
        .snapshot(&PluginId::new(name))
        .map(|snapshot| Json(json!(snapshot)))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn telemetry(State(state): State<AppState>, Path(topic): Path<String>) -> ApiResult {
    let values: Vec<Value> = state
        .shell
        .cached(&topic)?
        .into_iter()
        .map(|cached| {
            json!({
                "topic": cached.event.topic,
                "seq": cached.event.seq,
                "payload": cached.event.payload,
                "receivedAt": cached.event.received_at,
                "ageMs": cached.age.as_millis() as u64,
                "stale": cached.stale,
            })
        })
        .collect();
    Ok(Json(json!(values)))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    topic: String,
    #[serde(default)]
    payload: Value,
    /// Wait for the device reply instead of returning once queued.
    #[serde(default)]
    wait: bool,
}

async fn command(State(state): State<AppState>, Json(req): Json<CommandRequest>) -> ApiResult {
    let command = Command::new(req.topic, req.payload);
    if req.wait {
        let reply = state.shell.request(command).await?;
        Ok(Json(json!(reply)))
    } else {
        let id = state.shell.publish(command)?;
        Ok(Json(json!({ "id": id })))
    }
}

async fn connect(State(state): State<AppState>, Json(endpoint): Json<Endpoint>) -> ApiResult {
    let id = state.shell.connect(endpoint).await?;
    Ok(Json(json!({ "deviceId": id })))
}

async fn disconnect(State(state): State<AppState>) -> StatusCode {
    state.shell.disconnect().await;
    StatusCode::NO_CONTENT
}

async fn probe_portal(State(state): State<AppState>) -> ApiResult {
    let found = state.shell.probe_portal().await?;
    Ok(Json(json!(found)))
}

async fn scan(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.shell.provisioning().request_scan().await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct Credentials {
    ssid: String,
    #[serde(default)]
    password: String,
}

async fn credentials(
    State(state): State<AppState>,
    Json(creds): Json<Credentials>,
) -> Result<StatusCode, ApiError> {
    state
        .shell
        .provisioning()
        .submit_credentials(&creds.ssid, &creds.password)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn retry(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.shell.provisioning().retry().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn factory_reset(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.shell.provisioning().factory_reset().await?;
    Ok(StatusCode::ACCEPTED)
}

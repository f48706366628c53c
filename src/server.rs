//! # Server Module
//!
//! HTTP and WebSocket surface over the device manager, the hub and the query
//! service.
//!
//! ## Routes
//! - `GET /ws`: live feed. Each client is one hub viewer; it may also send
//!   `{"action":"scan"}`, `{"action":"connect","address":..}` or
//!   `{"action":"disconnect"}` and gets a `{"type":..}` reply back.
//! - `GET /api/scan`, `POST /api/connect`, `POST /api/disconnect`
//! - `GET /api/status`: device state, latest sample, viewers, store health
//! - `GET /api/history?granularity=raw|minute|hour|day&from=&to=&limit=`

use crate::connection::DeviceHandle;
use crate::device_scanner::DiscoveredDevice;
use crate::error::{ConnectionError, ScanError, StoreError};
use crate::hub::TelemetryHub;
use crate::phase::DeviceState;
use crate::query::{History, HistoryQuery, QueryService};
use crate::sample::Sample;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub hub: TelemetryHub,
    pub device: DeviceHandle,
    pub queries: QueryService,
    /// Ends live feeds so graceful shutdown is not held up by open sockets
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/scan", get(scan))
        .route("/api/connect", post(connect))
        .route("/api/disconnect", post(disconnect))
        .route("/api/status", get(status))
        .route("/api/history", get(history))
        .with_state(state)
}

/// Serve until the state's shutdown token fires
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Listening on {}", addr);
    }
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Server shutting down");
        })
        .await
}

/// Control messages a WebSocket client may send
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Scan,
    Connect { address: String },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    ScanResult { devices: Vec<DiscoveredDevice> },
    Connected { address: String },
    Disconnected,
    Error { message: String },
}

impl ControlReply {
    fn error(err: impl std::fmt::Display) -> Self {
        ControlReply::Error {
            message: err.to_string(),
        }
    }
}

pub async fn control(device: &DeviceHandle, text: &str) -> ControlReply {
    let request = match serde_json::from_str::<ControlRequest>(text) {
        Ok(request) => request,
        Err(e) => return ControlReply::error(format!("invalid control message: {}", e)),
    };

    match request {
        ControlRequest::Scan => match device.scan().await {
            Ok(devices) => ControlReply::ScanResult { devices },
            Err(e) => ControlReply::error(e),
        },
        ControlRequest::Connect { address } => match device.connect(address.clone()).await {
            Ok(()) => ControlReply::Connected { address },
            Err(e) => ControlReply::error(e),
        },
        ControlRequest::Disconnect => match device.disconnect().await {
            Ok(()) => ControlReply::Disconnected,
            Err(e) => ControlReply::error(e),
        },
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws_client(socket, state))
}

async fn handle_ws_client(mut socket: WebSocket, state: AppState) {
    let viewer = state.hub.subscribe();
    let (reply_tx, mut replies) = mpsc::channel::<ControlReply>(8);
    log::info!("WebSocket client connected (viewer {})", viewer.id());

    loop {
        let outgoing = tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            event = viewer.recv() => match event {
                Some(event) => serde_json::to_string(&event),
                None => break,
            },
            Some(reply) = replies.recv() => serde_json::to_string(&reply),
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // control calls can take a whole scan window; keep the feed flowing
                        let device = state.device.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let _ = reply_tx.send(control(&device, &text).await).await;
                        });
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
                continue;
            }
        };

        match outgoing {
            Ok(json) => {
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Err(e) => log::error!("Failed to encode feed message: {}", e),
        }
    }

    log::info!(
        "WebSocket client disconnected (viewer {}, {} events dropped)",
        viewer.id(),
        viewer.dropped()
    );
}

/// Error body for the REST routes
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        let status = match err {
            ScanError::ScanFailed(_) => StatusCode::BAD_GATEWAY,
            ScanError::AdapterUnavailable | ScanError::ManagerUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        ApiError { status, message: err.to_string() }
    }
}

impl From<ConnectionError> for ApiError {
    fn from(err: ConnectionError) -> Self {
        let status = match err {
            ConnectionError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            ConnectionError::ConnectFailed { .. } | ConnectionError::NotificationTimeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            ConnectionError::AdapterUnavailable | ConnectionError::ManagerUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        ApiError { status, message: err.to_string() }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub degraded: bool,
    pub pending: usize,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub device: DeviceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<Sample>,
    pub viewers: usize,
    pub store: StoreHealth,
}

async fn scan(State(state): State<AppState>) -> Result<Json<Vec<DiscoveredDevice>>, ApiError> {
    Ok(Json(state.device.scan().await?))
}

async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.device.connect(request.address.clone()).await?;
    Ok(Json(serde_json::json!({ "status": "connected", "address": request.address })))
}

async fn disconnect(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.device.disconnect().await?;
    Ok(Json(serde_json::json!({ "status": "disconnected" })))
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let store = state.hub.store();
    Json(StatusReport {
        device: state.hub.device_state(),
        latest: state.hub.latest(),
        viewers: state.hub.viewer_count(),
        store: StoreHealth {
            degraded: store.is_degraded(),
            pending: store.pending(),
            dropped: store.dropped(),
        },
    })
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<History>, ApiError> {
    Ok(Json(state.queries.history(query).await?))
}

use std::collections::BTreeMap;
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
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::device::Device;
use crate::device::DeviceTopic;
use crate::entity::Entity;
use crate::error::UpdateError;
use crate::feed::ReleaseFeed;
use crate::mqtt::MqttClient;
use crate::update::UpdateAggregator;

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

/// One entry of the /v1/devices listing
#[derive(Serialize)]
struct DeviceSummary {
    id: String,
    name: String,
    topic: DeviceTopic,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared application state
pub struct AppState<C: MqttClient, F: ReleaseFeed> {
    pub version: &'static str,
    pub aggregator: Arc<UpdateAggregator<C, F>>,
    pub devices: BTreeMap<String, Device>,
}

impl<C: MqttClient, F: ReleaseFeed> AppState<C, F> {
    fn device(&self, id: &str) -> Result<&Device, UpdateError> {
        self.devices
            .get(id)
            .ok_or_else(|| UpdateError::UnknownDevice(id.to_string()))
    }
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for UpdateError {
    fn into_response(self) -> Response {
        let status = match &self {
            UpdateError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            UpdateError::Feed(_) => StatusCode::SERVICE_UNAVAILABLE,
            UpdateError::MalformedResponse { .. }
            | UpdateError::Timeout { .. }
            | UpdateError::CommandDeliveryFailed { .. }
            | UpdateError::Mqtt(_) => StatusCode::BAD_GATEWAY,
        };
        error_response(status, self)
    }
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
async fn info<C: MqttClient, F: ReleaseFeed>(
    State(state): State<Arc<AppState<C, F>>>,
) -> impl IntoResponse {
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

/// Handler for GET /v1/devices
async fn list_devices<C: MqttClient, F: ReleaseFeed>(
    State(state): State<Arc<AppState<C, F>>>,
) -> impl IntoResponse {
    let devices: Vec<DeviceSummary> = state
        .devices
        .iter()
        .map(|(id, device)| DeviceSummary {
            id: id.clone(),
            name: device.name.clone(),
            topic: device.topic.clone(),
        })
        .collect();
    Json(devices)
}

/// Handler for GET /v1/devices/:id/update
#[tracing::instrument(skip(state))]
async fn device_update<C: MqttClient, F: ReleaseFeed>(
    State(state): State<Arc<AppState<C, F>>>,
    Path(id): Path<String>,
) -> Result<Response, UpdateError> {
    let device = state.device(&id)?;

    match state.aggregator.entity(device).await? {
        Some(entity) => Ok((StatusCode::OK, Json(entity.state_json())).into_response()),
        None => Ok(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "update check unavailable",
        )),
    }
}

/// Handler for POST /v1/devices/:id/install
#[tracing::instrument(skip(state))]
async fn device_install<C: MqttClient, F: ReleaseFeed>(
    State(state): State<Arc<AppState<C, F>>>,
    Path(id): Path<String>,
) -> Result<Response, UpdateError> {
    let device = state.device(&id)?;
    state.aggregator.install_firmware(&device.topic).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PingResponse {
            status: "accepted".to_string(),
        }),
    )
        .into_response())
}

/// Create the API router with all endpoints
pub fn create_router<C, F>(state: Arc<AppState<C, F>>) -> Router
where
    C: MqttClient + 'static,
    F: ReleaseFeed + 'static,
{
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info::<C, F>))
        .route("/v1/devices", get(list_devices::<C, F>))
        .route("/v1/devices/:id/update", get(device_update::<C, F>))
        .route("/v1/devices/:id/install", post(device_install::<C, F>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// This function will bind to the specified address and serve the API endpoints.
/// It will run until the provided shutdown signal is triggered.
///
/// # Arguments
/// * `listen` - The IP address to listen on (e.g., "127.0.0.1")
/// * `port` - The port to listen on (e.g., 8565)
/// * `state` - Devices and the aggregator that serves them
/// * `shutdown_rx` - A oneshot receiver that will trigger graceful shutdown
pub async fn serve<C, F>(
    listen: &str,
    port: u16,
    state: Arc<AppState<C, F>>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()>
where
    C: MqttClient + 'static,
    F: ReleaseFeed + 'static,
{
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

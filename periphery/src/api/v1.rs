//! API version 1 endpoints.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::{
    actuator::SharedActuator,
    registry::{self, DriverDescriptor},
    sensor::ReadingSource,
};

/// An attached device as the API sees it.
#[derive(Clone)]
pub struct DeviceEntry {
    pub driver: &'static str,
    /// I2C address, for I2C parts
    pub address: Option<u8>,
    /// Latest readings, for devices that are sampled
    pub source: Option<Arc<dyn ReadingSource>>,
    /// Names of the outputs this device registered
    pub outputs: Vec<String>,
}

/// A settable output and the device it belongs to.
#[derive(Clone)]
pub struct OutputEntry {
    pub device: String,
    pub actuator: SharedActuator,
}

/// A configured device that failed to attach.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailedDeviceStatus {
    pub name: String,
    pub driver: String,
    /// Error message describing why attachment failed
    pub error: String,
}

/// Device status for API responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub driver: String,
    /// I2C address as `0xNN`
    pub address: Option<String>,
    /// Whether the device is still being sampled
    pub updating: bool,
    /// Latest reading, absent until the first successful sample
    pub reading: Option<serde_json::Value>,
    pub outputs: Vec<String>,
}

/// Complete device list including devices that failed to attach.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceStatus>,
    pub failed_devices: Vec<FailedDeviceStatus>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputStatus {
    pub name: String,
    pub device: String,
    pub driver: String,
    pub unit: String,
    pub min: f32,
    pub max: f32,
    /// Setpoint outside `min..=max` that turns the output off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off: Option<f32>,
}

/// Shared application state for API endpoints.
#[derive(Clone, Default)]
pub struct AppState {
    /// Attached devices by name
    pub devices: Arc<RwLock<BTreeMap<String, DeviceEntry>>>,
    /// Settable outputs by name
    pub outputs: Arc<RwLock<BTreeMap<String, OutputEntry>>>,
    /// Devices that failed to attach
    pub failed_devices: Arc<RwLock<Vec<FailedDeviceStatus>>>,
}

impl AppState {
    /// Create a new empty application state.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_device(&self, name: String, entry: DeviceEntry) {
        debug!(device = %name, driver = entry.driver, "Registering device with API");
        self.devices.write().await.insert(name, entry);
    }

    pub async fn unregister_device(&self, name: &str) {
        let removed = self.devices.write().await.remove(name);
        if let Some(entry) = removed {
            let mut outputs = self.outputs.write().await;
            for output in &entry.outputs {
                outputs.remove(output);
            }
        }
    }

    pub async fn register_output(&self, name: String, device: &str, actuator: SharedActuator) {
        debug!(output = %name, device, "Registering output with API");
        self.outputs.write().await.insert(
            name,
            OutputEntry {
                device: device.to_string(),
                actuator,
            },
        );
    }

    /// Register a failed device attachment attempt.
    pub async fn register_failed_device(&self, failed: FailedDeviceStatus) {
        debug!(
            device = %failed.name,
            driver = %failed.driver,
            error = %failed.error,
            "Registering failed device"
        );
        self.failed_devices.write().await.push(failed);
    }

    pub async fn device_status(&self, name: &str) -> Option<DeviceStatus> {
        let devices = self.devices.read().await;
        devices.get(name).map(|entry| status_of(name, entry))
    }

    /// Every attached device with its latest reading, and every failure.
    pub async fn device_list(&self) -> DeviceListResponse {
        let devices = self.devices.read().await;
        let failed = self.failed_devices.read().await;
        debug!(
            device_count = devices.len(),
            failed_count = failed.len(),
            "Getting device list"
        );
        DeviceListResponse {
            devices: devices
                .iter()
                .map(|(name, entry)| status_of(name, entry))
                .collect(),
            failed_devices: failed.clone(),
        }
    }

    pub async fn output_list(&self) -> Vec<OutputStatus> {
        let outputs: Vec<(String, OutputEntry)> = self
            .outputs
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        join_all(outputs.into_iter().map(|(name, entry)| async move {
            let actuator = entry.actuator.lock().await;
            let range = actuator.range();
            OutputStatus {
                name,
                device: entry.device.clone(),
                driver: actuator.name().to_string(),
                unit: actuator.unit().to_string(),
                min: *range.start(),
                max: *range.end(),
                off: actuator.off_value(),
            }
        }))
        .await
    }
}

fn status_of(name: &str, entry: &DeviceEntry) -> DeviceStatus {
    DeviceStatus {
        name: name.to_string(),
        driver: entry.driver.to_string(),
        address: entry.address.map(|a| format!("0x{a:02X}")),
        updating: entry.source.as_ref().is_some_and(|s| s.is_updating()),
        reading: entry.source.as_ref().and_then(|s| s.latest_json()),
        outputs: entry.outputs.clone(),
    }
}

/// Echo request payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EchoRequest {
    /// The message to echo back.
    pub message: String,
}

/// Echo response payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EchoResponse {
    /// The echoed message.
    pub message: String,
}

/// Set output request payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetOutputRequest {
    pub value: f32,
}

/// Set output response payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetOutputResponse {
    pub name: String,
    pub requested: f32,
    /// What the driver reports back after applying
    pub applied: f32,
    pub unit: String,
}

/// API error response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

/// Echo endpoint handler.
///
/// Echoes back the provided message. Useful for testing API connectivity.
async fn echo(Json(req): Json<EchoRequest>) -> Json<EchoResponse> {
    Json(EchoResponse {
        message: req.message,
    })
}

/// Health check endpoint handler.
async fn health() -> &'static str {
    "OK"
}

/// Driver catalog handler.
async fn list_drivers() -> Json<Vec<&'static DriverDescriptor>> {
    Json(registry::drivers())
}

/// List devices endpoint handler.
///
/// # Example
/// ```bash
/// curl http://localhost:7785/api/v1/devices
/// ```
async fn list_devices(State(state): State<AppState>) -> Json<DeviceListResponse> {
    Json(state.device_list().await)
}

async fn get_device(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.device_status(&name).await {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("Device '{name}' not found")),
    }
}

async fn list_outputs(State(state): State<AppState>) -> Json<Vec<OutputStatus>> {
    Json(state.output_list().await)
}

/*  Set output endpoint handler.

    Applies a setpoint to one output. The value must lie in the output's
    range or be its off value; the response carries what the driver reports
    back.

    curl -X POST http://localhost:7785/api/v1/outputs/core \
       -H "Content-Type: application/json" \
       -d '{"value": 1.2}'
*/
async fn set_output(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SetOutputRequest>,
) -> Response {
    debug!(output = %name, value = req.value, "API request to set output");

    let entry = state.outputs.read().await.get(&name).cloned();
    let Some(entry) = entry else {
        return error_response(StatusCode::NOT_FOUND, format!("Output '{name}' not found"));
    };

    let mut actuator = entry.actuator.lock().await;
    if !actuator.accepts(req.value) {
        let range = actuator.range();
        let off = actuator
            .off_value()
            .map(|off| format!(" (or {off} for off)"))
            .unwrap_or_default();
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Value {} is outside {}..={} {}{off}",
                req.value,
                range.start(),
                range.end(),
                actuator.unit()
            ),
        );
    }

    match actuator.apply(req.value).await {
        Ok(applied) => {
            debug!(output = %name, requested = req.value, applied, "Output set");
            Json(SetOutputResponse {
                name,
                requested: req.value,
                applied,
                unit: actuator.unit().to_string(),
            })
            .into_response()
        }
        Err(e) => {
            error!(output = %name, value = req.value, error = %e, "Failed to set output");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to set '{name}': {e:#}"),
            )
        }
    }
}

/// Build the v1 API routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/echo", post(echo))
        .route("/health", get(health))
        .route("/drivers", get(list_drivers))
        .route("/devices", get(list_devices))
        .route("/devices/:name", get(get_device))
        .route("/outputs", get(list_outputs))
        .route("/outputs/:name", post(set_output))
        .with_state(state)
}

//! REST API handlers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use labscan_core::{DeviceKey, ExplicitCredentials};
use labscan_probe::KeyInstall;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::listing::ListQuery;
use crate::state::{AppState, StateError};

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

impl IntoResponse for StateError {
    fn into_response(self) -> Response {
        let status = match &self {
            StateError::NotFound(_) => StatusCode::NOT_FOUND,
            StateError::Invalid(_) => StatusCode::BAD_REQUEST,
            StateError::Probe(_) => StatusCode::BAD_GATEWAY,
            StateError::Cache(_) | StateError::Discovery(_) | StateError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(ApiError::new(self.to_string()))).into_response()
    }
}

/// Credentials supplied with a refresh or key install
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsBody {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl From<CredentialsBody> for ExplicitCredentials {
    fn from(body: CredentialsBody) -> Self {
        ExplicitCredentials {
            username: body.username,
            password: body.password,
        }
    }
}

/// Parse an optional JSON body; an empty body is `None`
fn optional_body<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, StateError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| StateError::Invalid(format!("invalid request body: {}", e)))
}

/// List devices with optional probing, filters and sorting
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.list(&query).await {
        Ok(listing) => Json(listing).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Get a specific device by key
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.device(&DeviceKey::new(key)).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Force re-verification of one device
pub async fn refresh_device(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let credentials = match optional_body::<CredentialsBody>(&body) {
        Ok(body) => body.map(ExplicitCredentials::from),
        Err(e) => return e.into_response(),
    };
    let key = DeviceKey::new(key);
    info!(device = %key, "Manual refresh requested");

    if let Err(e) = state.device(&key).await {
        // Configured devices may not have been probed yet
        if state.config().await.device(&key).is_none() {
            return e.into_response();
        }
    }

    match state.refresh(vec![key], credentials).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Identify the device answering at an address
pub async fn verify_ip(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let ip: Ipv4Addr = match ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            return StateError::Invalid(format!("'{}' is not an IPv4 address", ip)).into_response()
        }
    };
    let credentials = match optional_body::<CredentialsBody>(&body) {
        Ok(body) => body.map(ExplicitCredentials::from),
        Err(e) => return e.into_response(),
    };
    info!(ip = %ip, "Address verification requested");

    match state.verify_ip(ip, credentials).await {
        Ok(verification) => Json(verification).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    /// New friendly name; null or empty clears it
    #[serde(default)]
    name: Option<String>,
}

pub async fn set_name(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<NameRequest>,
) -> impl IntoResponse {
    match state.rename(DeviceKey::new(key), req.name).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ControlledByRequest {
    /// Key of the power switch; null clears the link
    #[serde(default)]
    switch: Option<String>,
}

pub async fn set_controlled_by(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<ControlledByRequest>,
) -> impl IntoResponse {
    let switch = req
        .switch
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(DeviceKey::new);
    match state.link(DeviceKey::new(key), switch).await {
        Ok(device) => Json(device).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheCredentialRequest {
    username: String,
    #[serde(default)]
    password: Option<String>,
}

pub async fn cache_credential(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<CacheCredentialRequest>,
) -> impl IntoResponse {
    match state
        .cache_credential(DeviceKey::new(key), req.username, req.password)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct InstallKeyResponse {
    device: DeviceKey,
    installed: bool,
    already_installed: bool,
}

/// Copy the local public key to a device
pub async fn install_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let credentials = match optional_body::<CredentialsBody>(&body) {
        Ok(body) => body.unwrap_or_default().into(),
        Err(e) => return e.into_response(),
    };
    let key = DeviceKey::new(key);

    match state.install_key(key.clone(), credentials).await {
        Ok(outcome) => Json(InstallKeyResponse {
            device: key,
            installed: outcome == KeyInstall::Installed,
            already_installed: outcome == KeyInstall::AlreadyInstalled,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Get power control relationships
pub async fn get_topology(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.topology().await {
        Ok(topology) => Json(topology.links().cloned().collect::<Vec<_>>()).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Re-read the configuration file
pub async fn reload_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.reload().await {
        Ok(config) => Json(serde_json::json!({
            "status": "reloaded",
            "devices": config.devices.len(),
            "target_network": config.discovery.target_network,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

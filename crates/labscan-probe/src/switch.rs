//! Smart power switch probe over the Tasmota web API

use labscan_core::PowerState;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ProbeError;

/// Default web API port
pub const HTTP_PORT: u16 = 80;

/// Key only present in a Tasmota `Status 0` answer
const SIGNATURE: &str = "\"StatusFWR\"";

const STATUS_ALL: &str = "/cm?cmnd=Status%200";
const POWER: &str = "/cm?cmnd=Power";
const STATUS_SENSORS: &str = "/cm?cmnd=Status%2010";

/// What a matching switch reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwitchStatus {
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub firmware_version: Option<String>,
    /// Friendly name configured on the switch, usually the powered device
    pub load_name: Option<String>,
    pub power_state: Option<PowerState>,
    pub power_watts: Option<f64>,
}

/// HTTP signature probe for Tasmota switches
#[derive(Debug, Clone)]
pub struct SwitchProbe {
    client: reqwest::Client,
    port: u16,
}

impl SwitchProbe {
    pub fn new(port: u16) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client, port })
    }

    /// Identify a switch at `ip`.
    ///
    /// The status call decides the match. Power and energy readings come
    /// from follow-up calls whose failures only leave those fields empty.
    pub async fn probe(&self, ip: IpAddr, timeout: Duration) -> Result<SwitchStatus, ProbeError> {
        let deadline = Instant::now() + timeout;
        let base = format!("http://{}:{}", ip, self.port);

        let body = self.get(&base, STATUS_ALL, deadline).await?;
        let mut status = parse_status(&body)?;

        match self.get(&base, POWER, deadline).await {
            Ok(body) => status.power_state = parse_power(&body),
            Err(e) => debug!(ip = %ip, error = %e, "Switch power query failed"),
        }
        match self.get(&base, STATUS_SENSORS, deadline).await {
            Ok(body) => status.power_watts = parse_energy(&body),
            Err(e) => debug!(ip = %ip, error = %e, "Switch energy query failed"),
        }

        debug!(
            ip = %ip,
            hostname = ?status.hostname,
            power = ?status.power_state,
            watts = ?status.power_watts,
            "Identified power switch"
        );
        Ok(status)
    }

    async fn get(&self, base: &str, path: &str, deadline: Instant) -> Result<String, ProbeError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout);
        }

        let request = self
            .client
            .get(format!("{}{}", base, path))
            .timeout(remaining)
            .send();
        let response = tokio::time::timeout_at(deadline, request)
            .await
            .map_err(|_| ProbeError::Timeout)?
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(ProbeError::ProtocolMismatch(format!(
                "HTTP status {}",
                response.status()
            )));
        }

        tokio::time::timeout_at(deadline, response.text())
            .await
            .map_err(|_| ProbeError::Timeout)?
            .map_err(request_error)
    }
}

fn request_error(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout
    } else if e.is_connect() {
        ProbeError::Unreachable(e.to_string())
    } else {
        ProbeError::ProtocolMismatch(e.to_string())
    }
}

fn string_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse a `Status 0` answer; anything without the signature is not a switch
pub fn parse_status(body: &str) -> Result<SwitchStatus, ProbeError> {
    if !body.contains(SIGNATURE) {
        return Err(ProbeError::ProtocolMismatch(
            "no Tasmota signature in response".to_string(),
        ));
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProbeError::ProtocolMismatch(format!("invalid status JSON: {}", e)))?;

    let load_name = string_at(&value, "/Status/FriendlyName/0")
        .or_else(|| string_at(&value, "/Status/DeviceName"))
        .map(str::to_string);

    Ok(SwitchStatus {
        hostname: string_at(&value, "/StatusNET/Hostname").map(str::to_string),
        mac: string_at(&value, "/StatusNET/Mac").map(str::to_string),
        firmware_version: string_at(&value, "/StatusFWR/Version").map(str::to_string),
        load_name,
        power_state: None,
        power_watts: None,
    })
}

/// Parse a `Power` answer (`{"POWER":"ON"}` or `{"POWER1":"OFF"}`)
pub fn parse_power(body: &str) -> Option<PowerState> {
    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;
    object
        .get("POWER")
        .or_else(|| object.get("POWER1"))
        .and_then(Value::as_str)
        .and_then(PowerState::parse)
}

/// Parse a `Status 10` answer for the current draw in watts
pub fn parse_energy(body: &str) -> Option<f64> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.pointer("/StatusSNS/ENERGY/Power")?.as_f64()
}

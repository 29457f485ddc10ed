// Shelly smart plug telemetry source (HTTP polling) and payload decoders
use crate::application::errors::TelemetryError;
use crate::application::telemetry_source::TelemetrySource;
use crate::infrastructure::config::DeviceEndpoint;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Gen2+ `Shelly.GetStatus` response, reduced to the first switch.
#[derive(Debug, Deserialize)]
struct Gen2Status {
    #[serde(rename = "switch:0")]
    switch: Option<SwitchStatus>,
}

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    #[serde(default)]
    apower: Option<f64>,
    #[serde(default)]
    current: Option<f64>,
}

/// Gen1 `/status` response.
#[derive(Debug, Deserialize)]
struct Gen1Status {
    #[serde(default)]
    meters: Vec<Gen1Meter>,
}

#[derive(Debug, Deserialize)]
struct Gen1Meter {
    #[serde(default)]
    power: Option<f64>,
}

/// Pushed `NotifyStatus` RPC event.
#[derive(Debug, Deserialize)]
struct RpcEvent {
    src: Option<String>,
    #[serde(default)]
    params: Option<Gen2Status>,
}

/// A reading decoded from a pushed event.
#[derive(Debug, Clone, PartialEq)]
pub struct PushedReading {
    pub device_id: String,
    pub power_watts: f64,
}

pub fn decode_gen2_status(body: &[u8]) -> Result<f64, TelemetryError> {
    let status: Gen2Status =
        serde_json::from_slice(body).map_err(|e| TelemetryError::Malformed(e.to_string()))?;
    Ok(status.switch.and_then(|s| s.apower).unwrap_or(0.0))
}

pub fn decode_gen1_status(body: &[u8]) -> Result<f64, TelemetryError> {
    let status: Gen1Status =
        serde_json::from_slice(body).map_err(|e| TelemetryError::Malformed(e.to_string()))?;
    Ok(status.meters.first().and_then(|m| m.power).unwrap_or(0.0))
}

/// Decodes a `NotifyStatus` event. Returns `None` for events that carry no
/// switch data (button presses, config changes).
///
/// Power comes from `apower` when the plug reports it, otherwise from the
/// measured current at `mains_voltage`, rounded to centiwatts.
pub fn decode_rpc_event(
    payload: &[u8],
    mains_voltage: f64,
) -> Result<Option<PushedReading>, TelemetryError> {
    let event: RpcEvent =
        serde_json::from_slice(payload).map_err(|e| TelemetryError::Malformed(e.to_string()))?;
    let device_id = event
        .src
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TelemetryError::Malformed("event has no src".to_string()))?;

    let Some(switch) = event.params.and_then(|p| p.switch) else {
        return Ok(None);
    };
    let power_watts = match (switch.apower, switch.current) {
        (Some(apower), _) => apower,
        (None, Some(amps)) => (mains_voltage * amps * 100.0).round() / 100.0,
        (None, None) => return Ok(None),
    };

    Ok(Some(PushedReading {
        device_id,
        power_watts,
    }))
}

#[derive(Debug, Clone)]
pub struct ShellySource {
    client: reqwest::Client,
    endpoints: BTreeMap<String, String>,
}

impl ShellySource {
    pub fn new(endpoints: &[DeviceEndpoint], timeout: Duration) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Malformed(format!("http client: {}", e)))?;
        let endpoints = endpoints
            .iter()
            .map(|d| (d.id.clone(), d.url.trim_end_matches('/').to_string()))
            .collect();

        Ok(Self { client, endpoints })
    }

    async fn fetch(&self, device_id: &str, url: &str) -> Result<(StatusCode, Vec<u8>), TelemetryError> {
        let unreachable = |reason: String| TelemetryError::Unreachable {
            device_id: device_id.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        Ok((status, body.to_vec()))
    }
}

#[async_trait]
impl TelemetrySource for ShellySource {
    fn device_ids(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    async fn read_power(&self, device_id: &str) -> Result<f64, TelemetryError> {
        let base = self
            .endpoints
            .get(device_id)
            .ok_or_else(|| TelemetryError::Unreachable {
                device_id: device_id.to_string(),
                reason: "no endpoint configured".to_string(),
            })?;

        let (status, body) = self
            .fetch(device_id, &format!("{}/rpc/Shelly.GetStatus", base))
            .await?;
        if status.is_success() {
            return decode_gen2_status(&body);
        }

        // Gen1 firmware has no RPC endpoint
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(device_id, "Falling back to Gen1 status endpoint");
            let (status, body) = self.fetch(device_id, &format!("{}/status", base)).await?;
            if status.is_success() {
                return decode_gen1_status(&body);
            }
            return Err(TelemetryError::Unreachable {
                device_id: device_id.to_string(),
                reason: format!("gen1 status returned {}", status),
            });
        }

        Err(TelemetryError::Unreachable {
            device_id: device_id.to_string(),
            reason: format!("status request returned {}", status),
        })
    }
}

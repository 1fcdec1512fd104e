//! Fleet management API client.
//!
//! At startup the relay looks its device up by serial number to learn the
//! stream URL and identity, then reports the address viewers should use.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Device identity and stream settings as recorded by the fleet API.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceProfile {
    pub stream_url: String,
    pub display_name: String,
    pub category: String,
    pub serial: String,
    pub detection_classes: Vec<u32>,
    pub stream_is_on: bool,
}

#[derive(Debug, Deserialize)]
struct DeviceEnvelope {
    data: Option<DeviceData>,
}

#[derive(Debug, Deserialize)]
struct DeviceData {
    drone: Option<DeviceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRecord {
    #[serde(default)]
    stream_url: String,
    device_name: Option<String>,
    device_category: Option<String>,
    device_serial_number: Option<String>,
    #[serde(default)]
    detection_classes: Vec<u32>,
    #[serde(default)]
    stream_is_on: bool,
    metadata: Option<DeviceMetadata>,
}

#[derive(Debug, Deserialize)]
struct DeviceMetadata {
    alias: Option<String>,
}

impl DeviceProfile {
    /// Parse the `GET /sn/{serial}` response body.
    pub fn from_json(body: &str, requested_serial: &str) -> Result<Self> {
        let envelope: DeviceEnvelope =
            serde_json::from_str(body).context("invalid device response")?;
        let record = envelope
            .data
            .and_then(|data| data.drone)
            .ok_or_else(|| anyhow!("invalid device response: missing drone data"))?;

        let serial = record
            .device_serial_number
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| requested_serial.to_string());
        let stream_url = record.stream_url.trim().to_string();
        if stream_url.is_empty() || !stream_url.contains("://") {
            bail!(
                "no valid streamUrl recorded for device {}; set it before starting the relay",
                serial
            );
        }

        let alias = record
            .metadata
            .and_then(|m| m.alias)
            .filter(|alias| !alias.trim().is_empty());
        let display_name = alias
            .or(record.device_name)
            .unwrap_or_else(|| "Unknown Drone".to_string());

        Ok(Self {
            stream_url,
            display_name,
            category: record
                .device_category
                .unwrap_or_else(|| "Drone".to_string()),
            serial,
            detection_classes: record.detection_classes,
            stream_is_on: record.stream_is_on,
        })
    }
}

pub struct FleetClient {
    api_url: String,
    agent: ureq::Agent,
}

impl FleetClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
        }
    }

    fn device_url(&self, serial: &str) -> String {
        format!("{}/sn/{}", self.api_url, serial)
    }

    pub fn fetch_device(&self, serial: &str) -> Result<DeviceProfile> {
        let url = self.device_url(serial);
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => {
                bail!("device with serial number '{}' not found", serial)
            }
            Err(ureq::Error::Status(code, _)) => {
                bail!("device lookup failed with status {}", code)
            }
            Err(err) => return Err(anyhow!("device lookup at {} failed: {}", url, err)),
        };
        if response.status() != 200 {
            bail!("device lookup failed with status {}", response.status());
        }
        let body = response
            .into_string()
            .context("read device response body")?;
        DeviceProfile::from_json(&body, serial)
    }

    /// Record the relay's viewer address for this device.
    pub fn report_webrtc_url(&self, serial: &str, webrtc_url: &str) -> Result<()> {
        let url = self.device_url(serial);
        match self
            .agent
            .request("PATCH", &url)
            .send_json(json!({ "webRTCUrl": webrtc_url }))
        {
            Ok(response) if response.status() == 200 => Ok(()),
            Ok(response) => bail!("webRTCUrl update returned status {}", response.status()),
            Err(ureq::Error::Status(code, _)) => bail!("webRTCUrl update returned status {}", code),
            Err(err) => Err(anyhow!("webRTCUrl update at {} failed: {}", url, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_profile_preferring_alias() -> Result<()> {
        let body = r#"{"data":{"drone":{
            "streamUrl":" rtsp://10.0.0.7:8554/live ",
            "deviceName":"DJI M30",
            "deviceCategory":"Drone",
            "deviceSerialNumber":"SN-77",
            "detectionClasses":[0,2],
            "streamIsOn":true,
            "metadata":{"alias":"Roof East"}
        }}}"#;
        let profile = DeviceProfile::from_json(body, "SN-77")?;
        assert_eq!(profile.stream_url, "rtsp://10.0.0.7:8554/live");
        assert_eq!(profile.display_name, "Roof East");
        assert_eq!(profile.detection_classes, vec![0, 2]);
        assert!(profile.stream_is_on);
        Ok(())
    }

    #[test]
    fn falls_back_to_device_name_and_defaults() -> Result<()> {
        let body = r#"{"data":{"drone":{"streamUrl":"rtsp://cam/live","deviceName":"Mavic"}}}"#;
        let profile = DeviceProfile::from_json(body, "SN-1")?;
        assert_eq!(profile.display_name, "Mavic");
        assert_eq!(profile.category, "Drone");
        assert_eq!(profile.serial, "SN-1");
        assert!(!profile.stream_is_on);
        assert!(profile.detection_classes.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_missing_stream_url_or_drone() {
        let no_url = r#"{"data":{"drone":{"deviceName":"Mavic","streamUrl":"  "}}}"#;
        assert!(DeviceProfile::from_json(no_url, "SN-1").is_err());
        let no_scheme = r#"{"data":{"drone":{"streamUrl":"10.0.0.7/live"}}}"#;
        assert!(DeviceProfile::from_json(no_scheme, "SN-1").is_err());
        assert!(DeviceProfile::from_json(r#"{"data":{}}"#, "SN-1").is_err());
    }

    #[test]
    fn client_builds_device_url() {
        let client = FleetClient::new("http://api.local/api/v1/drones/");
        assert_eq!(client.device_url("SN-9"), "http://api.local/api/v1/drones/sn/SN-9");
    }
}

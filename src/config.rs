use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::labels::DEFAULT_SURVEILLANCE_CLASSES;
use crate::fleet::DeviceProfile;

const DEFAULT_STREAM_URL: &str = "stub://camera";
const DEFAULT_STREAM_NAME: &str = "RTSP Camera";
const DEFAULT_STREAM_DEVICE: &str = "Drone";
const DEFAULT_DEVICE_SERIAL: &str = "UNKNOWN";
const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
const DEFAULT_SERVER_PORT: u16 = 6080;
const DEFAULT_PUBLIC_HOST: &str = "localhost";
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_PUBLISH_FPS: u32 = 30;
const DEFAULT_PUBLISH_JPEG_QUALITY: u8 = 80;
const DEFAULT_OUTPUT_WIDTH: u32 = 640;
const DEFAULT_OUTPUT_HEIGHT: u32 = 480;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_PROCESS_EVERY_N: u32 = 1;
const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 3;
const DEFAULT_WATCHDOG_TIMEOUT_SECS: u64 = 15;
const DEFAULT_STALL_GRACE_SECS: u64 = 5;
const DEFAULT_NOTIFY_ENDPOINT: &str = "http://127.0.0.1:9000/notify";
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_NOTIFY_QUEUE: usize = 64;
const DEFAULT_COOLDOWN_SECS: f64 = 30.0;
const DEFAULT_SPATIAL_THRESHOLD_PX: f32 = 150.0;
const DEFAULT_FLEET_API_URL: &str = "http://127.0.0.1:5000/api/v1/drones";

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    stream: Option<StreamConfigFile>,
    server: Option<ServerConfigFile>,
    capture: Option<CaptureConfigFile>,
    detector: Option<DetectorConfigFile>,
    watchdog: Option<WatchdogConfigFile>,
    notify: Option<NotifyConfigFile>,
    fleet_api_url: Option<String>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    name: Option<String>,
    device_type: Option<String>,
    serial: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    host: Option<String>,
    port: Option<u16>,
    public_host: Option<String>,
    ice_servers: Option<Vec<String>>,
    publish_fps: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    reconnect_delay_secs: Option<u64>,
    open_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    output_width: Option<u32>,
    output_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<String>,
    model_input: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    classes: Option<Vec<u32>>,
    process_every_n_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchdogConfigFile {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
    stall_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    endpoint: Option<String>,
    timeout_secs: Option<u64>,
    queue_capacity: Option<usize>,
    cooldown_secs: Option<f64>,
    spatial_threshold_px: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub stream: StreamSettings,
    pub server: ServerSettings,
    pub capture: CaptureSettings,
    pub detector: DetectorSettings,
    pub watchdog: WatchdogSettings,
    pub notify: NotifySettings,
    pub fleet_api_url: String,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub name: String,
    pub device_type: String,
    pub serial: String,
}

impl StreamSettings {
    pub fn has_known_serial(&self) -> bool {
        !self.serial.is_empty() && self.serial != DEFAULT_DEVICE_SERIAL
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub public_host: String,
    pub ice_servers: Vec<String>,
    pub publish_fps: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub reconnect_delay: Duration,
    pub open_timeout: Duration,
    pub read_timeout: Duration,
    pub output_width: u32,
    pub output_height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: String,
    pub model_input: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub classes: Vec<u32>,
    pub process_every_n_frames: u32,
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub stall_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub endpoint: String,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub cooldown: Duration,
    pub spatial_threshold_px: f32,
}

impl RelayConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RELAY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let stream = file.stream.unwrap_or_default();
        let server = file.server.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let watchdog = file.watchdog.unwrap_or_default();
        let notify = file.notify.unwrap_or_default();
        let cooldown_secs = notify.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS);
        let cooldown = Duration::try_from_secs_f64(cooldown_secs).map_err(|_| {
            anyhow!(
                "notify.cooldown_secs must be a non-negative number of seconds, got {}",
                cooldown_secs
            )
        })?;

        Ok(Self {
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                name: stream.name.unwrap_or_else(|| DEFAULT_STREAM_NAME.to_string()),
                device_type: stream
                    .device_type
                    .unwrap_or_else(|| DEFAULT_STREAM_DEVICE.to_string()),
                serial: stream
                    .serial
                    .unwrap_or_else(|| DEFAULT_DEVICE_SERIAL.to_string()),
            },
            server: ServerSettings {
                host: server.host.unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
                port: server.port.unwrap_or(DEFAULT_SERVER_PORT),
                public_host: server
                    .public_host
                    .unwrap_or_else(|| DEFAULT_PUBLIC_HOST.to_string()),
                ice_servers: server
                    .ice_servers
                    .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.to_string()]),
                publish_fps: server.publish_fps.unwrap_or(DEFAULT_PUBLISH_FPS),
                jpeg_quality: server.jpeg_quality.unwrap_or(DEFAULT_PUBLISH_JPEG_QUALITY),
            },
            capture: CaptureSettings {
                reconnect_delay: Duration::from_secs(
                    capture
                        .reconnect_delay_secs
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
                ),
                open_timeout: Duration::from_secs(
                    capture.open_timeout_secs.unwrap_or(DEFAULT_OPEN_TIMEOUT_SECS),
                ),
                read_timeout: Duration::from_secs(
                    capture.read_timeout_secs.unwrap_or(DEFAULT_READ_TIMEOUT_SECS),
                ),
                output_width: capture.output_width.unwrap_or(DEFAULT_OUTPUT_WIDTH),
                output_height: capture.output_height.unwrap_or(DEFAULT_OUTPUT_HEIGHT),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
                model_path: detector
                    .model_path
                    .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
                model_input: detector.model_input.unwrap_or(DEFAULT_MODEL_INPUT),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE),
                iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU),
                classes: detector
                    .classes
                    .unwrap_or_else(|| DEFAULT_SURVEILLANCE_CLASSES.to_vec()),
                process_every_n_frames: detector
                    .process_every_n_frames
                    .unwrap_or(DEFAULT_PROCESS_EVERY_N),
            },
            watchdog: WatchdogSettings {
                interval: Duration::from_secs(
                    watchdog
                        .interval_secs
                        .unwrap_or(DEFAULT_WATCHDOG_INTERVAL_SECS),
                ),
                timeout: Duration::from_secs(
                    watchdog.timeout_secs.unwrap_or(DEFAULT_WATCHDOG_TIMEOUT_SECS),
                ),
                stall_grace: Duration::from_secs(
                    watchdog.stall_grace_secs.unwrap_or(DEFAULT_STALL_GRACE_SECS),
                ),
            },
            notify: NotifySettings {
                endpoint: notify
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_NOTIFY_ENDPOINT.to_string()),
                timeout: Duration::from_secs(
                    notify.timeout_secs.unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS),
                ),
                queue_capacity: notify.queue_capacity.unwrap_or(DEFAULT_NOTIFY_QUEUE),
                cooldown,
                spatial_threshold_px: notify
                    .spatial_threshold_px
                    .unwrap_or(DEFAULT_SPATIAL_THRESHOLD_PX),
            },
            fleet_api_url: file
                .fleet_api_url
                .unwrap_or_else(|| DEFAULT_FLEET_API_URL.to_string()),
            font_path: file.font_path,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("RTSP_URL") {
            self.stream.url = url;
        }
        if let Some(name) = env_string("STREAM_NAME") {
            self.stream.name = name;
        }
        if let Some(device) = env_string("STREAM_DEVICE") {
            self.stream.device_type = device;
        }
        if let Some(serial) = env_string("DRONE_SERIAL") {
            self.stream.serial = serial;
        }
        if let Some(host) = env_string("WEB_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("WEB_SERVER_PORT")? {
            self.server.port = port;
        }
        if let Some(host) = env_string("PUBLIC_HOST") {
            self.server.public_host = host;
        }
        if let Some(endpoint) = env_string("NOTIFICATION_ENDPOINT") {
            self.notify.endpoint = endpoint;
        }
        if let Some(backend) = env_string("DETECTOR_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(model) = env_string("YOLO_MODEL") {
            self.detector.model_path = model;
        }
        if let Some(conf) = env_parse::<f32>("CONFIDENCE_THRESHOLD")? {
            self.detector.confidence_threshold = conf;
        }
        if let Some(iou) = env_parse::<f32>("NMS_THRESHOLD")? {
            self.detector.iou_threshold = iou;
        }
        if let Some(classes) = env_string("DETECTION_CLASSES") {
            self.detector.classes = parse_class_list(&classes)?;
        }
        if let Some(n) = env_parse::<u32>("PROCESS_EVERY_N_FRAMES")? {
            self.detector.process_every_n_frames = n;
        }
        if let Some(cooldown) = env_parse::<f64>("NOTIFICATION_COOLDOWN")? {
            self.notify.cooldown = Duration::try_from_secs_f64(cooldown)
                .map_err(|_| anyhow!("NOTIFICATION_COOLDOWN must be a non-negative number"))?;
        }
        if let Some(px) = env_parse::<f32>("SPATIAL_DISTANCE_THRESHOLD")? {
            self.notify.spatial_threshold_px = px;
        }
        if let Some(width) = env_parse::<u32>("OUTPUT_WIDTH")? {
            self.capture.output_width = width;
        }
        if let Some(height) = env_parse::<u32>("OUTPUT_HEIGHT")? {
            self.capture.output_height = height;
        }
        if let Some(secs) = env_parse::<u64>("RECONNECT_DELAY")? {
            self.capture.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("RTSP_TIMEOUT")? {
            self.capture.open_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CAPTURE_READ_TIMEOUT")? {
            self.capture.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("WATCHDOG_TIMEOUT")? {
            self.watchdog.timeout = Duration::from_secs(secs);
        }
        if let Some(path) = env_string("OVERLAY_FONT_PATH") {
            self.font_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_string("DRONE_API_URL") {
            self.fleet_api_url = url;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !self.stream.url.contains("://") {
            return Err(anyhow!(
                "stream url '{}' must include a scheme (rtsp://, stub://, ...)",
                self.stream.url
            ));
        }
        if self.capture.output_width == 0 || self.capture.output_height == 0 {
            return Err(anyhow!("output resolution must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("confidence threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            return Err(anyhow!("iou threshold must be within [0, 1]"));
        }
        if self.detector.process_every_n_frames == 0 {
            return Err(anyhow!("process_every_n_frames must be at least 1"));
        }
        if self.server.publish_fps == 0 {
            return Err(anyhow!("publish fps must be greater than zero"));
        }
        if self.watchdog.interval.is_zero() || self.watchdog.timeout.is_zero() {
            return Err(anyhow!("watchdog interval and timeout must be greater than zero"));
        }
        if self.notify.queue_capacity == 0 {
            return Err(anyhow!("notification queue capacity must be greater than zero"));
        }
        self.server.jpeg_quality = self.server.jpeg_quality.clamp(1, 100);
        Ok(())
    }

    /// Overlay a device profile from the fleet API.
    pub fn apply_device_profile(&mut self, profile: &DeviceProfile) {
        self.stream.url = profile.stream_url.clone();
        self.stream.name = profile.display_name.clone();
        self.stream.device_type = profile.category.clone();
        self.stream.serial = profile.serial.clone();
        if !profile.detection_classes.is_empty() {
            self.detector.classes = profile.detection_classes.clone();
        }
    }

    /// Address viewers use to reach this relay's clean feed.
    pub fn public_base_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.server.public_host, self.server.port, self.stream.serial
        )
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, raw)),
        None => Ok(None),
    }
}

fn parse_class_list(value: &str) -> Result<Vec<u32>> {
    split_csv(value)
        .iter()
        .map(|entry| {
            entry
                .parse()
                .map_err(|_| anyhow!("invalid class id '{}' in DETECTION_CLASSES", entry))
        })
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RelayConfig {
        RelayConfig::from_file(RelayConfigFile::default()).expect("default config")
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let mut cfg = defaults();
        cfg.validate()?;
        assert_eq!(cfg.capture.output_width, 640);
        assert_eq!(cfg.notify.cooldown, Duration::from_secs(30));
        assert_eq!(cfg.detector.classes.len(), 18);
        assert!(!cfg.stream.has_known_serial());
        Ok(())
    }

    #[test]
    fn class_list_parsing() -> Result<()> {
        assert_eq!(parse_class_list("0, 2,7,")?, vec![0, 2, 7]);
        assert!(parse_class_list("0,car").is_err());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_file_cooldown() -> Result<()> {
        for secs in [1e300, -5.0] {
            let file: RelayConfigFile =
                serde_json::from_value(serde_json::json!({ "notify": { "cooldown_secs": secs } }))?;
            assert!(RelayConfig::from_file(file).is_err(), "cooldown {} accepted", secs);
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_skip_factor() {
        let mut cfg = defaults();
        cfg.detector.process_every_n_frames = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn device_profile_overrides_stream_identity() {
        let mut cfg = defaults();
        cfg.apply_device_profile(&DeviceProfile {
            stream_url: "rtsp://10.0.0.5:8554/live".into(),
            display_name: "North Gate".into(),
            category: "Drone".into(),
            serial: "SN123".into(),
            detection_classes: vec![0],
            stream_is_on: true,
        });
        assert_eq!(cfg.stream.serial, "SN123");
        assert_eq!(cfg.detector.classes, vec![0]);
        assert_eq!(cfg.public_base_url(), "http://localhost:6080/SN123");
    }
}

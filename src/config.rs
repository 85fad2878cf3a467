use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::{normalize_ppe_kind, DEFAULT_REQUIRED_PPE};
use crate::notify::{ChannelConfig, DomainFilter};
use crate::pipeline::{PipelineOptions, MAX_RENDER_FPS};
use crate::poller::PollerOptions;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CAMERA_URL: &str = "stub://camera";
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_MAX_FRAME_KB: usize = 5 * 1024;
const MAX_FRAME_KB_LIMIT: usize = 64 * 1024;
const DEFAULT_DETECT_INTERVAL_MS: u64 = 500;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_RENDER_FPS: u32 = 15;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_RECONNECT_SECS: u64 = 3;
const DEFAULT_POLL_SECS: u64 = 60;
const DEFAULT_SETTLE_MS: u64 = 250;
const DEFAULT_PING_SECS: u64 = 30;
const DEFAULT_INBOX_CAPACITY: usize = 20;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    notifications: Option<NotificationConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    url: Option<String>,
    ws_url: Option<String>,
    token_path: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    id: Option<String>,
    domain_id: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    max_frame_kb: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    interval_ms: Option<u64>,
    confidence: Option<f32>,
    render_fps: Option<u32>,
    required_ppe: Option<Vec<String>>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct NotificationConfigFile {
    domain_ids: Option<Vec<String>>,
    reconnect_secs: Option<u64>,
    poll_secs: Option<u64>,
    settle_ms: Option<u64>,
    ping_secs: Option<u64>,
    capacity: Option<usize>,
    auto_reconnect: Option<bool>,
    alert_bell: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api_url: String,
    /// Derived from `api_url` (`http` -> `ws`, `https` -> `wss`) when unset.
    pub ws_url: String,
    pub token_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub camera_id: Option<String>,
    pub domain_id: Option<String>,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Largest JPEG accepted from an HTTP camera.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub interval: Duration,
    pub confidence: f32,
    pub render_fps: u32,
    pub required_ppe: Vec<String>,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub domains: DomainFilter,
    pub reconnect_interval: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub ping_interval: Duration,
    pub capacity: usize,
    pub auto_reconnect: bool,
    pub alert_bell: bool,
}

impl MonitorConfig {
    /// Defaults, then the file named by `PPE_CONFIG`, then `PPE_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PPE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Result<Self> {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let notifications = file.notifications.unwrap_or_default();

        let domains = match notifications.domain_ids {
            Some(ids) => DomainFilter::new(ids)?,
            None => DomainFilter::all(),
        };
        Ok(Self {
            api_url: api.url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            ws_url: api.ws_url.unwrap_or_default(),
            token_path: api.token_path,
            request_timeout: Duration::from_secs(
                api.timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                camera_id: camera.id,
                domain_id: camera.domain_id,
                target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                max_frame_bytes: camera
                    .max_frame_kb
                    .unwrap_or(DEFAULT_MAX_FRAME_KB)
                    .saturating_mul(1024),
            },
            detection: DetectionSettings {
                interval: Duration::from_millis(
                    detection.interval_ms.unwrap_or(DEFAULT_DETECT_INTERVAL_MS),
                ),
                confidence: detection.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                render_fps: detection.render_fps.unwrap_or(DEFAULT_RENDER_FPS),
                required_ppe: detection.required_ppe.unwrap_or_else(|| {
                    DEFAULT_REQUIRED_PPE.iter().map(|k| k.to_string()).collect()
                }),
                jpeg_quality: detection.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            notifications: NotificationSettings {
                domains,
                reconnect_interval: Duration::from_secs(
                    notifications.reconnect_secs.unwrap_or(DEFAULT_RECONNECT_SECS),
                ),
                poll_interval: Duration::from_secs(
                    notifications.poll_secs.unwrap_or(DEFAULT_POLL_SECS),
                ),
                settle_delay: Duration::from_millis(
                    notifications.settle_ms.unwrap_or(DEFAULT_SETTLE_MS),
                ),
                ping_interval: Duration::from_secs(
                    notifications.ping_secs.unwrap_or(DEFAULT_PING_SECS),
                ),
                capacity: notifications.capacity.unwrap_or(DEFAULT_INBOX_CAPACITY),
                auto_reconnect: notifications.auto_reconnect.unwrap_or(true),
                alert_bell: notifications.alert_bell.unwrap_or(false),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_value("PPE_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = env_value("PPE_WS_URL") {
            self.ws_url = url;
        }
        if let Some(path) = env_value("PPE_TOKEN_PATH") {
            self.token_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env_value("PPE_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(id) = env_value("PPE_CAMERA_ID") {
            self.camera.camera_id = Some(id);
        }
        if let Some(ids) = env_value("PPE_DOMAIN_IDS") {
            self.notifications.domains = DomainFilter::parse_csv(&ids)?;
        }
        if let Some(confidence) = env_parse::<f32>("PPE_CONFIDENCE", "a number")? {
            self.detection.confidence = confidence;
        }
        if let Some(ms) = env_parse::<u64>("PPE_DETECT_INTERVAL_MS", "an integer number of milliseconds")? {
            self.detection.interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("PPE_RECONNECT_SECS", "an integer number of seconds")? {
            self.notifications.reconnect_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PPE_POLL_SECS", "an integer number of seconds")? {
            self.notifications.poll_interval = Duration::from_secs(secs);
        }
        if let Some(flag) = env_value("PPE_AUTO_RECONNECT") {
            self.notifications.auto_reconnect = parse_flag(&flag)
                .ok_or_else(|| anyhow!("PPE_AUTO_RECONNECT must be true or false"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_url = self.api_url.trim().trim_end_matches('/').to_string();
        let api = url::Url::parse(&self.api_url)
            .with_context(|| format!("invalid api url '{}'", self.api_url))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(anyhow!("api url must be http(s), got '{}'", self.api_url));
        }

        if self.ws_url.trim().is_empty() {
            self.ws_url = derive_ws_url(&api)?;
        }
        self.ws_url = self.ws_url.trim().trim_end_matches('/').to_string();
        let ws = url::Url::parse(&self.ws_url)
            .with_context(|| format!("invalid websocket url '{}'", self.ws_url))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(anyhow!("websocket url must be ws(s), got '{}'", self.ws_url));
        }

        if let Some(id) = &self.camera.camera_id {
            crate::validate_id("camera", id)?;
        }
        if let Some(id) = &self.camera.domain_id {
            crate::validate_id("domain", id)?;
        }
        if self.camera.max_frame_bytes == 0 || self.camera.max_frame_bytes > MAX_FRAME_KB_LIMIT * 1024 {
            return Err(anyhow!(
                "camera max_frame_kb must be within 1..={}",
                MAX_FRAME_KB_LIMIT
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.confidence) {
            return Err(anyhow!(
                "confidence must be within 0.0..=1.0 (got {})",
                self.detection.confidence
            ));
        }
        if self.detection.interval.is_zero() {
            return Err(anyhow!("detection interval must be greater than zero"));
        }
        if !(1..=MAX_RENDER_FPS).contains(&self.detection.render_fps) {
            return Err(anyhow!(
                "render fps must be within 1..={} (got {})",
                MAX_RENDER_FPS,
                self.detection.render_fps
            ));
        }
        if !(1..=100).contains(&self.detection.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        let mut required: Vec<String> = self
            .detection
            .required_ppe
            .iter()
            .map(|kind| normalize_ppe_kind(kind))
            .filter(|kind| !kind.is_empty())
            .collect();
        required.sort();
        required.dedup();
        if required.is_empty() {
            return Err(anyhow!("required_ppe must name at least one equipment kind"));
        }
        self.detection.required_ppe = required;

        let n = &self.notifications;
        if n.reconnect_interval.is_zero() || n.poll_interval.is_zero() || n.ping_interval.is_zero() {
            return Err(anyhow!("notification intervals must be greater than zero"));
        }
        if n.capacity == 0 {
            return Err(anyhow!("notification capacity must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            interval: self.detection.interval,
            render_fps: self.detection.render_fps,
            confidence: self.detection.confidence,
            camera_id: self.camera.camera_id.clone(),
            domain_id: self.camera.domain_id.clone(),
            required_ppe: self.detection.required_ppe.clone(),
            jpeg_quality: self.detection.jpeg_quality,
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            ws_url: self.ws_url.clone(),
            reconnect_interval: self.notifications.reconnect_interval,
            settle_delay: self.notifications.settle_delay,
            auto_reconnect: self.notifications.auto_reconnect,
            ping_interval: self.notifications.ping_interval,
        }
    }

    pub fn poller_options(&self) -> PollerOptions {
        PollerOptions {
            interval: self.notifications.poll_interval,
            limit: u32::try_from(self.notifications.capacity).unwrap_or(u32::MAX),
            domains: self.notifications.domains.clone(),
        }
    }
}

fn derive_ws_url(api: &url::Url) -> Result<String> {
    let mut ws = api.clone();
    let scheme = if api.scheme() == "https" { "wss" } else { "ws" };
    ws.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive websocket url from '{}'", api))?;
    ws.set_query(None);
    Ok(ws.as_str().trim_end_matches('/').to_string())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str, what: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {} (got '{}')", key, what, raw)),
        None => Ok(None),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> MonitorConfig {
        let mut cfg = MonitorConfig::from_file(MonitorConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        cfg
    }

    #[test]
    fn defaults_match_reference_behaviour() {
        let cfg = defaults();
        assert_eq!(cfg.api_url, "http://127.0.0.1:8000");
        assert_eq!(cfg.ws_url, "ws://127.0.0.1:8000");
        assert_eq!(cfg.detection.interval, Duration::from_millis(500));
        assert_eq!(cfg.detection.confidence, 0.5);
        assert_eq!(cfg.detection.required_ppe, vec!["hardhat", "vest"]);
        assert_eq!(cfg.notifications.reconnect_interval, Duration::from_secs(3));
        assert_eq!(cfg.notifications.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.notifications.capacity, 20);
        assert!(cfg.notifications.auto_reconnect);
        assert_eq!(cfg.poller_options().limit, 20);
        assert_eq!(cfg.camera.max_frame_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn ws_url_follows_tls() {
        let api = url::Url::parse("https://ppe.example.com/").unwrap();
        assert_eq!(derive_ws_url(&api).unwrap(), "wss://ppe.example.com");
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut cfg = defaults();
        cfg.detection.confidence = 1.2;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.api_url = "ftp://host".into();
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.camera.camera_id = Some("cam one".into());
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.detection.required_ppe = vec![" ".into()];
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.detection.render_fps = 2000;
        assert!(cfg.validate().is_err());
        cfg.detection.render_fps = MAX_RENDER_FPS;
        assert!(cfg.validate().is_ok());

        let mut cfg = defaults();
        cfg.camera.max_frame_bytes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn flags_parse_loosely() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}

//! PPE Compliance Monitor client
//!
//! This crate implements the client side of a PPE (personal protective
//! equipment) compliance monitoring deployment. The backend owns inference,
//! persistence and authorization; this crate owns the two realtime flows that
//! sit in front of it:
//!
//! - **Detection/overlay pipeline** (`pipeline`): samples a live camera source,
//!   submits frames to the detection endpoint with at most one request in
//!   flight, maps responses into typed `Detection`s and paints an overlay.
//! - **Realtime notification channel** (`notify`): a reconnecting WebSocket
//!   client for violation push events, backed by a REST poller (`poller`) and
//!   an in-memory inbox (`inbox`).
//!
//! # Module Structure
//!
//! - `config`: layered daemon configuration (defaults, file, `PPE_*` env)
//! - `api`: REST client, error taxonomy, violation wire types
//! - `session`: bearer-token storage and forced-logout side channel
//! - `roles`: closed role enumeration and capability table
//! - `ingest`: frame sources (synthetic, HTTP MJPEG/JPEG)
//! - `detect`: detection data model and response mapping
//! - `overlay`: overlay rendering and JPEG encoding
//! - `pipeline`: capture, inference ticker and render loops
//! - `notify`: reconnecting notification socket
//! - `inbox`, `alert`, `poller`: notification list, urgent alerts, REST fallback
//! - Core types: `Severity`, id validation, timestamp parsing

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::OnceLock;

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod inbox;
pub mod ingest;
pub mod notify;
pub mod overlay;
pub mod pipeline;
pub mod poller;
pub mod roles;
pub mod session;

pub use alert::{AlertSink, LogAlertSink};
pub use api::{ApiClient, ApiError, ApiErrorKind, DetectionApi, Violation, ViolationFeed, ViolationQuery};
pub use config::MonitorConfig;
pub use detect::{BBox, Detection, DetectionOutcome, PpeItemStatus};
pub use frame::{Frame, FrameSlot};
pub use inbox::{NotificationCenter, NotificationInbox, NotificationItem};
pub use ingest::{open_source, FrameSource, MjpegSource, SyntheticSource};
pub use notify::{
    ChannelConfig, ChannelHandle, ConnectionStatus, DomainFilter, NotificationChannel,
    TungsteniteConnector,
};
pub use pipeline::{DetectionPipeline, FrameSink, PipelineHandle, PipelineOptions};
pub use poller::{FallbackPoller, PollerOptions};
pub use roles::{Capability, Role};
pub use session::{FileTokenStore, MemoryTokenStore, SessionEvent, SessionEvents, TokenStore};

// -------------------- Severity --------------------

/// Violation severity as reported by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and critical items raise an alert on arrival.
    pub fn is_urgent(self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Identifiers --------------------

/// Validates a camera or domain identifier before it is sent to the backend.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    static ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.:-]{1,64}$").expect("static id pattern")
    });
    if !re.is_match(id) {
        return Err(anyhow!(
            "{} id '{}' must be 1-64 chars of [A-Za-z0-9_.:-]",
            kind,
            id
        ));
    }
    Ok(())
}

/// Backend ids arrive as either JSON numbers or strings.
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

pub(crate) fn deserialize_opt_id<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

// -------------------- Timestamps --------------------

/// Parses backend timestamps. Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

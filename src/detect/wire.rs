//! Wire shapes of the detect-frame endpoint.
//!
//! The backend has shipped a few spellings of the same fields over time, so
//! these types accept aliases and fill defaults generously.

use serde::{Deserialize, Serialize};

use crate::Severity;

/// Response of `POST /api/v1/detection/detect-frame`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DetectFrameResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
    #[serde(default)]
    pub violations_recorded: Vec<RecordedViolation>,
    #[serde(default)]
    pub recording_stats: Option<RecordingStats>,
    /// `[height, width, channels]` of the frame the server decoded.
    #[serde(default)]
    pub frame_shape: Option<Vec<u32>>,
    #[serde(default)]
    pub smart_recording_enabled: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawDetection {
    #[serde(default, deserialize_with = "crate::deserialize_opt_id")]
    pub person_id: Option<String>,
    #[serde(default, deserialize_with = "crate::deserialize_opt_id")]
    pub track_id: Option<String>,
    pub bbox: WireBox,
    #[serde(default, alias = "detected_ppe")]
    pub ppe_detected: Vec<WirePpeItem>,
    #[serde(default)]
    pub missing_ppe: Vec<String>,
    #[serde(default)]
    pub is_compliant: Option<bool>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Either corner form `[x1, y1, x2, y2]` or origin/extent form.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireBox {
    Corners([f32; 4]),
    Rect {
        x: f32,
        y: f32,
        #[serde(alias = "width")]
        w: f32,
        #[serde(alias = "height")]
        h: f32,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct WirePpeItem {
    #[serde(alias = "type", alias = "class", alias = "class_name")]
    pub kind: String,
    #[serde(default)]
    pub confidence: f32,
}

/// A violation the server persisted while handling this frame.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecordedViolation {
    #[serde(deserialize_with = "crate::deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "crate::deserialize_opt_id")]
    pub person_id: Option<String>,
    #[serde(default)]
    pub violation_type: Option<String>,
    #[serde(default)]
    pub missing_ppe: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RecordingStats {
    #[serde(default, alias = "violations_recorded")]
    pub recorded: u64,
    #[serde(default, alias = "skipped_duplicates")]
    pub skipped: u64,
    #[serde(default)]
    pub cooldown_active: bool,
}

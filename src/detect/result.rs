use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::wire::{RecordedViolation, RecordingStats};

/// Bounding box in frame pixel coordinates (top-left origin).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Clamp to a `width` x `height` frame.
    ///
    /// The result satisfies `0 <= x <= W-1`, `0 <= y <= H-1`, `x + w <= W`,
    /// `y + h <= H` with non-negative extents. A box lying wholly outside the
    /// frame on either axis becomes empty at the nearest edge rather than a
    /// one-pixel sliver. A zero-sized frame yields an empty box at the origin.
    pub fn clamp_to(self, width: u32, height: u32) -> BBox {
        if width == 0 || height == 0 {
            return BBox::default();
        }
        let (x, w) = clamp_axis(self.x, self.w, width as f32);
        let (y, h) = clamp_axis(self.y, self.h, height as f32);
        BBox { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0.0 || self.h <= 0.0
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }
}

fn clamp_axis(start: f32, extent: f32, limit: f32) -> (f32, f32) {
    let start = if start.is_finite() { start } else { 0.0 };
    let extent = if extent.is_finite() { extent.max(0.0) } else { 0.0 };
    let lo = start.clamp(0.0, limit - 1.0);
    if start >= limit {
        return (lo, 0.0);
    }
    let hi = (start + extent).clamp(lo, limit);
    (lo, hi - lo)
}

/// Status of one equipment kind on one person.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PpeItemStatus {
    pub detected: bool,
    /// 0..=1
    pub confidence: f32,
}

/// A person detected in one frame, with per-equipment status.
///
/// Ephemeral: rebuilt every detection cycle and never persisted. Compliance
/// is derived from the upstream missing-PPE set and cannot be set directly.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub person_id: String,
    pub track_id: Option<String>,
    pub bbox: BBox,
    pub ppe_status: BTreeMap<String, PpeItemStatus>,
    missing_ppe: BTreeSet<String>,
    compliance: bool,
}

impl Detection {
    pub fn new(
        person_id: String,
        track_id: Option<String>,
        bbox: BBox,
        ppe_status: BTreeMap<String, PpeItemStatus>,
        missing_ppe: BTreeSet<String>,
    ) -> Self {
        let compliance = missing_ppe.is_empty();
        Self {
            person_id,
            track_id,
            bbox,
            ppe_status,
            missing_ppe,
            compliance,
        }
    }

    pub fn compliance(&self) -> bool {
        self.compliance
    }

    pub fn missing_ppe(&self) -> &BTreeSet<String> {
        &self.missing_ppe
    }
}

/// Everything one successful detection tick reports to its owner.
#[derive(Clone, Debug, Default)]
pub struct DetectionOutcome {
    pub detections: Vec<Detection>,
    pub violations_recorded: Vec<RecordedViolation>,
    pub recording_stats: Option<RecordingStats>,
    /// JPEG of the submitted frame with the overlay drawn on it.
    pub frame_snapshot: Option<Vec<u8>>,
}

impl DetectionOutcome {
    pub fn violation_count(&self) -> usize {
        self.detections.iter().filter(|d| !d.compliance()).count()
    }
}

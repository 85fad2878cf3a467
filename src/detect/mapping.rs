use std::collections::{BTreeMap, BTreeSet};

use super::result::{BBox, Detection, PpeItemStatus};
use super::wire::{RawDetection, WireBox};

/// Equipment every person is expected to wear unless configured otherwise.
pub const DEFAULT_REQUIRED_PPE: &[&str] = &["hardhat", "vest"];

/// Canonical equipment kind name.
///
/// Lowercases and folds the common spellings the detector emits.
pub fn normalize_ppe_kind(kind: &str) -> String {
    let lowered = kind.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    match lowered.as_str() {
        "hard_hat" | "helmet" | "safety_helmet" => "hardhat".to_string(),
        "safety_vest" | "hi_vis" | "hivis" | "reflective_vest" => "vest".to_string(),
        "glove" => "gloves".to_string(),
        "goggle" | "safety_glasses" => "goggles".to_string(),
        "mask" | "face_mask" => "mask".to_string(),
        _ => lowered,
    }
}

impl WireBox {
    pub fn to_bbox(self) -> BBox {
        match self {
            WireBox::Corners([x1, y1, x2, y2]) => {
                BBox::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
            }
            WireBox::Rect { x, y, w, h } => BBox::new(x, y, w, h),
        }
    }
}

/// Map raw detections into typed detections for a `width` x `height` frame.
///
/// An equipment kind counts as detected when it is absent from the missing
/// list or explicitly present in the detected list. Boxes are clamped to the
/// frame.
pub fn map_detections(
    raw: &[RawDetection],
    width: u32,
    height: u32,
    required_ppe: &[String],
) -> Vec<Detection> {
    raw.iter()
        .enumerate()
        .map(|(index, det)| map_detection(index, det, width, height, required_ppe))
        .collect()
}

fn map_detection(
    index: usize,
    raw: &RawDetection,
    width: u32,
    height: u32,
    required_ppe: &[String],
) -> Detection {
    let missing: BTreeSet<String> = raw
        .missing_ppe
        .iter()
        .map(|kind| normalize_ppe_kind(kind))
        .filter(|kind| !kind.is_empty())
        .collect();

    let mut detected: BTreeMap<String, f32> = BTreeMap::new();
    for item in &raw.ppe_detected {
        let kind = normalize_ppe_kind(&item.kind);
        if kind.is_empty() {
            continue;
        }
        let entry = detected.entry(kind).or_insert(0.0);
        *entry = entry.max(item.confidence.clamp(0.0, 1.0));
    }

    let mut kinds: BTreeSet<String> = required_ppe
        .iter()
        .map(|kind| normalize_ppe_kind(kind))
        .collect();
    kinds.extend(missing.iter().cloned());
    kinds.extend(detected.keys().cloned());

    let ppe_status = kinds
        .into_iter()
        .map(|kind| {
            let confidence = detected.get(&kind).copied();
            let status = PpeItemStatus {
                detected: !missing.contains(&kind) || confidence.is_some(),
                confidence: confidence.unwrap_or(0.0),
            };
            (kind, status)
        })
        .collect();

    if raw.is_compliant.is_some_and(|flag| flag != missing.is_empty()) {
        log::debug!(
            "detection {} reports is_compliant={:?} but missing set is {:?}; using missing set",
            index,
            raw.is_compliant,
            missing
        );
    }

    let person_id = raw
        .person_id
        .clone()
        .unwrap_or_else(|| format!("person-{}", index + 1));

    Detection::new(
        person_id,
        raw.track_id.clone(),
        raw.bbox.to_bbox().clamp_to(width, height),
        ppe_status,
        missing,
    )
}
